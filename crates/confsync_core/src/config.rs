use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = ".confluence.json";

/// Endpoint value shipped in the sample configuration. A run keeping it
/// unchanged has not been configured yet.
pub const DEFAULT_ENDPOINT: &str = "https://mydomain.atlassian.net/wiki";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "PascalCase")]
pub struct SyncConfig {
    pub username: String,
    pub password: String,
    pub endpoint: String,
    pub space: String,
    pub parent: String,
    pub git_sync_dir: String,
    pub model: String,
}

impl SyncConfig {
    /// Directory restriction for incremental runs, when one is configured.
    pub fn sync_root(&self) -> Option<String> {
        if self.git_sync_dir.is_empty() {
            None
        } else {
            Some(self.git_sync_dir.clone())
        }
    }

    /// Top-level parent path every synced page hangs under, when configured.
    pub fn base_parent(&self) -> Option<String> {
        if self.parent.is_empty() {
            None
        } else {
            Some(self.parent.clone())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.space.is_empty() {
            bail!("a Confluence space key is required");
        }
        if self.username.is_empty() {
            bail!("a Confluence username is required");
        }
        if self.password.is_empty() {
            bail!("a Confluence password or API token is required");
        }
        if self.endpoint.is_empty() {
            bail!("a Confluence endpoint is required");
        }
        if self.endpoint == DEFAULT_ENDPOINT {
            bail!("the sample endpoint {DEFAULT_ENDPOINT} must be replaced with your own");
        }
        Ok(())
    }

    /// Overlay values from a key lookup; a non-empty hit wins over the file.
    fn overlay<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields: [(&str, &mut String); 7] = [
            ("CONFLUENCE_USERNAME", &mut self.username),
            ("CONFLUENCE_PASSWORD", &mut self.password),
            ("CONFLUENCE_ENDPOINT", &mut self.endpoint),
            ("CONFLUENCE_SPACE", &mut self.space),
            ("CONFLUENCE_PARENT", &mut self.parent),
            ("CONFLUENCE_GIT_SYNC_DIR", &mut self.git_sync_dir),
            ("CONFLUENCE_MODEL", &mut self.model),
        ];
        for (key, value) in fields {
            if let Some(hit) = lookup(key) {
                let trimmed = hit.trim().to_string();
                if !trimmed.is_empty() {
                    *value = trimmed;
                }
            }
        }
    }
}

/// Load the run configuration from `.confluence.json` in the working
/// directory, then apply environment overrides. A missing file yields the
/// all-default configuration.
pub fn load_config(workdir: &Path) -> Result<SyncConfig> {
    let path = workdir.join(CONFIG_FILE);
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        SyncConfig::default()
    };
    config.overlay(|key| env::var(key).ok());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{DEFAULT_ENDPOINT, SyncConfig, load_config};

    fn configured() -> SyncConfig {
        SyncConfig {
            username: "docs-bot".to_string(),
            password: "token".to_string(),
            endpoint: "https://team.atlassian.net/wiki".to_string(),
            space: "DOCS".to_string(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn missing_file_yields_the_default_configuration() {
        let temp = tempdir().expect("tempdir");
        let config = load_config(temp.path()).expect("load config");
        assert!(config.username.is_empty());
        assert!(config.sync_root().is_none());
        assert!(config.base_parent().is_none());
    }

    #[test]
    fn pascal_case_members_parse() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(".confluence.json"),
            r#"{
  "Username": "docs-bot",
  "Password": "token",
  "Endpoint": "https://team.atlassian.net/wiki",
  "Space": "DOCS",
  "Parent": "Engineering/Docs",
  "GitSyncDir": "wiki",
  "Model": "Git"
}"#,
        )
        .expect("write config");

        let config = load_config(temp.path()).expect("load config");
        assert_eq!(config.username, "docs-bot");
        assert_eq!(config.space, "DOCS");
        assert_eq!(config.base_parent().as_deref(), Some("Engineering/Docs"));
        assert_eq!(config.sync_root().as_deref(), Some("wiki"));
        assert_eq!(config.model, "Git");
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(".confluence.json"),
            r#"{"Space": "DOCS"}"#,
        )
        .expect("write config");

        let config = load_config(temp.path()).expect("load config");
        assert_eq!(config.space, "DOCS");
        assert!(config.endpoint.is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join(".confluence.json"), "{not json").expect("write config");

        let error = load_config(temp.path()).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn overlay_prefers_non_empty_hits() {
        let mut env = BTreeMap::new();
        env.insert("CONFLUENCE_USERNAME".to_string(), "from-env".to_string());
        env.insert("CONFLUENCE_SPACE".to_string(), "  ".to_string());
        let mut config = configured();

        config.overlay(|key| env.get(key).cloned());

        assert_eq!(config.username, "from-env");
        // blank values never clobber the file
        assert_eq!(config.space, "DOCS");
    }

    #[test]
    fn validation_walks_the_required_fields_in_order() {
        let error = SyncConfig::default().validate().expect_err("must fail");
        assert!(error.to_string().contains("space"));

        let mut config = configured();
        config.username.clear();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("username"));

        let mut config = configured();
        config.password.clear();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("password"));

        let mut config = configured();
        config.endpoint.clear();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("endpoint"));
    }

    #[test]
    fn sample_endpoint_is_rejected() {
        let mut config = configured();
        config.endpoint = DEFAULT_ENDPOINT.to_string();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("replaced"));
    }

    #[test]
    fn fully_configured_run_validates() {
        assert!(configured().validate().is_ok());
    }
}
