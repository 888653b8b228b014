use std::env;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{Value, json};

const DEFAULT_USER_AGENT: &str = "confsync/0.1 (+https://github.com/confsync)";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 350;
const MIN_REQUEST_GAP_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Remote page operations the publish pipeline runs against.
///
/// All pages live in one space fixed at client construction. Implementations
/// are shared across worker threads, so every method takes `&self`.
pub trait PageStore: Send + Sync {
    fn find_page(&self, title: &str, ancestor_id: Option<&str>) -> Result<Option<RemotePage>>;
    fn create_page(&self, title: &str, ancestor_id: Option<&str>, body: &str)
    -> Result<RemotePage>;
    fn update_page(&self, title: &str, ancestor_id: Option<&str>, body: &str)
    -> Result<RemotePage>;
    /// Absence of the page is an outcome, not an error.
    fn delete_page(&self, title: &str, ancestor_id: Option<&str>) -> Result<DeleteOutcome>;
    fn attach_file(&self, page_id: &str, file: &Path) -> Result<()>;
    /// Requests issued so far, including retries.
    fn request_count(&self) -> usize;
}

pub struct ConfluenceClient {
    client: Client,
    endpoint: String,
    space: String,
    username: String,
    password: String,
    user_agent: String,
    retries: usize,
    retry_delay_ms: u64,
    request_count: AtomicUsize,
    last_request_at: Mutex<Option<Instant>>,
}

impl ConfluenceClient {
    pub fn new(endpoint: &str, space: &str, username: &str, password: &str) -> Result<Self> {
        let timeout_ms = env_u64("CONFLUENCE_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS);
        let retries = env_usize("CONFLUENCE_HTTP_RETRIES", DEFAULT_RETRIES);
        let retry_delay_ms = env_u64("CONFLUENCE_HTTP_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS);
        let user_agent =
            env::var("CONFLUENCE_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            space: space.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            user_agent,
            retries,
            retry_delay_ms,
            request_count: AtomicUsize::new(0),
            last_request_at: Mutex::new(None),
        })
    }

    fn api_url(&self, suffix: &str) -> String {
        format!("{}/rest/api/content{}", self.endpoint, suffix)
    }

    fn page_from_value(&self, page: &Value) -> Result<RemotePage> {
        let id = value_id(page).ok_or_else(|| anyhow::anyhow!("page response missing id"))?;
        let url = page
            .get("_links")
            .and_then(|links| links.get("webui"))
            .and_then(Value::as_str)
            .map(|webui| format!("{}{webui}", self.endpoint))
            .unwrap_or_default();
        Ok(RemotePage { id, url })
    }

    /// Full search result for a page title, including the version field
    /// needed for updates.
    fn lookup_page(&self, title: &str) -> Result<Option<Value>> {
        let response = self.send_with_retry("find page", || {
            self.client.get(self.api_url("")).query(&[
                ("spaceKey", self.space.as_str()),
                ("title", title),
                ("expand", "version"),
            ])
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut payload: Value = response
            .json()
            .context("failed to decode page search response")?;
        let first = payload
            .get_mut("results")
            .and_then(Value::as_array_mut)
            .and_then(|results| (!results.is_empty()).then(|| results.remove(0)));
        Ok(first)
    }

    fn find_attachment(&self, page_id: &str, filename: &str) -> Result<Option<String>> {
        let response = self.send_with_retry("list attachments", || {
            self.client
                .get(self.api_url(&format!("/{page_id}/child/attachment")))
                .query(&[("filename", filename)])
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: Value = response
            .json()
            .context("failed to decode attachment listing")?;
        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(value_id))
    }

    fn page_payload(&self, title: &str, ancestor_id: Option<&str>, body: &str) -> Value {
        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": {"key": self.space},
            "body": {"storage": {"value": body, "representation": "storage"}},
        });
        if let Some(ancestor) = ancestor_id {
            payload["ancestors"] = json!([{"id": ancestor}]);
        }
        payload
    }

    /// Issue one request with retries, pacing, and the shared auth headers.
    ///
    /// Retries cover transport errors, throttling, and server errors with a
    /// linearly growing delay between attempts. A not-found status passes
    /// through so callers can treat absence as data rather than failure; any
    /// other non-success status fails the call.
    fn send_with_retry<F>(&self, action: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None::<String>;
        for attempt in 0..=self.retries {
            self.pace();
            let response = build()
                .basic_auth(&self.username, Some(&self.password))
                .header("User-Agent", self.user_agent.clone())
                .send();
            self.request_count.fetch_add(1, Ordering::Relaxed);

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        return Ok(response);
                    }
                    let body = response.text().unwrap_or_default();
                    let body = body.trim().chars().take(200).collect::<String>();
                    last_error = Some(format!("HTTP {} {}", status.as_u16(), body));
                    if is_retryable_status(status) && attempt < self.retries {
                        sleep(Duration::from_millis(
                            self.retry_delay_ms.saturating_mul(attempt as u64 + 1),
                        ));
                        continue;
                    }
                    break;
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < self.retries {
                        sleep(Duration::from_millis(
                            self.retry_delay_ms.saturating_mul(attempt as u64 + 1),
                        ));
                        continue;
                    }
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "request failed".to_string());
        bail!("{action}: {message}")
    }

    /// Keep a minimum gap between requests, across all worker threads.
    fn pace(&self) {
        let mut last = self.last_request_at.lock().unwrap();
        if let Some(instant) = *last {
            let min_gap = Duration::from_millis(MIN_REQUEST_GAP_MS);
            let elapsed = instant.elapsed();
            if elapsed < min_gap {
                sleep(min_gap - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

impl PageStore for ConfluenceClient {
    fn find_page(&self, title: &str, _ancestor_id: Option<&str>) -> Result<Option<RemotePage>> {
        match self.lookup_page(title)? {
            Some(page) => Ok(Some(self.page_from_value(&page)?)),
            None => Ok(None),
        }
    }

    fn create_page(
        &self,
        title: &str,
        ancestor_id: Option<&str>,
        body: &str,
    ) -> Result<RemotePage> {
        let payload = self.page_payload(title, ancestor_id, body);
        let response = self.send_with_retry("create page", || {
            self.client.post(self.api_url("")).json(&payload)
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("create page {title}: endpoint not found");
        }
        let page: Value = response
            .json()
            .context("failed to decode create page response")?;
        self.page_from_value(&page)
    }

    fn update_page(
        &self,
        title: &str,
        ancestor_id: Option<&str>,
        body: &str,
    ) -> Result<RemotePage> {
        let existing = self
            .lookup_page(title)?
            .ok_or_else(|| anyhow::anyhow!("page {title} not found for update"))?;
        let id = value_id(&existing)
            .ok_or_else(|| anyhow::anyhow!("page search result missing id"))?;
        let version = existing
            .get("version")
            .and_then(|version| version.get("number"))
            .and_then(Value::as_u64)
            .unwrap_or(1);

        let mut payload = self.page_payload(title, ancestor_id, body);
        payload["id"] = json!(id);
        payload["version"] = json!({"number": version + 1});

        let response = self.send_with_retry("update page", || {
            self.client
                .put(self.api_url(&format!("/{id}")))
                .json(&payload)
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("update page {title}: page {id} disappeared");
        }
        let page: Value = response
            .json()
            .context("failed to decode update page response")?;
        self.page_from_value(&page)
    }

    fn delete_page(&self, title: &str, _ancestor_id: Option<&str>) -> Result<DeleteOutcome> {
        let existing = match self.lookup_page(title)? {
            Some(page) => page,
            None => return Ok(DeleteOutcome::NotFound),
        };
        let id = value_id(&existing)
            .ok_or_else(|| anyhow::anyhow!("page search result missing id"))?;

        let response = self.send_with_retry("delete page", || {
            self.client.delete(self.api_url(&format!("/{id}")))
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        Ok(DeleteOutcome::Deleted)
    }

    fn attach_file(&self, page_id: &str, file: &Path) -> Result<()> {
        let filename = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                anyhow::anyhow!("attachment has no usable file name: {}", file.display())
            })?;
        let bytes = fs::read(file)
            .with_context(|| format!("failed to read attachment {}", file.display()))?;

        // same filename gets a new version instead of a duplicate attachment
        let url = match self.find_attachment(page_id, filename)? {
            Some(attachment_id) => {
                self.api_url(&format!("/{page_id}/child/attachment/{attachment_id}/data"))
            }
            None => self.api_url(&format!("/{page_id}/child/attachment")),
        };

        let filename = filename.to_string();
        let response = self.send_with_retry("upload attachment", || {
            let part = Part::bytes(bytes.clone()).file_name(filename.clone());
            self.client
                .post(&url)
                .header("X-Atlassian-Token", "nocheck")
                .multipart(Form::new().part("file", part))
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("attachment upload target page {page_id} not found");
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn value_id(value: &Value) -> Option<String> {
    match value.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConfluenceClient, is_retryable_status, value_id};

    fn client() -> ConfluenceClient {
        ConfluenceClient::new("https://wiki.example.com/wiki/", "DOC", "user", "secret")
            .expect("client")
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let client = client();
        assert_eq!(
            client.api_url("/123"),
            "https://wiki.example.com/wiki/rest/api/content/123"
        );
    }

    #[test]
    fn page_urls_join_webui_links_onto_the_endpoint() {
        let client = client();
        let page = client
            .page_from_value(&json!({
                "id": "42",
                "_links": {"webui": "/spaces/DOC/pages/42/Setup"},
            }))
            .expect("page");
        assert_eq!(page.id, "42");
        assert_eq!(
            page.url,
            "https://wiki.example.com/wiki/spaces/DOC/pages/42/Setup"
        );
    }

    #[test]
    fn numeric_page_ids_are_accepted() {
        assert_eq!(value_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(value_id(&json!({"id": "42"})), Some("42".to_string()));
        assert_eq!(value_id(&json!({"title": "x"})), None);
    }

    #[test]
    fn ancestors_are_only_set_when_present() {
        let client = client();
        let payload = client.page_payload("Setup", Some("7"), "<p>hi</p>");
        assert_eq!(payload["ancestors"][0]["id"], json!("7"));
        assert_eq!(payload["space"]["key"], json!("DOC"));

        let payload = client.page_payload("Setup", None, "<p>hi</p>");
        assert!(payload.get("ancestors").is_none());
    }

    #[test]
    fn retryable_statuses_cover_throttling_and_server_errors() {
        use reqwest::StatusCode;
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }
}
