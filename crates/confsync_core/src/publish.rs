use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::confluence::{ConfluenceClient, PageStore};
use crate::hierarchy::{self, HierarchyOptions, PageDescriptor};
use crate::sync::{PARALLELISM, compile_excludes, excluded_by, find_or_create_ancestors, publish_update};

/// Inputs for one publish run: files or directories of markdown,
/// resolved relative to the working directory.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sources: Vec<String>,
    pub title: Option<String>,
    pub base_parent: Option<String>,
    pub use_document_title: bool,
    pub hard_wraps: bool,
    pub exclude_patterns: Vec<String>,
    pub since_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishPageResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub success: bool,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PublishPageResult>,
    pub request_count: usize,
}

impl PublishReport {
    fn new() -> Self {
        Self {
            success: true,
            created: 0,
            updated: 0,
            skipped: 0,
            errors: Vec::new(),
            pages: Vec::new(),
            request_count: 0,
        }
    }
}

/// Push the given markdown sources to the remote wiki without consulting
/// version control.
pub fn publish_to_remote(
    workdir: &Path,
    config: &SyncConfig,
    options: &PublishOptions,
) -> Result<PublishReport> {
    config.validate()?;
    let client = ConfluenceClient::new(
        &config.endpoint,
        &config.space,
        &config.username,
        &config.password,
    )?;
    publish_to_remote_with_store(workdir, options, &client)
}

fn publish_to_remote_with_store<S: PageStore>(
    workdir: &Path,
    options: &PublishOptions,
    store: &S,
) -> Result<PublishReport> {
    if options.sources.is_empty() {
        bail!("pass a markdown file or a directory of markdown files");
    }
    if options.title.is_some() && options.sources.len() > 1 {
        bail!("a fixed title cannot cover multiple files");
    }

    let mut report = PublishReport::new();
    let excludes = compile_excludes(&options.exclude_patterns)?;
    let cutoff = options.since_minutes.and_then(|minutes| {
        SystemTime::now().checked_sub(Duration::from_secs(minutes.saturating_mul(60)))
    });

    let mut batch: Vec<PageDescriptor> = Vec::new();
    for source in &options.sources {
        let metadata = fs::metadata(workdir.join(source))
            .with_context(|| format!("failed to stat {source}"))?;
        if metadata.is_dir() {
            if options.title.is_some() {
                bail!("a fixed title is not supported for directories");
            }
            collect_directory(workdir, source, options, &excludes, cutoff, &mut batch, &mut report)?;
        } else {
            collect_file(workdir, source, options, &excludes, &mut batch, &mut report)?;
        }
    }

    let mut ready = Vec::with_capacity(batch.len());
    for mut descriptor in batch {
        match find_or_create_ancestors(&descriptor, store) {
            Ok(ancestor_id) => {
                descriptor.ancestor_id = ancestor_id;
                ready.push(descriptor);
            }
            Err(error) => {
                report.errors.push(format!("{}: {error}", descriptor.path));
                report.pages.push(PublishPageResult {
                    title: descriptor.title.clone(),
                    action: "error".to_string(),
                    detail: Some("ancestor resolution failed".to_string()),
                });
            }
        }
    }

    if !ready.is_empty() {
        let pool = ThreadPoolBuilder::new()
            .num_threads(PARALLELISM)
            .build()
            .context("failed to build upload worker pool")?;
        let outcomes = pool.install(|| {
            ready
                .par_iter()
                .map(|descriptor| publish_update(workdir, descriptor, options.hard_wraps, store))
                .collect::<Vec<_>>()
        });
        for outcome in outcomes {
            match outcome.action {
                "created" => report.created += 1,
                "updated" => report.updated += 1,
                _ => {}
            }
            report.errors.extend(outcome.errors);
            report.pages.push(PublishPageResult {
                title: outcome.title,
                action: outcome.action.to_string(),
                detail: outcome.detail,
            });
        }
    }

    report.request_count = store.request_count();
    report.success = report.errors.is_empty();
    Ok(report)
}

/// Collect every markdown file under `source`, with the walked directory
/// itself acting as the hierarchy root.
fn collect_directory(
    workdir: &Path,
    source: &str,
    options: &PublishOptions,
    excludes: &[Regex],
    cutoff: Option<SystemTime>,
    batch: &mut Vec<PageDescriptor>,
    report: &mut PublishReport,
) -> Result<()> {
    let hierarchy_options = HierarchyOptions {
        sync_root: Some(source.to_string()),
        base_parent: options.base_parent.clone(),
        use_document_title: options.use_document_title,
    };
    for entry in WalkDir::new(workdir.join(source)).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {source}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(workdir)
            .with_context(|| format!("walked outside {}", workdir.display()))?
            .to_string_lossy()
            .into_owned();
        if !relative.ends_with(".md") {
            continue;
        }
        if let Some(pattern) = excluded_by(excludes, &relative) {
            report.skipped += 1;
            report.pages.push(PublishPageResult {
                title: relative.clone(),
                action: "skipped".to_string(),
                detail: Some(format!("matches exclude pattern {}", pattern.as_str())),
            });
            continue;
        }
        if let Some(cutoff) = cutoff {
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to stat {relative}"))?;
            let modified = metadata
                .modified()
                .with_context(|| format!("failed to read modification time of {relative}"))?;
            if modified < cutoff {
                report.skipped += 1;
                continue;
            }
        }
        batch.push(hierarchy::resolve_page(workdir, &relative, &hierarchy_options)?);
    }
    Ok(())
}

/// A single explicit file keeps only the configured base parent as its
/// ancestor chain; the title comes from the override, the first heading,
/// or the file stem, in that order.
fn collect_file(
    workdir: &Path,
    source: &str,
    options: &PublishOptions,
    excludes: &[Regex],
    batch: &mut Vec<PageDescriptor>,
    report: &mut PublishReport,
) -> Result<()> {
    if !source.ends_with(".md") {
        return Ok(());
    }
    if let Some(pattern) = excluded_by(excludes, source) {
        report.skipped += 1;
        report.pages.push(PublishPageResult {
            title: source.to_string(),
            action: "skipped".to_string(),
            detail: Some(format!("matches exclude pattern {}", pattern.as_str())),
        });
        return Ok(());
    }

    let mut title = options.title.clone().unwrap_or_default();
    if title.is_empty()
        && options.use_document_title
        && let Some(doc_title) = hierarchy::document_title(&workdir.join(source))?
    {
        title = doc_title;
    }
    if title.is_empty() {
        title = hierarchy::strip_markdown_ext(hierarchy::basename(source)).to_string();
    }

    let parents = match &options.base_parent {
        Some(base_parent) => hierarchy::prefix_base_parent(base_parent, Vec::new()),
        None => Vec::new(),
    };
    batch.push(PageDescriptor::new(source, title, parents));
    Ok(())
}
