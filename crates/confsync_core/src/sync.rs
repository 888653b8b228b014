use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;

use crate::changes::{ChangeKind, ChangeOptions, ChangeSet};
use crate::config::SyncConfig;
use crate::confluence::{ConfluenceClient, DeleteOutcome, PageStore};
use crate::git;
use crate::hierarchy::{self, HierarchyOptions, PageDescriptor};
use crate::render::{self, Rendered};

/// How many files to convert and upload at a time, per queue.
pub const PARALLELISM: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub sync_root: Option<String>,
    pub base_parent: Option<String>,
    pub use_document_title: bool,
    pub hard_wraps: bool,
    pub exclude_patterns: Vec<String>,
    pub dry_run: bool,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            sync_root: config.sync_root(),
            base_parent: config.base_parent(),
            ..Self::default()
        }
    }

    fn hierarchy_options(&self) -> HierarchyOptions {
        HierarchyOptions {
            sync_root: self.sync_root.clone(),
            base_parent: self.base_parent.clone(),
            use_document_title: self.use_document_title,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncPageResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub dry_run: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub pages: Vec<SyncPageResult>,
    pub request_count: usize,
}

impl SyncReport {
    fn new(dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            errors: Vec::new(),
            pages: Vec::new(),
            request_count: 0,
        }
    }
}

/// Detect working-tree changes and mirror them onto the remote wiki.
pub fn sync_to_remote(
    workdir: &Path,
    config: &SyncConfig,
    options: &SyncOptions,
) -> Result<SyncReport> {
    config.validate()?;
    let client = ConfluenceClient::new(
        &config.endpoint,
        &config.space,
        &config.username,
        &config.password,
    )?;
    sync_to_remote_with_store(workdir, options, &client)
}

fn sync_to_remote_with_store<S: PageStore>(
    workdir: &Path,
    options: &SyncOptions,
    store: &S,
) -> Result<SyncReport> {
    let changes = git::detect_changes(
        workdir,
        &ChangeOptions {
            sync_root: options.sync_root.clone(),
        },
    )?;
    publish_changes(workdir, &changes, options, store)
}

/// Apply one change set against the page store.
///
/// Deletions run first so the delete half of a rename always lands before
/// its add half. Ancestor pages are found or created one at a time, root
/// first; only then do the update and add queues fan out across workers.
/// A failing item contributes one error and never aborts the batch. With
/// dry-run set, the planned actions are reported and nothing is sent.
pub fn publish_changes<S: PageStore>(
    workdir: &Path,
    changes: &ChangeSet,
    options: &SyncOptions,
    store: &S,
) -> Result<SyncReport> {
    let mut report = SyncReport::new(options.dry_run);
    let excludes = compile_excludes(&options.exclude_patterns)?;
    let hierarchy_options = options.hierarchy_options();

    let mut delete_batch: Vec<PageDescriptor> = Vec::new();
    for path in &changes.deletions {
        let cascaded = hierarchy::cascade_empty_dirs(
            workdir,
            path,
            options.sync_root.as_deref(),
            &delete_batch,
        );
        delete_batch.extend(cascaded);
        delete_batch.push(hierarchy::resolve_deleted_page(path, &hierarchy_options));
    }

    let mut update_batch: Vec<PageDescriptor> = Vec::new();
    let mut add_batch: Vec<PageDescriptor> = Vec::new();
    for record in &changes.uploads {
        fs::metadata(workdir.join(&record.path))
            .with_context(|| format!("failed to stat {}", record.path))?;
        if !record.path.ends_with(".md") {
            continue;
        }
        if let Some(pattern) = excluded_by(&excludes, &record.path) {
            report.skipped += 1;
            report.pages.push(SyncPageResult {
                title: record.path.clone(),
                action: "skipped".to_string(),
                detail: Some(format!("matches exclude pattern {}", pattern.as_str())),
            });
            continue;
        }
        let descriptor = hierarchy::resolve_page(workdir, &record.path, &hierarchy_options)?;
        match record.kind {
            ChangeKind::Modified => update_batch.push(descriptor),
            _ => add_batch.push(descriptor),
        }
    }

    if options.dry_run {
        let planned = delete_batch
            .iter()
            .map(|descriptor| (descriptor, "would_delete"))
            .chain(update_batch.iter().map(|descriptor| (descriptor, "would_update")))
            .chain(add_batch.iter().map(|descriptor| (descriptor, "would_create")));
        for (descriptor, action) in planned {
            report.pages.push(SyncPageResult {
                title: descriptor.title.clone(),
                action: action.to_string(),
                detail: Some(descriptor.path.clone()),
            });
        }
        report.request_count = store.request_count();
        return Ok(report);
    }

    for descriptor in &delete_batch {
        match store.delete_page(&descriptor.title, None) {
            Ok(DeleteOutcome::Deleted) => {
                report.deleted += 1;
                report.pages.push(SyncPageResult {
                    title: descriptor.title.clone(),
                    action: "deleted".to_string(),
                    detail: None,
                });
            }
            Ok(DeleteOutcome::NotFound) => {
                report.skipped += 1;
                report.pages.push(SyncPageResult {
                    title: descriptor.title.clone(),
                    action: "skipped".to_string(),
                    detail: Some("no matching remote page".to_string()),
                });
            }
            Err(error) => {
                report.errors.push(format!("{}: {error}", descriptor.path));
                report.pages.push(SyncPageResult {
                    title: descriptor.title.clone(),
                    action: "error".to_string(),
                    detail: Some("delete failed".to_string()),
                });
            }
        }
    }

    let ready_updates = resolve_batch_ancestors(update_batch, store, &mut report);
    let ready_adds = resolve_batch_ancestors(add_batch, store, &mut report);

    if !ready_updates.is_empty() || !ready_adds.is_empty() {
        let update_pool = ThreadPoolBuilder::new()
            .num_threads(PARALLELISM)
            .build()
            .context("failed to build update worker pool")?;
        let add_pool = ThreadPoolBuilder::new()
            .num_threads(PARALLELISM)
            .build()
            .context("failed to build add worker pool")?;

        let (update_outcomes, add_outcomes) = rayon::join(
            || {
                update_pool.install(|| {
                    ready_updates
                        .par_iter()
                        .map(|descriptor| {
                            publish_update(workdir, descriptor, options.hard_wraps, store)
                        })
                        .collect::<Vec<_>>()
                })
            },
            || {
                add_pool.install(|| {
                    ready_adds
                        .par_iter()
                        .map(|descriptor| publish_add(workdir, descriptor, options.hard_wraps, store))
                        .collect::<Vec<_>>()
                })
            },
        );

        for outcome in update_outcomes.into_iter().chain(add_outcomes) {
            outcome.drain_into(&mut report);
        }
    }

    report.request_count = store.request_count();
    report.success = report.errors.is_empty();
    Ok(report)
}

/// Walk each parent chain root first, creating what is missing, and return
/// the descriptors with their immediate ancestor id filled in.
///
/// This stays single threaded: two workers racing down the same chain would
/// create duplicate parent pages.
fn resolve_batch_ancestors<S: PageStore>(
    batch: Vec<PageDescriptor>,
    store: &S,
    report: &mut SyncReport,
) -> Vec<PageDescriptor> {
    let mut ready = Vec::with_capacity(batch.len());
    for mut descriptor in batch {
        match find_or_create_ancestors(&descriptor, store) {
            Ok(ancestor_id) => {
                descriptor.ancestor_id = ancestor_id;
                ready.push(descriptor);
            }
            Err(error) => {
                report.errors.push(format!("{}: {error}", descriptor.path));
                report.pages.push(SyncPageResult {
                    title: descriptor.title.clone(),
                    action: "error".to_string(),
                    detail: Some("ancestor resolution failed".to_string()),
                });
            }
        }
    }
    ready
}

pub(crate) fn find_or_create_ancestors<S: PageStore>(
    descriptor: &PageDescriptor,
    store: &S,
) -> Result<Option<String>> {
    let mut ancestor_id: Option<String> = None;
    for parent in &descriptor.parents {
        let page = match store.find_page(parent, ancestor_id.as_deref())? {
            Some(page) => page,
            None => store.create_page(parent, ancestor_id.as_deref(), "")?,
        };
        ancestor_id = Some(page.id);
    }
    Ok(ancestor_id)
}

pub(crate) struct UploadOutcome {
    pub(crate) title: String,
    pub(crate) action: &'static str,
    pub(crate) detail: Option<String>,
    pub(crate) errors: Vec<String>,
}

impl UploadOutcome {
    fn new(title: &str, action: &'static str) -> Self {
        Self {
            title: title.to_string(),
            action,
            detail: None,
            errors: Vec::new(),
        }
    }

    fn failed(mut self, path: &str, error: anyhow::Error) -> Self {
        self.action = "error";
        self.errors.push(format!("{path}: {error}"));
        self
    }

    fn drain_into(self, report: &mut SyncReport) {
        match self.action {
            "created" => report.created += 1,
            "updated" => report.updated += 1,
            _ => {}
        }
        report.errors.extend(self.errors);
        report.pages.push(SyncPageResult {
            title: self.title,
            action: self.action.to_string(),
            detail: self.detail,
        });
    }
}

/// Re-render a modified file and write it over the existing remote page,
/// falling back to a create when the page has gone missing remotely.
pub(crate) fn publish_update<S: PageStore>(
    workdir: &Path,
    descriptor: &PageDescriptor,
    hard_wraps: bool,
    store: &S,
) -> UploadOutcome {
    let mut outcome = UploadOutcome::new(&descriptor.title, "updated");
    let rendered = match render_document(workdir, descriptor, hard_wraps) {
        Ok(rendered) => rendered,
        Err(error) => return outcome.failed(&descriptor.path, error),
    };
    let ancestor = descriptor.ancestor_id.as_deref();
    let existing = match store.find_page(&descriptor.title, ancestor) {
        Ok(existing) => existing,
        Err(error) => return outcome.failed(&descriptor.path, error),
    };
    let written = if existing.is_some() {
        store.update_page(&descriptor.title, ancestor, &rendered.body)
    } else {
        outcome.action = "created";
        store.create_page(&descriptor.title, ancestor, &rendered.body)
    };
    let page = match written {
        Ok(page) => page,
        Err(error) => return outcome.failed(&descriptor.path, error),
    };
    outcome.detail = Some(format!("{} -> {}", descriptor.location(), page.url));
    attach_images(workdir, &rendered.images, &page.id, store, &mut outcome);
    outcome
}

/// Render a newly added file and create its remote page directly, without
/// the lookup round trip.
pub(crate) fn publish_add<S: PageStore>(
    workdir: &Path,
    descriptor: &PageDescriptor,
    hard_wraps: bool,
    store: &S,
) -> UploadOutcome {
    let mut outcome = UploadOutcome::new(&descriptor.title, "created");
    let rendered = match render_document(workdir, descriptor, hard_wraps) {
        Ok(rendered) => rendered,
        Err(error) => return outcome.failed(&descriptor.path, error),
    };
    let created = store.create_page(
        &descriptor.title,
        descriptor.ancestor_id.as_deref(),
        &rendered.body,
    );
    let page = match created {
        Ok(page) => page,
        Err(error) => return outcome.failed(&descriptor.path, error),
    };
    outcome.detail = Some(format!("{} -> {}", descriptor.location(), page.url));
    attach_images(workdir, &rendered.images, &page.id, store, &mut outcome);
    outcome
}

fn render_document(
    workdir: &Path,
    descriptor: &PageDescriptor,
    hard_wraps: bool,
) -> Result<Rendered> {
    let text = fs::read_to_string(workdir.join(&descriptor.path))
        .with_context(|| format!("failed to read {}", descriptor.path))?;
    Ok(render::render_markdown(&descriptor.path, &text, hard_wraps))
}

/// Attachment failures stay per image; the page write already succeeded.
fn attach_images<S: PageStore>(
    workdir: &Path,
    images: &[String],
    page_id: &str,
    store: &S,
    outcome: &mut UploadOutcome,
) {
    for image in images {
        if let Err(error) = store.attach_file(page_id, &workdir.join(image)) {
            outcome.errors.push(format!("{image}: {error}"));
        }
    }
}

pub(crate) fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid exclude pattern: {pattern}"))
        })
        .collect()
}

pub(crate) fn excluded_by<'a>(excludes: &'a [Regex], path: &str) -> Option<&'a Regex> {
    excludes.iter().find(|regex| regex.is_match(path))
}
