use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Index document whose page takes the containing directory's name.
pub const INDEX_FILE: &str = "README.md";

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#[ \t]+(.+)$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct HierarchyOptions {
    pub sync_root: Option<String>,
    pub base_parent: Option<String>,
    pub use_document_title: bool,
}

/// One page-to-be, resolved from a markdown file or a cascaded directory.
///
/// `parents` runs root first, nearest parent last, and never contains the
/// sync root or an empty segment. `ancestor_id` stays `None` until the
/// parent chain has been resolved against the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub path: String,
    pub title: String,
    pub parents: Vec<String>,
    pub ancestor_id: Option<String>,
}

impl PageDescriptor {
    pub fn new(path: impl Into<String>, title: impl Into<String>, parents: Vec<String>) -> Self {
        Self {
            path: path.into(),
            title: title.into(),
            parents,
            ancestor_id: None,
        }
    }

    /// Slash-joined remote location, for reporting.
    pub fn location(&self) -> String {
        if self.parents.is_empty() {
            self.title.clone()
        } else {
            format!("{}/{}", self.parents.join("/"), self.title)
        }
    }
}

/// Resolve the page title and ancestor chain for a markdown file that is
/// being created or updated. `path` is relative to `workdir`.
///
/// An index file takes its containing directory's name as the title, and
/// that directory is dropped from the parent chain so the page does not
/// become its own parent. Every other file takes its base name without the
/// markdown extension. With `use_document_title` set, a level-1 heading in
/// the file content overrides the derived title; an unreadable file is an
/// error for the whole run, not a per-file skip.
pub fn resolve_page(workdir: &Path, path: &str, options: &HierarchyOptions) -> Result<PageDescriptor> {
    let base = basename(path);
    let mut title;
    let mut parents;
    if base == INDEX_FILE {
        title = match path.rsplit('/').nth(1) {
            Some(dir) => dir.to_string(),
            None => strip_markdown_ext(base).to_string(),
        };
        parents = parent_components(path, options.sync_root.as_deref());
        remove_last(&mut parents, &title);
    } else {
        title = strip_markdown_ext(base).to_string();
        parents = parent_components(path, options.sync_root.as_deref());
    }

    if options.use_document_title
        && let Some(doc_title) = document_title(&workdir.join(path))?
    {
        title = doc_title;
    }

    if let Some(base_parent) = &options.base_parent {
        parents = prefix_base_parent(base_parent, parents);
    }

    Ok(PageDescriptor::new(path, title, parents))
}

/// Resolve the descriptor for a file that no longer exists on disk.
///
/// Deleted files always take the plain file stem as the title. The content
/// is gone, so neither the index-file rule nor the document-title override
/// applies.
pub fn resolve_deleted_page(path: &str, options: &HierarchyOptions) -> PageDescriptor {
    let title = strip_markdown_ext(basename(path)).to_string();
    let mut parents = parent_components(path, options.sync_root.as_deref());
    if let Some(base_parent) = &options.base_parent {
        parents = prefix_base_parent(base_parent, parents);
    }
    PageDescriptor::new(path, title, parents)
}

/// Walk upward from a deleted file and queue every ancestor directory that
/// is now empty on disk.
///
/// Terminals, checked in order per directory: still has entries on disk,
/// already queued this run, or (after queueing) equal to the sync root. A
/// directory that cannot be listed counts as empty, since the deletion that
/// triggered the walk may have removed it entirely. Each step shortens the
/// path, so the walk always terminates.
pub fn cascade_empty_dirs(
    workdir: &Path,
    deleted_path: &str,
    sync_root: Option<&str>,
    already_queued: &[PageDescriptor],
) -> Vec<PageDescriptor> {
    let mut queued: Vec<PageDescriptor> = Vec::new();
    let mut current = match parent_dir(deleted_path) {
        Some(dir) => dir.to_string(),
        None => return queued,
    };

    loop {
        if !dir_is_empty(&workdir.join(&current)) {
            break;
        }
        if already_queued
            .iter()
            .chain(queued.iter())
            .any(|descriptor| descriptor.path == current)
        {
            break;
        }
        queued.push(PageDescriptor::new(
            current.clone(),
            basename(&current),
            Vec::new(),
        ));
        if sync_root.is_some_and(|root| root.trim_end_matches('/') == current) {
            break;
        }
        match parent_dir(&current) {
            Some(dir) => current = dir.to_string(),
            None => break,
        }
    }

    queued
}

/// First level-1 heading in the document, if any.
pub fn document_title(path: &Path) -> Result<Option<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read document title from {}", path.display()))?;
    Ok(HEADING_RE
        .captures(&text)
        .map(|captures| captures[1].trim_end().to_string()))
}

pub(crate) fn basename(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, base)) => base,
        None => path,
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

pub(crate) fn strip_markdown_ext(name: &str) -> &str {
    name.strip_suffix(".md").unwrap_or(name)
}

fn parent_components(path: &str, sync_root: Option<&str>) -> Vec<String> {
    let relative = match sync_root {
        Some(root) => path.strip_prefix(root).unwrap_or(path),
        None => path,
    };
    let dir = match relative.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => return Vec::new(),
    };
    dir.split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .map(str::to_string)
        .collect()
}

pub(crate) fn prefix_base_parent(base_parent: &str, parents: Vec<String>) -> Vec<String> {
    base_parent
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .chain(parents)
        .collect()
}

// the nearest directory is the one promoted to the title
fn remove_last(values: &mut Vec<String>, needle: &str) {
    if let Some(index) = values.iter().rposition(|value| value == needle) {
        values.remove(index);
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{
        HierarchyOptions, PageDescriptor, cascade_empty_dirs, document_title, resolve_deleted_page,
        resolve_page,
    };

    #[test]
    fn plain_file_takes_stem_and_directory_parents() {
        let page = resolve_page(Path::new("."), "docs/guide/setup.md", &HierarchyOptions::default())
            .expect("page");
        assert_eq!(page.title, "setup");
        assert_eq!(page.parents, vec!["docs".to_string(), "guide".to_string()]);
        assert_eq!(page.ancestor_id, None);
        assert_eq!(page.location(), "docs/guide/setup");
    }

    #[test]
    fn index_file_takes_directory_name_and_drops_it_from_parents() {
        let page = resolve_page(Path::new("."), "docs/guide/README.md", &HierarchyOptions::default())
            .expect("page");
        assert_eq!(page.title, "guide");
        assert_eq!(page.parents, vec!["docs".to_string()]);
    }

    #[test]
    fn top_level_index_file_falls_back_to_stem() {
        let page =
            resolve_page(Path::new("."), "README.md", &HierarchyOptions::default()).expect("page");
        assert_eq!(page.title, "README");
        assert!(page.parents.is_empty());
    }

    #[test]
    fn sync_root_is_stripped_from_parents() {
        let options = HierarchyOptions {
            sync_root: Some("docs/".to_string()),
            ..HierarchyOptions::default()
        };
        let page = resolve_page(Path::new("."), "docs/guide/setup.md", &options).expect("page");
        assert_eq!(page.parents, vec!["guide".to_string()]);

        // a root without a trailing slash leaves a leading separator behind
        let options = HierarchyOptions {
            sync_root: Some("docs".to_string()),
            ..HierarchyOptions::default()
        };
        let page = resolve_page(Path::new("."), "docs/guide/setup.md", &options).expect("page");
        assert_eq!(page.parents, vec!["guide".to_string()]);
    }

    #[test]
    fn base_parent_segments_are_prefixed_without_empties() {
        let options = HierarchyOptions {
            base_parent: Some("Team/Wiki/".to_string()),
            ..HierarchyOptions::default()
        };
        let page = resolve_page(Path::new("."), "docs/setup.md", &options).expect("page");
        assert_eq!(
            page.parents,
            vec!["Team".to_string(), "Wiki".to_string(), "docs".to_string()]
        );
    }

    #[test]
    fn document_title_overrides_derived_title() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("setup.md"),
            "intro text\n\n# Getting Started\n\nbody\n",
        )
        .expect("write");

        let options = HierarchyOptions {
            use_document_title: true,
            ..HierarchyOptions::default()
        };
        let page = resolve_page(dir.path(), "setup.md", &options).expect("page");
        assert_eq!(page.title, "Getting Started");
    }

    #[test]
    fn document_title_keeps_derived_title_when_no_heading() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("setup.md"), "no heading here\n").expect("write");

        let options = HierarchyOptions {
            use_document_title: true,
            ..HierarchyOptions::default()
        };
        let page = resolve_page(dir.path(), "setup.md", &options).expect("page");
        assert_eq!(page.title, "setup");
    }

    #[test]
    fn document_title_trims_trailing_whitespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("win.md");
        fs::write(&path, "# Windows Title \r\nbody\n").expect("write");

        let title = document_title(&path).expect("read");
        assert_eq!(title, Some("Windows Title".to_string()));
    }

    #[test]
    fn unreadable_file_fails_title_resolution() {
        let options = HierarchyOptions {
            use_document_title: true,
            ..HierarchyOptions::default()
        };
        let err = resolve_page(Path::new("."), "does/not/exist.md", &options).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.md"));
    }

    #[test]
    fn deleted_file_always_takes_stem_title() {
        let options = HierarchyOptions {
            sync_root: Some("docs/".to_string()),
            ..HierarchyOptions::default()
        };
        let page = resolve_deleted_page("docs/guide/README.md", &options);
        assert_eq!(page.title, "README");
        assert_eq!(page.parents, vec!["guide".to_string()]);
    }

    #[test]
    fn cascade_queues_empty_parent_and_stops_at_sync_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("old")).expect("mkdir");

        let queued = cascade_empty_dirs(dir.path(), "old/page.md", Some("old"), &[]);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].path, "old");
        assert_eq!(queued[0].title, "old");
    }

    #[test]
    fn cascade_stops_at_directories_with_remaining_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a/b")).expect("mkdir");
        fs::write(dir.path().join("a/keep.md"), "# Keep\n").expect("write");

        let queued = cascade_empty_dirs(dir.path(), "a/b/gone.md", None, &[]);
        let paths: Vec<&str> = queued.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a/b"]);
    }

    #[test]
    fn cascade_treats_unlistable_directories_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        // nothing created: the whole subtree is already gone from disk

        let queued = cascade_empty_dirs(dir.path(), "a/b/c/gone.md", None, &[]);
        let paths: Vec<&str> = queued.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn cascade_never_queues_the_same_directory_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("old")).expect("mkdir");

        let already = vec![PageDescriptor::new("old", "old", Vec::new())];
        let queued = cascade_empty_dirs(dir.path(), "old/other.md", Some("old"), &already);
        assert!(queued.is_empty());
    }
}
