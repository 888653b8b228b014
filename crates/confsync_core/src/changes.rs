use std::sync::LazyLock;

use regex::bytes::Regex;

static OCTAL_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\[0-7]{3}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Renamed,
    Deleted,
    Modified,
    Untracked,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Renamed => "renamed",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
            Self::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeOptions {
    pub sync_root: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub uploads: Vec<ChangeRecord>,
    pub deletions: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletions.is_empty()
    }
}

/// Strip wrapping quotes and rewrite `\NNN` escapes back into raw bytes.
///
/// The version-control tool quotes paths outside the portable character set
/// and emits each non-ASCII byte as a backslash plus three octal digits.
/// Replacement is byte-wise, so adjacent escapes reassemble multi-byte UTF-8
/// sequences. Input without escapes passes through unchanged.
pub fn decode_path(token: &str) -> String {
    let token = if token.len() > 2 && token.starts_with('"') && token.ends_with('"') {
        &token[1..token.len() - 1]
    } else {
        token
    };
    if !token.contains('\\') {
        return token.to_string();
    }
    let decoded = OCTAL_ESCAPE_RE.replace_all(token.as_bytes(), |captures: &regex::bytes::Captures<'_>| {
        let value = captures[0][1..]
            .iter()
            .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
        vec![value as u8]
    });
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Parse one status line into typed records.
///
/// The status letter is checked in fixed priority order (added, renamed,
/// deleted, modified, untracked) so a line matching several prefixes resolves
/// to the first match. A rename line splits on the arrow token into exactly
/// two records: a delete for the old path and an add for the new path.
pub fn parse_status_line(line: &str) -> Vec<ChangeRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let kind = match classify(trimmed) {
        Some(kind) => kind,
        None => return Vec::new(),
    };
    if let Some((old, new)) = trimmed.split_once("->") {
        return vec![
            ChangeRecord {
                kind: ChangeKind::Deleted,
                path: extract_path(old),
            },
            ChangeRecord {
                kind: ChangeKind::Added,
                path: extract_path(new),
            },
        ];
    }
    vec![ChangeRecord {
        kind,
        path: extract_path(trimmed),
    }]
}

/// Paths from status-coded diff lines whose letter marks a deletion.
pub fn deletions_from_diff(diff_text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff_text.lines() {
        if !line.starts_with('D') {
            continue;
        }
        if let Some(field) = line.split('\t').nth(1) {
            paths.push(decode_path(field));
        }
    }
    paths
}

/// Merge the short status text with the status-coded diff text into upload
/// and delete candidates.
///
/// Deletions come from both sources (status records plus diff lines marked
/// deleted) without duplicates. A path present in the delete set never
/// becomes an upload candidate. When a sync root is configured, each record
/// is kept only if its decoded path starts with that root; the filter applies
/// per record, so the two halves of a rename can land on different sides of
/// the boundary.
pub fn collect_changes(status_text: &str, diff_text: &str, options: &ChangeOptions) -> ChangeSet {
    let mut records = Vec::new();
    for line in status_text.lines() {
        records.extend(parse_status_line(line));
    }

    let mut uploads: Vec<ChangeRecord> = Vec::new();
    let mut deletions: Vec<String> = Vec::new();

    for record in records {
        if !retained(&record.path, options) {
            continue;
        }
        match record.kind {
            ChangeKind::Deleted => {
                if !deletions.contains(&record.path) {
                    deletions.push(record.path);
                }
            }
            _ => uploads.push(record),
        }
    }

    for path in deletions_from_diff(diff_text) {
        if retained(&path, options) && !deletions.contains(&path) {
            deletions.push(path);
        }
    }

    uploads.retain(|record| !deletions.contains(&record.path));

    ChangeSet { uploads, deletions }
}

fn classify(line: &str) -> Option<ChangeKind> {
    if line.starts_with('A') {
        Some(ChangeKind::Added)
    } else if line.starts_with('R') {
        Some(ChangeKind::Renamed)
    } else if line.starts_with('D') {
        Some(ChangeKind::Deleted)
    } else if line.starts_with('M') {
        Some(ChangeKind::Modified)
    } else if line.starts_with('?') {
        Some(ChangeKind::Untracked)
    } else {
        None
    }
}

fn extract_path(token: &str) -> String {
    let token = token.trim();
    // quoted paths may carry a status-code prefix before the opening quote
    if let Some(start) = token.find('"') {
        return decode_path(&token[start..]);
    }
    match token.rfind([' ', '\t']) {
        Some(index) => token[index + 1..].to_string(),
        None => token.to_string(),
    }
}

fn retained(path: &str, options: &ChangeOptions) -> bool {
    match &options.sync_root {
        Some(root) => path.starts_with(root.as_str()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ChangeKind, ChangeOptions, collect_changes, decode_path, deletions_from_diff,
        parse_status_line,
    };

    #[test]
    fn decode_path_reassembles_multibyte_escapes() {
        assert_eq!(decode_path(r"\346\200\241.md"), "怡.md");
        assert_eq!(decode_path(r"docs/pl\303\244ne.md"), "docs/pläne.md");
    }

    #[test]
    fn decode_path_strips_wrapping_quotes() {
        assert_eq!(decode_path("\"docs/pl\\303\\244ne.md\""), "docs/pläne.md");
        assert_eq!(decode_path("\"plain.md\""), "plain.md");
    }

    #[test]
    fn decode_path_passes_through_unescaped_input() {
        assert_eq!(decode_path("docs/setup.md"), "docs/setup.md");
        assert_eq!(decode_path(""), "");
        assert_eq!(decode_path("\"\""), "\"\"");
    }

    #[test]
    fn parse_classifies_by_first_letter_priority() {
        let records = parse_status_line("M  notes.md");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Modified);
        assert_eq!(records[0].path, "notes.md");

        let records = parse_status_line("A  docs/new.md");
        assert_eq!(records[0].kind, ChangeKind::Added);

        let records = parse_status_line("?? scratch.md");
        assert_eq!(records[0].kind, ChangeKind::Untracked);
        assert_eq!(records[0].path, "scratch.md");

        let records = parse_status_line("AM staged.md");
        assert_eq!(records[0].kind, ChangeKind::Added);
    }

    #[test]
    fn parse_skips_blank_and_unknown_lines() {
        assert!(parse_status_line("").is_empty());
        assert!(parse_status_line("   ").is_empty());
        assert!(parse_status_line("UU conflicted.md").is_empty());
    }

    #[test]
    fn rename_line_yields_delete_then_add() {
        let records = parse_status_line("R  old/page.md -> new/page.md");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ChangeKind::Deleted);
        assert_eq!(records[0].path, "old/page.md");
        assert_eq!(records[1].kind, ChangeKind::Added);
        assert_eq!(records[1].path, "new/page.md");
    }

    #[test]
    fn rename_sides_decode_quoting_independently() {
        let records = parse_status_line("R100 \"old name.md\" -> \"pl\\303\\244ne.md\"");
        assert_eq!(records[0].path, "old name.md");
        assert_eq!(records[1].path, "pläne.md");

        let records = parse_status_line("R90 bare.md -> \"quoted file.md\"");
        assert_eq!(records[0].path, "bare.md");
        assert_eq!(records[1].path, "quoted file.md");
    }

    #[test]
    fn deletions_from_diff_reads_tab_separated_deleted_lines() {
        let diff = "M\tkept.md\nD\tgone.md\nD\t\"pl\\303\\244ne.md\"\nA\tnew.md\n";
        let paths = deletions_from_diff(diff);
        assert_eq!(paths, vec!["gone.md".to_string(), "pläne.md".to_string()]);
    }

    #[test]
    fn collect_single_modified_file_is_one_upload() {
        let set = collect_changes("M  notes.md\n", "", &ChangeOptions::default());
        assert_eq!(set.uploads.len(), 1);
        assert_eq!(set.uploads[0].path, "notes.md");
        assert!(set.deletions.is_empty());
    }

    #[test]
    fn collect_merges_diff_deletions_without_duplicates() {
        let status = "D  gone.md\nM  kept.md\n";
        let diff = "D\tgone.md\nD\talso-gone.md\n";
        let set = collect_changes(status, diff, &ChangeOptions::default());
        assert_eq!(
            set.deletions,
            vec!["gone.md".to_string(), "also-gone.md".to_string()]
        );
        assert_eq!(set.uploads.len(), 1);
    }

    #[test]
    fn collect_drops_uploads_that_are_also_deleted() {
        let set = collect_changes("M  twice.md\n", "D\ttwice.md\n", &ChangeOptions::default());
        assert!(set.uploads.is_empty());
        assert_eq!(set.deletions, vec!["twice.md".to_string()]);
    }

    #[test]
    fn collect_ignores_trailing_empty_line() {
        let set = collect_changes("M  notes.md\n\n", "", &ChangeOptions::default());
        assert_eq!(set.uploads.len(), 1);
    }

    #[test]
    fn sync_root_filter_applies_per_record() {
        let options = ChangeOptions {
            sync_root: Some("docs/".to_string()),
        };
        let set = collect_changes("R  docs/old.md -> other/new.md\n", "", &options);
        assert_eq!(set.deletions, vec!["docs/old.md".to_string()]);
        assert!(set.uploads.is_empty());

        let set = collect_changes("R  other/old.md -> docs/new.md\n", "", &options);
        assert!(set.deletions.is_empty());
        assert_eq!(set.uploads.len(), 1);
        assert_eq!(set.uploads[0].path, "docs/new.md");
    }
}
