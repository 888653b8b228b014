use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::changes::{ChangeOptions, ChangeSet, collect_changes};

/// Run one git subcommand in `workdir` and capture its stdout.
///
/// A non-zero exit is an environment failure for the whole run, so it is
/// surfaced as an error carrying the subcommand and its stderr.
pub fn run_git(workdir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .output()
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Detect uncommitted changes in `workdir` and sort them into upload and
/// delete candidates.
///
/// The first status call is only an emptiness gate. Everything is then
/// staged, because renames only coalesce into single rename lines and
/// untracked files only appear in the diff once the index knows about them.
/// The staged status text feeds the line parser; the status-coded diff
/// against the last commit supplies the deletion side.
pub fn detect_changes(workdir: &Path, options: &ChangeOptions) -> Result<ChangeSet> {
    let gate = run_git(workdir, &["status", "--short"])?;
    if gate.trim().is_empty() {
        return Ok(ChangeSet::default());
    }

    run_git(workdir, &["add", "."])?;

    let status_text = run_git(workdir, &["status", "--short"])?;
    let diff_text = run_git(workdir, &["diff", "--name-status", "HEAD"])?;

    Ok(collect_changes(&status_text, &diff_text, options))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{detect_changes, run_git};
    use crate::changes::{ChangeKind, ChangeOptions};

    fn init_repo(dir: &Path) -> bool {
        if run_git(dir, &["init", "--quiet"]).is_err() {
            println!("git not available, skipping");
            return false;
        }
        run_git(dir, &["config", "user.email", "sync@example.com"]).expect("config email");
        run_git(dir, &["config", "user.name", "Sync Test"]).expect("config name");
        run_git(dir, &["config", "commit.gpgsign", "false"]).expect("config gpgsign");
        true
    }

    fn commit_all(dir: &Path) {
        run_git(dir, &["add", "."]).expect("stage");
        run_git(dir, &["commit", "--quiet", "-m", "snapshot"]).expect("commit");
    }

    #[test]
    fn run_git_reports_failed_subcommands() {
        let dir = tempfile::tempdir().expect("tempdir");
        if !init_repo(dir.path()) {
            return;
        }
        let err = run_git(dir.path(), &["no-such-subcommand"]).unwrap_err();
        assert!(err.to_string().contains("no-such-subcommand"));
    }

    #[test]
    fn clean_tree_yields_empty_change_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        if !init_repo(dir.path()) {
            return;
        }
        fs::write(dir.path().join("page.md"), "# Page\n").expect("write");
        commit_all(dir.path());

        let set = detect_changes(dir.path(), &ChangeOptions::default()).expect("detect");
        assert!(set.is_empty());
    }

    #[test]
    fn modified_and_new_files_become_uploads() {
        let dir = tempfile::tempdir().expect("tempdir");
        if !init_repo(dir.path()) {
            return;
        }
        fs::write(dir.path().join("page.md"), "# Page\n").expect("write");
        commit_all(dir.path());

        fs::write(dir.path().join("page.md"), "# Page\n\nmore\n").expect("rewrite");
        fs::write(dir.path().join("fresh.md"), "# Fresh\n").expect("write");

        let set = detect_changes(dir.path(), &ChangeOptions::default()).expect("detect");
        assert!(set.deletions.is_empty());
        let mut paths: Vec<&str> = set.uploads.iter().map(|r| r.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["fresh.md", "page.md"]);

        let fresh = set
            .uploads
            .iter()
            .find(|r| r.path == "fresh.md")
            .expect("fresh record");
        assert_eq!(fresh.kind, ChangeKind::Added);
    }

    #[test]
    fn deleted_files_become_delete_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        if !init_repo(dir.path()) {
            return;
        }
        fs::write(dir.path().join("gone.md"), "# Gone\n").expect("write");
        commit_all(dir.path());

        fs::remove_file(dir.path().join("gone.md")).expect("remove");

        let set = detect_changes(dir.path(), &ChangeOptions::default()).expect("detect");
        assert!(set.uploads.is_empty());
        assert_eq!(set.deletions, vec!["gone.md".to_string()]);
    }
}
