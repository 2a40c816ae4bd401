//! Version-control gateway.
//!
//! A deliberately narrow surface over the `git` command line: the queries the
//! post-session processor needs (head, commit counting, diffs) plus the two
//! mutations the Initializer path uses (branch creation and checkout). Every
//! operation is a single invocation that either succeeds with machine-parseable
//! output or fails with the tool's own diagnostic.

use std::io;
use std::path::Path;
use std::process::Command;

/// Errors raised by git operations.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("git produced unparseable output: {0}")]
    BadOutput(String),
}

fn run_git(path: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git").args(args).current_dir(path).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Git(stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Returns true if the directory is inside a git work tree.
pub fn is_git_repo(path: impl AsRef<Path>) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path.as_ref())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Current HEAD commit identifier.
pub fn head(path: impl AsRef<Path>) -> Result<String, GitError> {
    run_git(path.as_ref(), &["rev-parse", "HEAD"])
}

/// Number of commits added since `since_commit`.
pub fn count_commits_since(path: impl AsRef<Path>, since_commit: &str) -> Result<u32, GitError> {
    let out = run_git(
        path.as_ref(),
        &["rev-list", "--count", &format!("{since_commit}..HEAD")],
    )?;
    out.parse().map_err(|_| GitError::BadOutput(out))
}

/// Current branch name; detached HEAD is an error.
pub fn current_branch(path: impl AsRef<Path>) -> Result<String, GitError> {
    let branch = run_git(path.as_ref(), &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch == "HEAD" {
        return Err(GitError::Git("detached HEAD state".to_string()));
    }
    Ok(branch)
}

/// Diff from `since_commit` to HEAD.
pub fn diff_since(path: impl AsRef<Path>, since_commit: &str) -> Result<String, GitError> {
    run_git(path.as_ref(), &["diff", since_commit, "HEAD"])
}

/// Returns true if the working tree has staged, unstaged, or untracked
/// changes.
pub fn has_uncommitted_changes(path: impl AsRef<Path>) -> Result<bool, GitError> {
    let out = run_git(path.as_ref(), &["status", "--porcelain"])?;
    Ok(!out.is_empty())
}

/// Creates a branch at HEAD without checking it out.
pub fn create_branch(path: impl AsRef<Path>, name: &str) -> Result<(), GitError> {
    run_git(path.as_ref(), &["branch", name]).map(|_| ())
}

/// Checks out an existing branch.
pub fn checkout(path: impl AsRef<Path>, name: &str) -> Result<(), GitError> {
    run_git(path.as_ref(), &["checkout", name]).map(|_| ())
}

/// Merges `branch` into the currently checked-out branch.
pub fn merge_branch(path: impl AsRef<Path>, branch: &str) -> Result<(), GitError> {
    run_git(path.as_ref(), &["merge", "--no-ff", branch]).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "test@test.local"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        fs::write(dir.join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    fn commit_file(dir: &Path, name: &str) {
        fs::write(dir.join(name), "content").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", name])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn detects_git_repo() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_git_repo(tmp.path()));
        init_repo(tmp.path());
        assert!(is_git_repo(tmp.path()));
    }

    #[test]
    fn head_returns_full_sha() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let sha = head(tmp.path()).unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[test]
    fn counts_commits_since_baseline() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let baseline = head(tmp.path()).unwrap();

        assert_eq!(count_commits_since(tmp.path(), &baseline).unwrap(), 0);
        commit_file(tmp.path(), "a.txt");
        commit_file(tmp.path(), "b.txt");
        assert_eq!(count_commits_since(tmp.path(), &baseline).unwrap(), 2);
    }

    #[test]
    fn current_branch_reads_main() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        assert_eq!(current_branch(tmp.path()).unwrap(), "main");
    }

    #[test]
    fn branch_create_and_checkout() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        create_branch(tmp.path(), "rasen/demo").unwrap();
        checkout(tmp.path(), "rasen/demo").unwrap();
        assert_eq!(current_branch(tmp.path()).unwrap(), "rasen/demo");
    }

    #[test]
    fn merge_brings_branch_commits_back() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        create_branch(tmp.path(), "rasen/demo").unwrap();
        checkout(tmp.path(), "rasen/demo").unwrap();
        commit_file(tmp.path(), "feature.txt");
        checkout(tmp.path(), "main").unwrap();

        merge_branch(tmp.path(), "rasen/demo").unwrap();
        assert!(tmp.path().join("feature.txt").exists());
    }

    #[test]
    fn diff_since_shows_changes() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let baseline = head(tmp.path()).unwrap();
        commit_file(tmp.path(), "feature.txt");

        let diff = diff_since(tmp.path(), &baseline).unwrap();
        assert!(diff.contains("feature.txt"));
    }

    #[test]
    fn uncommitted_changes_detection() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        assert!(!has_uncommitted_changes(tmp.path()).unwrap());
        fs::write(tmp.path().join("dirty.txt"), "x").unwrap();
        assert!(has_uncommitted_changes(tmp.path()).unwrap());
    }

    #[test]
    fn failures_surface_git_diagnostics() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let err = count_commits_since(tmp.path(), "not-a-commit").unwrap_err();
        assert!(matches!(err, GitError::Git(_)));
    }
}
