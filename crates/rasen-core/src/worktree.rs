//! Git worktree isolation for a task.
//!
//! When `worktree.enabled` is set, the supervisor runs the assistant inside a
//! dedicated worktree on a `rasen/<task-slug>` branch so the user's checkout
//! stays untouched until `merge` is invoked. One branch per task; the branch
//! that was checked out at creation time is recorded so `merge` knows where to
//! land the work.

use crate::git::{self, GitError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Errors raised by worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("worktree already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Query(#[from] GitError),
}

/// A created worktree.
#[derive(Debug, Clone)]
pub struct Worktree {
    /// Absolute path of the worktree directory.
    pub path: PathBuf,
    /// The `rasen/<task-slug>` branch checked out inside it.
    pub branch: String,
    /// Branch that was checked out in the main tree at creation time.
    pub source_branch: String,
}

/// Branch name for a task slug.
pub fn branch_for_task(task_slug: &str) -> String {
    format!("rasen/{task_slug}")
}

/// Creates a worktree for the task under `base_path`.
pub fn create_worktree(
    repo_root: impl AsRef<Path>,
    task_slug: &str,
    base_path: impl AsRef<Path>,
) -> Result<Worktree, WorktreeError> {
    let repo_root = repo_root.as_ref();
    if !git::is_git_repo(repo_root) {
        return Err(WorktreeError::NotARepo(
            repo_root.to_string_lossy().into_owned(),
        ));
    }

    let source_branch = git::current_branch(repo_root)?;

    let base = if base_path.as_ref().is_absolute() {
        base_path.as_ref().to_path_buf()
    } else {
        repo_root.join(base_path.as_ref())
    };
    let worktree_path = base.join(task_slug);
    let branch = branch_for_task(task_slug);

    if worktree_path.exists() {
        return Err(WorktreeError::AlreadyExists(
            worktree_path.to_string_lossy().into_owned(),
        ));
    }
    fs::create_dir_all(&base)?;

    let output = Command::new("git")
        .args(["worktree", "add", "-b", &branch])
        .arg(&worktree_path)
        .current_dir(repo_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Err(WorktreeError::AlreadyExists(
                worktree_path.to_string_lossy().into_owned(),
            ));
        }
        return Err(WorktreeError::Git(stderr.trim().to_string()));
    }

    debug!(path = %worktree_path.display(), branch = %branch, "created worktree");

    Ok(Worktree {
        path: worktree_path,
        branch,
        source_branch,
    })
}

/// Removes a worktree directory, leaving its branch in place.
pub fn remove_worktree(
    repo_root: impl AsRef<Path>,
    worktree_path: impl AsRef<Path>,
) -> Result<(), WorktreeError> {
    let output = Command::new("git")
        .args(["worktree", "remove", "--force"])
        .arg(worktree_path.as_ref())
        .current_dir(repo_root.as_ref())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::Git(stderr.trim().to_string()));
    }
    Ok(())
}

/// Merges a task branch into `target_branch` inside the main tree.
pub fn merge_task_branch(
    repo_root: impl AsRef<Path>,
    task_slug: &str,
    target_branch: &str,
) -> Result<(), WorktreeError> {
    let repo_root = repo_root.as_ref();
    git::checkout(repo_root, target_branch)?;
    git::merge_branch(repo_root, &branch_for_task(task_slug))?;
    Ok(())
}
