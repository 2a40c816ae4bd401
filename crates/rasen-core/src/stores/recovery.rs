//! Attempt history and known-good commits.
//!
//! Two append-only logs backing recovery and stall detection. The attempt
//! history feeds failed-approach hints into the Coder prompt; the good-commit
//! ledger records the head after each completed subtask as a rollback point.

use crate::file_lock::{atomic_write, FileLock};
use crate::models::AttemptRecord;
use crate::stores::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttemptHistory {
    #[serde(default)]
    records: Vec<AttemptRecord>,
}

/// One entry in the good-commit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodCommit {
    pub commit: String,
    pub subtask_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GoodCommits {
    #[serde(default)]
    commits: Vec<GoodCommit>,
}

/// Store for attempt history (`attempt_history.json`) and the good-commit
/// ledger (`good_commits.json`). Both are strictly append-only.
pub struct RecoveryStore {
    history_path: PathBuf,
    commits_path: PathBuf,
}

impl RecoveryStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            history_path: state_dir.join("attempt_history.json"),
            commits_path: state_dir.join("good_commits.json"),
        }
    }

    /// Appends an attempt record.
    pub fn record_attempt(
        &self,
        subtask_id: &str,
        session: u32,
        success: bool,
        approach: &str,
        commit: Option<String>,
    ) -> Result<(), StoreError> {
        let lock = FileLock::new(&self.history_path)?;
        let _guard = lock.exclusive()?;

        let mut history = self.load_history_unlocked()?;
        history.records.push(AttemptRecord {
            subtask_id: subtask_id.to_string(),
            session,
            success,
            approach: approach.to_string(),
            commit,
            timestamp: Utc::now(),
        });
        self.save_json(&self.history_path, &history)
    }

    /// Approaches that failed for this subtask, oldest first. Injected into
    /// the Coder prompt so the assistant can avoid repeating them.
    pub fn failed_approaches(&self, subtask_id: &str) -> Result<Vec<String>, StoreError> {
        let history = self.load_history()?;
        Ok(history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id && !r.success)
            .map(|r| r.approach.clone())
            .collect())
    }

    /// Total attempts recorded for a subtask.
    pub fn attempt_count(&self, subtask_id: &str) -> Result<u32, StoreError> {
        let history = self.load_history()?;
        Ok(history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id)
            .count() as u32)
    }

    /// All attempts for a subtask, oldest first.
    pub fn attempts_for(&self, subtask_id: &str) -> Result<Vec<AttemptRecord>, StoreError> {
        let history = self.load_history()?;
        Ok(history
            .records
            .into_iter()
            .filter(|r| r.subtask_id == subtask_id)
            .collect())
    }

    /// True when the N most recent attempts for this subtask all failed.
    pub fn is_thrashing(&self, subtask_id: &str, threshold: u32) -> Result<bool, StoreError> {
        let attempts = self.attempts_for(subtask_id)?;
        if attempts.len() < threshold as usize {
            return Ok(false);
        }
        Ok(attempts
            .iter()
            .rev()
            .take(threshold as usize)
            .all(|r| !r.success))
    }

    /// Prompt-ready hints built from the recent attempt history.
    pub fn recovery_hints(&self, subtask_id: &str) -> Result<Vec<String>, StoreError> {
        let attempts = self.attempts_for(subtask_id)?;
        if attempts.is_empty() {
            return Ok(vec!["This is the first attempt at this subtask".to_string()]);
        }

        let mut hints = vec![format!("Previous attempts: {}", attempts.len())];
        let recent = attempts.iter().rev().take(3).rev();
        for (i, record) in recent.enumerate() {
            let status = if record.success { "SUCCESS" } else { "FAILED" };
            hints.push(format!("Attempt {}: {} - {}", i + 1, record.approach, status));
        }
        if attempts.len() >= 2 {
            hints.push("IMPORTANT: Try a DIFFERENT approach than previous attempts".to_string());
            hints.push(
                "Consider: different library, different pattern, or simpler implementation"
                    .to_string(),
            );
        }
        Ok(hints)
    }

    /// Appends a known-good commit.
    pub fn record_good_commit(&self, commit: &str, subtask_id: &str) -> Result<(), StoreError> {
        let lock = FileLock::new(&self.commits_path)?;
        let _guard = lock.exclusive()?;

        let mut commits = self.load_commits_unlocked()?;
        commits.commits.push(GoodCommit {
            commit: commit.to_string(),
            subtask_id: subtask_id.to_string(),
            timestamp: Utc::now(),
        });
        self.save_json(&self.commits_path, &commits)
    }

    /// Most recent good commit, if any.
    pub fn last_good_commit(&self) -> Result<Option<String>, StoreError> {
        let commits = self.load_commits()?;
        Ok(commits.commits.last().map(|c| c.commit.clone()))
    }

    /// Number of recorded good commits.
    pub fn good_commit_count(&self) -> Result<usize, StoreError> {
        Ok(self.load_commits()?.commits.len())
    }

    fn load_history(&self) -> Result<AttemptHistory, StoreError> {
        if !self.history_path.exists() {
            return Ok(AttemptHistory::default());
        }
        let lock = FileLock::new(&self.history_path)?;
        let _guard = lock.shared()?;
        self.load_history_unlocked()
    }

    fn load_history_unlocked(&self) -> Result<AttemptHistory, StoreError> {
        self.load_json(&self.history_path)
    }

    fn load_commits(&self) -> Result<GoodCommits, StoreError> {
        if !self.commits_path.exists() {
            return Ok(GoodCommits::default());
        }
        let lock = FileLock::new(&self.commits_path)?;
        let _guard = lock.shared()?;
        self.load_commits_unlocked()
    }

    fn load_commits_unlocked(&self) -> Result<GoodCommits, StoreError> {
        self.load_json(&self.commits_path)
    }

    fn load_json<T: Default + for<'de> Deserialize<'de>>(
        &self,
        path: &Path,
    ) -> Result<T, StoreError> {
        if !path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })
    }

    fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write(path, &content)?;
        Ok(())
    }
}
