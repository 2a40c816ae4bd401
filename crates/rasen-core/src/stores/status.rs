//! Live status snapshot for external observers.
//!
//! A single JSON file rewritten atomically on iteration start, iteration end,
//! and termination. A `status` command, a dashboard, or a CI job can read it
//! at any moment and always sees a complete snapshot.

use crate::file_lock::atomic_write;
use crate::models::TerminationReason;
use crate::stores::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Snapshot of the supervisor's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    pub iteration: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_description: Option<String>,

    pub completed_subtasks: usize,
    pub total_subtasks: usize,

    /// When the current session started, while one is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,

    /// Monotonically non-decreasing within a run; set on every write.
    pub last_activity_at: DateTime<Utc>,

    /// Commits observed during this run.
    pub commits_this_session: u64,

    /// Overall status string: "running", "reviewing", "qa", "completed",
    /// "terminated", "failed: ...".
    pub status: String,

    pub consecutive_failures: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

impl StatusSnapshot {
    /// Snapshot for a run that has just started.
    pub fn starting(pid: u32) -> Self {
        let now = Utc::now();
        Self {
            pid,
            started_at: now,
            iteration: 0,
            subtask_id: None,
            subtask_description: None,
            completed_subtasks: 0,
            total_subtasks: 0,
            session_started_at: None,
            last_activity_at: now,
            commits_this_session: 0,
            status: "running".to_string(),
            consecutive_failures: 0,
            termination_reason: None,
        }
    }
}

/// Store for the live status file (`status.json`).
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot atomically, stamping `last_activity_at`.
    pub fn update(&self, mut snapshot: StatusSnapshot) -> Result<(), StoreError> {
        snapshot.last_activity_at = Utc::now();
        let content =
            serde_json::to_string_pretty(&snapshot).map_err(|source| StoreError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    /// Reads the current snapshot, or `None` before the first write.
    pub fn load(&self) -> Result<Option<StatusSnapshot>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(snapshot))
    }

    /// Records the final termination reason before process exit.
    pub fn mark_terminated(&self, reason: TerminationReason) -> Result<(), StoreError> {
        let mut snapshot = self
            .load()?
            .unwrap_or_else(|| StatusSnapshot::starting(std::process::id()));
        snapshot.status = if reason.is_success() {
            "completed".to_string()
        } else {
            "terminated".to_string()
        };
        snapshot.termination_reason = Some(reason.as_str().to_string());
        snapshot.session_started_at = None;
        self.update(snapshot)
    }

    /// Records a fatal failure with its reason string.
    pub fn mark_failed(&self, reason: &str) -> Result<(), StoreError> {
        let mut snapshot = self
            .load()?
            .unwrap_or_else(|| StatusSnapshot::starting(std::process::id()));
        snapshot.status = format!("failed: {reason}");
        self.update(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, StatusStore) {
        let tmp = TempDir::new().unwrap();
        let store = StatusStore::new(tmp.path().join("status.json"));
        (tmp, store)
    }

    #[test]
    fn load_before_first_write_is_none() {
        let (_tmp, store) = store();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn update_and_load_roundtrip() {
        let (_tmp, store) = store();
        let mut snapshot = StatusSnapshot::starting(1234);
        snapshot.iteration = 3;
        snapshot.subtask_id = Some("auth".to_string());
        snapshot.total_subtasks = 5;
        store.update(snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.subtask_id.as_deref(), Some("auth"));
        assert_eq!(loaded.status, "running");
    }

    #[test]
    fn last_activity_is_monotonic_across_updates() {
        let (_tmp, store) = store();
        store.update(StatusSnapshot::starting(1)).unwrap();
        let first = store.load().unwrap().unwrap().last_activity_at;

        store.update(store.load().unwrap().unwrap()).unwrap();
        let second = store.load().unwrap().unwrap().last_activity_at;
        assert!(second >= first);
    }

    #[test]
    fn mark_terminated_records_reason() {
        let (_tmp, store) = store();
        store.update(StatusSnapshot::starting(1)).unwrap();
        store.mark_terminated(TerminationReason::Stalled).unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.status, "terminated");
        assert_eq!(snapshot.termination_reason.as_deref(), Some("stalled"));
    }

    #[test]
    fn mark_terminated_with_success_reads_completed() {
        let (_tmp, store) = store();
        store.mark_terminated(TerminationReason::Complete).unwrap();
        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.status, "completed");
        assert_eq!(snapshot.termination_reason.as_deref(), Some("complete"));
    }

    #[test]
    fn mark_failed_keeps_reason_string() {
        let (_tmp, store) = store();
        store.mark_failed("plan creation failed").unwrap();
        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.status, "failed: plan creation failed");
    }
}
