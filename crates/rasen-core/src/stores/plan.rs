//! Implementation plan persistence.

use crate::file_lock::{atomic_write, FileLock};
use crate::models::{ImplementationPlan, Subtask, SubtaskStatus};
use crate::stores::StoreError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Store for the implementation plan (`implementation_plan.json`).
///
/// The plan is created exactly once per task by the Initializer; afterwards
/// only the supervisor mutates subtask statuses and attempt counters.
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    /// Creates a plan store rooted at the given state directory.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("implementation_plan.json"),
        }
    }

    /// Returns true if a plan file exists.
    pub fn has_plan(&self) -> bool {
        self.path.exists()
    }

    /// Loads the plan, or `None` if no plan has been created yet.
    pub fn load(&self) -> Result<Option<ImplementationPlan>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let lock = FileLock::new(&self.path)?;
        let _guard = lock.shared()?;
        let content = std::fs::read_to_string(&self.path)?;
        let plan = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(plan))
    }

    /// Saves the plan atomically, bumping `updated_at`.
    pub fn save(&self, plan: &mut ImplementationPlan) -> Result<(), StoreError> {
        plan.updated_at = Utc::now();

        let lock = FileLock::new(&self.path)?;
        let _guard = lock.exclusive()?;
        let content = serde_json::to_string_pretty(plan).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    /// Next subtask to work on.
    ///
    /// IN_PROGRESS wins over PENDING — an interrupted subtask is always
    /// resumed before fresh work is scheduled. This ordering is a correctness
    /// invariant of the whole system.
    pub fn get_next_subtask(&self) -> Result<Option<Subtask>, StoreError> {
        let Some(plan) = self.load()? else {
            return Ok(None);
        };

        let in_progress = plan
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::InProgress);
        if let Some(subtask) = in_progress {
            return Ok(Some(subtask.clone()));
        }

        Ok(plan
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Pending)
            .cloned())
    }

    pub fn mark_in_progress(&self, subtask_id: &str) -> Result<(), StoreError> {
        self.update_status(subtask_id, SubtaskStatus::InProgress)
    }

    pub fn mark_complete(&self, subtask_id: &str) -> Result<(), StoreError> {
        self.update_status(subtask_id, SubtaskStatus::Completed)
    }

    pub fn mark_failed(&self, subtask_id: &str) -> Result<(), StoreError> {
        self.update_status(subtask_id, SubtaskStatus::Failed)
    }

    /// Reverts a subtask to PENDING so the main loop re-schedules it.
    pub fn revert_to_pending(&self, subtask_id: &str) -> Result<(), StoreError> {
        self.update_status(subtask_id, SubtaskStatus::Pending)
    }

    /// Increments the attempt counter and records the failed approach.
    pub fn increment_attempts(&self, subtask_id: &str, approach: &str) -> Result<(), StoreError> {
        self.with_subtask(subtask_id, |subtask| {
            subtask.attempts += 1;
            subtask.last_approach = Some(approach.to_string());
        })
    }

    /// Returns `(completed, total)` subtask counts; `(0, 0)` without a plan.
    pub fn completion_stats(&self) -> Result<(usize, usize), StoreError> {
        match self.load()? {
            Some(plan) => Ok(plan.completion_stats()),
            None => Ok((0, 0)),
        }
    }

    fn update_status(&self, subtask_id: &str, status: SubtaskStatus) -> Result<(), StoreError> {
        debug!(subtask = subtask_id, status = ?status, "updating subtask status");
        self.with_subtask(subtask_id, |subtask| subtask.status = status)
    }

    fn with_subtask(
        &self,
        subtask_id: &str,
        mutate: impl FnOnce(&mut Subtask),
    ) -> Result<(), StoreError> {
        let mut plan = self.load()?.ok_or(StoreError::NoPlan)?;
        let subtask = plan
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| StoreError::UnknownSubtask(subtask_id.to_string()))?;
        mutate(subtask);
        self.save(&mut plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_plan(subtasks: Vec<Subtask>) -> (TempDir, PlanStore) {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path());
        let mut plan = ImplementationPlan::new("demo", subtasks);
        store.save(&mut plan).unwrap();
        (tmp, store)
    }

    #[test]
    fn load_without_plan_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path());
        assert!(!store.has_plan());
        assert!(store.load().unwrap().is_none());
        assert!(store.get_next_subtask().unwrap().is_none());
        assert_eq!(store.completion_stats().unwrap(), (0, 0));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let (_tmp, store) = store_with_plan(vec![Subtask::new("a", "first")]);
        let plan = store.load().unwrap().unwrap();
        assert_eq!(plan.task_name, "demo");
        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.subtasks[0].id, "a");
    }

    #[test]
    fn save_bumps_updated_at() {
        let (_tmp, store) = store_with_plan(vec![Subtask::new("a", "first")]);
        let before = store.load().unwrap().unwrap().updated_at;
        store.mark_in_progress("a").unwrap();
        let after = store.load().unwrap().unwrap().updated_at;
        assert!(after >= before);
    }

    #[test]
    fn next_subtask_prefers_in_progress_over_pending() {
        let (_tmp, store) = store_with_plan(vec![
            Subtask::new("a", "first"),
            Subtask::new("b", "second"),
            Subtask::new("c", "third"),
        ]);

        // Fresh plan: first pending wins.
        assert_eq!(store.get_next_subtask().unwrap().unwrap().id, "a");

        // A later subtask being in progress takes priority over earlier
        // pending ones (resume-safety rule).
        store.mark_in_progress("b").unwrap();
        assert_eq!(store.get_next_subtask().unwrap().unwrap().id, "b");
    }

    #[test]
    fn next_subtask_skips_terminal_statuses() {
        let (_tmp, store) = store_with_plan(vec![
            Subtask::new("a", "first"),
            Subtask::new("b", "second"),
        ]);
        store.mark_complete("a").unwrap();
        store.mark_failed("b").unwrap();
        assert!(store.get_next_subtask().unwrap().is_none());
    }

    #[test]
    fn revert_to_pending_reschedules() {
        let (_tmp, store) = store_with_plan(vec![Subtask::new("a", "first")]);
        store.mark_in_progress("a").unwrap();
        store.revert_to_pending("a").unwrap();
        let plan = store.load().unwrap().unwrap();
        assert_eq!(plan.subtasks[0].status, SubtaskStatus::Pending);
    }

    #[test]
    fn increment_attempts_records_approach() {
        let (_tmp, store) = store_with_plan(vec![Subtask::new("a", "first")]);
        store.increment_attempts("a", "tried sqlite first").unwrap();
        store.increment_attempts("a", "switched to postgres").unwrap();

        let plan = store.load().unwrap().unwrap();
        assert_eq!(plan.subtasks[0].attempts, 2);
        assert_eq!(
            plan.subtasks[0].last_approach.as_deref(),
            Some("switched to postgres")
        );
    }

    #[test]
    fn unknown_subtask_is_an_error() {
        let (_tmp, store) = store_with_plan(vec![Subtask::new("a", "first")]);
        assert!(matches!(
            store.mark_complete("zzz"),
            Err(StoreError::UnknownSubtask(_))
        ));
    }

    #[test]
    fn mutation_without_plan_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path());
        assert!(matches!(
            store.mark_in_progress("a"),
            Err(StoreError::NoPlan)
        ));
    }

    #[test]
    fn corrupt_plan_surfaces_path_and_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("implementation_plan.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = PlanStore::new(tmp.path());
        match store.load() {
            Err(StoreError::Corrupt { path: p, .. }) => {
                assert!(p.contains("implementation_plan.json"))
            }
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn completion_stats_tracks_progress() {
        let (_tmp, store) = store_with_plan(vec![
            Subtask::new("a", "first"),
            Subtask::new("b", "second"),
            Subtask::new("c", "third"),
        ]);
        store.mark_complete("a").unwrap();
        store.mark_complete("b").unwrap();
        assert_eq!(store.completion_stats().unwrap(), (2, 3));
    }
}
