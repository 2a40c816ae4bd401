//! Domain models for the RASEN supervisor.
//!
//! These types are shared across the loop driver, the stores, and the
//! sub-loops. Everything that lands on disk derives serde; the in-memory
//! loop state does not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Reason the orchestration loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// All subtasks completed and the dual-confirmation gate passed.
    Complete,
    /// Maximum iteration count reached.
    MaxIterations,
    /// Maximum total runtime exceeded.
    MaxRuntime,
    /// A subtask produced no commits for too many consecutive sessions.
    Stalled,
    /// Too many consecutive failed sessions across subtasks.
    ConsecutiveFailures,
    /// Circular approaches detected on a subtask.
    LoopThrashing,
    /// Shutdown requested via signal.
    UserCancelled,
    /// The initializer session hit its wall-clock deadline.
    SessionTimeout,
    /// Unrecoverable error (QA escalation, plan creation failure, ...).
    Error,
}

impl TerminationReason {
    /// Process exit code for this reason.
    ///
    /// 0 = success, 1 = failure, 2 = limit reached, 130 = interrupted
    /// (128 + SIGINT).
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::Complete => 0,
            TerminationReason::MaxIterations | TerminationReason::MaxRuntime => 2,
            TerminationReason::UserCancelled => 130,
            TerminationReason::Stalled
            | TerminationReason::ConsecutiveFailures
            | TerminationReason::LoopThrashing
            | TerminationReason::SessionTimeout
            | TerminationReason::Error => 1,
        }
    }

    /// Stable string recorded in the status store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Complete => "complete",
            TerminationReason::MaxIterations => "max_iterations",
            TerminationReason::MaxRuntime => "max_runtime",
            TerminationReason::Stalled => "stalled",
            TerminationReason::ConsecutiveFailures => "consecutive_failures",
            TerminationReason::LoopThrashing => "loop_thrashing",
            TerminationReason::UserCancelled => "user_cancelled",
            TerminationReason::SessionTimeout => "session_timeout",
            TerminationReason::Error => "error",
        }
    }

    /// Returns true if this is a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, TerminationReason::Complete)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four agent roles the session runner dispatches on.
///
/// Roles differ in prompt template, backpressure requirement, and expected
/// commit side-effect — a small configuration record, not a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Initializer,
    Coder,
    Reviewer,
    Qa,
}

impl AgentRole {
    /// Role name, also the prompt template stem (`prompts/<name>.md`).
    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Initializer => "initializer",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Qa => "qa",
        }
    }

    /// Whether a claimed completion must carry backpressure evidence.
    /// The Initializer creates plan files, not code, so it is exempt.
    pub fn requires_backpressure(&self) -> bool {
        matches!(self, AgentRole::Coder)
    }

    /// Whether a claimed completion must come with at least one new commit.
    pub fn requires_commits(&self) -> bool {
        matches!(self, AgentRole::Coder)
    }

    /// Logically read-only roles: the rendered prompt forbids mutation and
    /// the post-session check expects zero commits.
    pub fn is_read_only(&self) -> bool {
        matches!(self, AgentRole::Reviewer | AgentRole::Qa)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a single assistant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Exited cleanly without a completion event; more work expected.
    Continue,
    /// Emitted a completion event (`build.done` / `init.done`).
    Complete,
    /// Emitted `build.blocked`.
    Blocked,
    /// Non-zero exit or spawn-level failure.
    Failed,
    /// Hit the per-session wall-clock deadline.
    Timeout,
}

/// Status of a subtask in the implementation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A single subtask in the implementation plan.
///
/// The identifier is chosen by the Initializer session and is immutable once
/// created; only the supervisor mutates `status`, `attempts`, and
/// `last_approach`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,

    pub description: String,

    #[serde(default = "default_subtask_status")]
    pub status: SubtaskStatus,

    /// Attempt counter, incremented on each failed session.
    #[serde(default)]
    pub attempts: u32,

    /// One-line summary of the most recent failed approach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_approach: Option<String>,
}

fn default_subtask_status() -> SubtaskStatus {
    SubtaskStatus::Pending
}

impl Subtask {
    /// Creates a pending subtask.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: SubtaskStatus::Pending,
            attempts: 0,
            last_approach: None,
        }
    }
}

/// The ordered implementation plan created by the Initializer.
///
/// Ordering is meaningful (dependency order); identifiers are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub task_name: String,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImplementationPlan {
    pub fn new(task_name: impl Into<String>, subtasks: Vec<Subtask>) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            subtasks,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `(completed, total)` subtask counts.
    pub fn completion_stats(&self) -> (usize, usize) {
        let completed = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count();
        (completed, self.subtasks.len())
    }
}

/// Append-only record of one attempt at a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub subtask_id: String,

    /// Session ordinal (the loop iteration that ran the attempt).
    pub session: u32,

    pub success: bool,

    /// One-line approach summary extracted from the session output.
    pub approach: String,

    /// Head commit after the attempt, when commits were observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// Result of a single agent session, as observed by the supervisor.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub status: SessionStatus,
    pub output: String,
    /// New commits observed since the pre-session head. Filled in by the
    /// post-session processor, not the runner.
    pub commits_made: u32,
    pub events: Vec<crate::events::Event>,
    pub duration: Duration,
}

/// In-memory state of the orchestration loop.
///
/// Everything durable lives in the stores; this struct only tracks what a
/// single run needs between iterations.
#[derive(Debug)]
pub struct LoopState {
    /// Current iteration number (1-indexed once the loop starts).
    pub iteration: u32,
    /// When the run started.
    pub started_at: Instant,
    /// Subtask currently being worked on.
    pub current_subtask_id: Option<String>,
    /// Consecutive iterations that observed "all done" (dual-confirm gate).
    pub completion_confirmations: u32,
    /// Consecutive failed post-processings across subtasks.
    pub consecutive_failures: u32,
    /// Total commits observed this run.
    pub total_commits: u64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            iteration: 0,
            started_at: Instant::now(),
            current_subtask_id: None,
            completion_confirmations: 0,
            consecutive_failures: 0,
            total_commits: 0,
        }
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_command_surface_contract() {
        assert_eq!(TerminationReason::Complete.exit_code(), 0);
        assert_eq!(TerminationReason::MaxIterations.exit_code(), 2);
        assert_eq!(TerminationReason::MaxRuntime.exit_code(), 2);
        assert_eq!(TerminationReason::UserCancelled.exit_code(), 130);
        assert_eq!(TerminationReason::Stalled.exit_code(), 1);
        assert_eq!(TerminationReason::LoopThrashing.exit_code(), 1);
        assert_eq!(TerminationReason::Error.exit_code(), 1);
    }

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(TerminationReason::Complete.as_str(), "complete");
        assert_eq!(
            TerminationReason::ConsecutiveFailures.as_str(),
            "consecutive_failures"
        );
        assert_eq!(TerminationReason::LoopThrashing.as_str(), "loop_thrashing");
        assert_eq!(TerminationReason::UserCancelled.as_str(), "user_cancelled");
    }

    #[test]
    fn subtask_defaults_to_pending() {
        let subtask = Subtask::new("setup-db", "Create the schema");
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert_eq!(subtask.attempts, 0);
        assert!(subtask.last_approach.is_none());
    }

    #[test]
    fn subtask_status_serializes_snake_case() {
        let json = serde_json::to_string(&SubtaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: SubtaskStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(back, SubtaskStatus::Completed);
    }

    #[test]
    fn completion_stats_counts_completed_only() {
        let mut plan = ImplementationPlan::new(
            "demo",
            vec![Subtask::new("a", "A"), Subtask::new("b", "B")],
        );
        assert_eq!(plan.completion_stats(), (0, 2));
        plan.subtasks[0].status = SubtaskStatus::Completed;
        plan.subtasks[1].status = SubtaskStatus::Failed;
        assert_eq!(plan.completion_stats(), (1, 2));
    }

    #[test]
    fn plan_roundtrips_through_json() {
        let plan = ImplementationPlan::new("demo", vec![Subtask::new("a", "A")]);
        let json = serde_json::to_string_pretty(&plan).unwrap();
        let back: ImplementationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
