//! The orchestration loop.
//!
//! Top-level state machine driving a long-running task to completion:
//! Initialize → Code → Review → QA, with a dual-confirmation exit gate. The
//! driver never trusts a session's self-report — the post-session processor
//! reconciles every claim against version-control side effects and the
//! backpressure validator before a subtask is allowed to complete.
//!
//! All durable state lives in the stores; resuming after a stop re-enters
//! the loop with nothing but what is on disk.

use crate::config::Config;
use crate::daemon;
use crate::events;
use crate::git;
use crate::models::{
    AgentRole, ImplementationPlan, LoopState, SessionResult, SessionStatus, Subtask,
    TerminationReason,
};
use crate::prompts;
use crate::qa;
use crate::review;
use crate::session::{run_session, SessionError};
use crate::stall::{StallDetector, StallVerdict};
use crate::stores::{
    extract_memory_markers, MemoryStore, PlanStore, RecoveryStore, StatusSnapshot, StatusStore,
    StoreError,
};
use crate::validation::validate_completion;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Name of the project-local state directory.
pub const STATE_DIR_NAME: &str = ".rasen";

/// Subtask id under which Initializer attempts are recorded.
const INIT_SUBTASK_ID: &str = "init";

/// Fatal errors that abort the run. Everything recoverable is absorbed into
/// attempt records and, if it accumulates, becomes a termination reason.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// The main orchestration loop.
pub struct OrchestrationLoop {
    config: Config,
    project_dir: PathBuf,
    state_dir: PathBuf,
    task_description: String,
    plan_store: PlanStore,
    recovery_store: RecoveryStore,
    memory_store: MemoryStore,
    status_store: StatusStore,
    state: LoopState,
    /// Head captured when the run started; baseline for build-level diffs.
    baseline_commit: Option<String>,
    /// Build-level review + QA verdict for this run.
    final_validation_done: bool,
}

enum InitOutcome {
    PlanCreated,
    Retry,
    Fatal(TerminationReason),
}

impl OrchestrationLoop {
    /// Builds the loop over a project directory.
    ///
    /// `task_description` may be empty on resume; it is only required when no
    /// plan exists yet.
    pub fn new(config: Config, project_dir: impl Into<PathBuf>, task_description: String) -> Self {
        let project_dir = project_dir.into();
        let state_dir = project_dir.join(STATE_DIR_NAME);

        let plan_store = PlanStore::new(&state_dir);
        let recovery_store = RecoveryStore::new(&state_dir);
        let memory_store = MemoryStore::new(project_dir.join(&config.memory.path));
        let status_store = StatusStore::new(project_dir.join(&config.background.status_file));

        let baseline_commit = if git::is_git_repo(&project_dir) {
            git::head(&project_dir).ok()
        } else {
            None
        };

        let build_level_review = config.review.enabled && !config.review.per_subtask;
        let final_validation_done = !config.qa.enabled && !build_level_review;

        Self {
            config,
            project_dir,
            state_dir,
            task_description,
            plan_store,
            recovery_store,
            memory_store,
            status_store,
            state: LoopState::new(),
            baseline_commit,
            final_validation_done,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Runs the loop to termination, flushing the final reason to the status
    /// store before returning.
    pub fn run(&mut self) -> Result<TerminationReason, OrchestratorError> {
        info!(project = %self.project_dir.display(), "starting orchestration loop");

        let outcome = self.drive();
        match &outcome {
            Ok(reason) => {
                info!(reason = %reason, iterations = self.state.iteration, "loop terminated");
                if let Err(e) = self.status_store.mark_terminated(*reason) {
                    warn!("failed to write final status: {e}");
                }
            }
            Err(e) => {
                error!("loop aborted: {e}");
                if let Err(se) = self.status_store.mark_failed(&e.to_string()) {
                    warn!("failed to write final status: {se}");
                }
            }
        }
        outcome
    }

    fn drive(&mut self) -> Result<TerminationReason, OrchestratorError> {
        loop {
            // Top-of-iteration checks, in precedence order.
            if daemon::shutdown_requested() {
                return Ok(TerminationReason::UserCancelled);
            }
            if self.state.iteration >= self.config.orchestrator.max_iterations {
                return Ok(TerminationReason::MaxIterations);
            }
            if self.state.elapsed().as_secs() >= self.config.orchestrator.max_runtime_seconds {
                return Ok(TerminationReason::MaxRuntime);
            }
            if self.state.consecutive_failures
                >= self.config.stall_detection.max_consecutive_failures
            {
                return Ok(TerminationReason::ConsecutiveFailures);
            }

            self.state.iteration += 1;

            if self.plan_store.load()?.is_none() {
                match self.run_initializer()? {
                    InitOutcome::PlanCreated | InitOutcome::Retry => {
                        self.delay();
                        continue;
                    }
                    InitOutcome::Fatal(reason) => return Ok(reason),
                }
            }

            match self.plan_store.get_next_subtask()? {
                Some(subtask) => {
                    // New work invalidates any prior completion observation.
                    self.state.completion_confirmations = 0;

                    let detector =
                        StallDetector::new(&self.recovery_store, &self.config.stall_detection);
                    if let Some(verdict) = detector.check(&subtask.id)? {
                        warn!(subtask = %subtask.id, verdict = ?verdict, "stall detected");
                        return Ok(match verdict {
                            StallVerdict::NoCommitStall => TerminationReason::Stalled,
                            StallVerdict::CircularApproaches => TerminationReason::LoopThrashing,
                        });
                    }

                    self.run_coder_iteration(&subtask)?;
                }
                None => {
                    if !self.final_validation_done {
                        let plan = self.plan_store.load()?.ok_or(StoreError::NoPlan)?;
                        match self.run_final_validation(&plan)? {
                            Some(reason) => return Ok(reason),
                            None => {
                                // Approved, or subtasks were re-opened; either
                                // way the next iteration re-reads the plan.
                            }
                        }
                    } else {
                        self.state.completion_confirmations += 1;
                        info!(
                            confirmations = self.state.completion_confirmations,
                            "all subtasks complete"
                        );
                        if self.state.completion_confirmations >= 2 {
                            return Ok(TerminationReason::Complete);
                        }
                    }
                }
            }

            self.write_status("running", None)?;
            self.delay();
        }
    }

    // ── Initializer ─────────────────────────────────────────────────────

    fn run_initializer(&mut self) -> Result<InitOutcome, OrchestratorError> {
        if self.task_description.trim().is_empty() {
            error!("no task description available and no plan on disk");
            self.status_store.mark_failed("no task description")?;
            return Ok(InitOutcome::Fatal(TerminationReason::Error));
        }

        info!(iteration = self.state.iteration, "running initializer");
        self.write_status("initializing", None)?;

        let state_dir_str = self.state_dir.display().to_string();
        let prompt = prompts::create_agent_prompt(
            &self.state_dir,
            AgentRole::Initializer,
            &[
                ("task_description", self.task_description.as_str()),
                ("state_dir", state_dir_str.as_str()),
            ],
        );

        let result = self.dispatch_session(AgentRole::Initializer, &prompt, None)?;
        let approach = extract_approach(&result.output);

        if result.status == SessionStatus::Timeout {
            // Without a plan nothing can make progress; surface the timeout.
            self.recovery_store.record_attempt(
                INIT_SUBTASK_ID,
                self.state.iteration,
                false,
                &approach,
                None,
            )?;
            return Ok(InitOutcome::Fatal(TerminationReason::SessionTimeout));
        }

        // The plan file on disk is the only acceptable proof of success.
        let plan = self
            .plan_store
            .load()?
            .filter(|plan| !plan.subtasks.is_empty());

        self.recovery_store.record_attempt(
            INIT_SUBTASK_ID,
            self.state.iteration,
            plan.is_some(),
            &approach,
            None,
        )?;

        match plan {
            Some(plan) => {
                info!(subtasks = plan.subtasks.len(), "implementation plan created");
                self.state.consecutive_failures = 0;
                Ok(InitOutcome::PlanCreated)
            }
            None => {
                warn!("initializer finished without a usable plan");
                self.state.consecutive_failures += 1;
                Ok(InitOutcome::Retry)
            }
        }
    }

    // ── Coder + post-session processing ─────────────────────────────────

    fn run_coder_iteration(&mut self, subtask: &Subtask) -> Result<(), OrchestratorError> {
        info!(iteration = self.state.iteration, subtask = %subtask.id, "working on subtask");

        self.plan_store.mark_in_progress(&subtask.id)?;
        self.state.current_subtask_id = Some(subtask.id.clone());
        self.write_status("running", Some(subtask))?;

        let head_before = self.current_head();
        let prompt = self.build_coder_prompt(subtask)?;
        let mut result = self.dispatch_session(AgentRole::Coder, &prompt, Some(&subtask.id))?;

        let advanced = self.process_session(subtask, head_before.as_deref(), &mut result)?;

        if advanced {
            let mut accepted = true;

            if self.config.review.enabled && self.config.review.per_subtask {
                let outcome = review::run_review_loop(
                    &self.config,
                    subtask,
                    &self.project_dir,
                    &self.state_dir,
                    head_before.as_deref(),
                );
                if !outcome.passed {
                    warn!(subtask = %subtask.id, "review rejected the subtask");
                    self.reject_completed_subtask(subtask, &result, "review rejected")?;
                    accepted = false;
                }
            }

            if accepted && self.config.qa.enabled && self.config.qa.per_subtask {
                let outcome = qa::run_qa_for_subtask(
                    &self.config,
                    subtask,
                    &self.project_dir,
                    &self.state_dir,
                    head_before.as_deref(),
                );
                if !outcome.passed {
                    warn!(subtask = %subtask.id, "per-subtask QA rejected the subtask");
                    self.reject_completed_subtask(subtask, &result, "qa rejected")?;
                    accepted = false;
                }
            }

            if accepted {
                self.state.consecutive_failures = 0;
            }
        } else {
            self.state.consecutive_failures += 1;
        }

        Ok(())
    }

    /// The trust boundary: reconciles the session's claims against observed
    /// commits and backpressure evidence, then updates the stores.
    ///
    /// Returns true when the subtask genuinely advanced to COMPLETED.
    fn process_session(
        &mut self,
        subtask: &Subtask,
        head_before: Option<&str>,
        result: &mut SessionResult,
    ) -> Result<bool, OrchestratorError> {
        let commits_made = self.count_commits_since(head_before);
        result.commits_made = commits_made;
        if commits_made > 0 {
            self.state.total_commits += u64::from(commits_made);
        }

        let claimed = events::has_completion_event(&result.events);
        let role = AgentRole::Coder;

        let mut success = result.status == SessionStatus::Complete && claimed;
        if success && role.requires_backpressure() {
            if !validate_completion(&result.events, &self.config.backpressure) {
                warn!(subtask = %subtask.id, "completion claimed without required evidence");
                success = false;
            }
        }
        if success && role.requires_commits() && commits_made == 0 {
            warn!(subtask = %subtask.id, "completion claimed but no commits observed");
            success = false;
        }

        let approach = extract_approach(&result.output);
        let head_after = self.current_head();
        let commit_for_record = (commits_made > 0).then(|| head_after.clone()).flatten();

        self.recovery_store.record_attempt(
            &subtask.id,
            self.state.iteration,
            success,
            &approach,
            commit_for_record,
        )?;

        if success {
            self.plan_store.mark_complete(&subtask.id)?;
            if commits_made > 0 {
                if let Some(head) = head_after {
                    self.recovery_store.record_good_commit(&head, &subtask.id)?;
                }
            }
            self.harvest_memories(&result.output)?;
            info!(subtask = %subtask.id, commits = commits_made, "subtask completed");
        } else {
            // Leave IN_PROGRESS so the next iteration resumes the same
            // subtask; only the counters move.
            self.plan_store.increment_attempts(&subtask.id, &approach)?;
            warn!(
                subtask = %subtask.id,
                status = ?result.status,
                commits = commits_made,
                "session did not advance the subtask"
            );
        }

        Ok(success)
    }

    /// Rolls a completed-then-rejected subtask back to PENDING, recording the
    /// failure so attempt history and failed-approach hints stay truthful.
    fn reject_completed_subtask(
        &mut self,
        subtask: &Subtask,
        result: &SessionResult,
        cause: &str,
    ) -> Result<(), OrchestratorError> {
        let approach = extract_approach(&result.output);
        self.plan_store.revert_to_pending(&subtask.id)?;
        self.plan_store
            .increment_attempts(&subtask.id, &approach)?;
        self.recovery_store.record_attempt(
            &subtask.id,
            self.state.iteration,
            false,
            &format!("{cause}: {approach}"),
            None,
        )?;
        self.state.consecutive_failures += 1;
        Ok(())
    }

    fn build_coder_prompt(&self, subtask: &Subtask) -> Result<String, OrchestratorError> {
        let memory_context = if self.config.memory.enabled {
            self.memory_store
                .format_for_injection(self.config.memory.max_tokens)?
        } else {
            String::new()
        };

        let failed = self.recovery_store.failed_approaches(&subtask.id)?;
        let failed_section = if failed.is_empty() {
            String::new()
        } else {
            let mut section = String::from("## Previous Failed Approaches\n");
            for approach in &failed {
                section.push_str(&format!("- {approach}\n"));
            }
            section
        };

        let hints = self.recovery_store.recovery_hints(&subtask.id)?.join("\n");
        let attempt_number = (self.recovery_store.attempt_count(&subtask.id)? + 1).to_string();

        Ok(prompts::create_agent_prompt(
            &self.state_dir,
            AgentRole::Coder,
            &[
                ("subtask_id", subtask.id.as_str()),
                ("subtask_description", subtask.description.as_str()),
                ("attempt_number", attempt_number.as_str()),
                ("memory_context", memory_context.as_str()),
                ("failed_approaches_section", failed_section.as_str()),
                ("recovery_hints", hints.as_str()),
            ],
        ))
    }

    fn harvest_memories(&self, output: &str) -> Result<(), OrchestratorError> {
        if !self.config.memory.enabled {
            return Ok(());
        }
        for (kind, content) in extract_memory_markers(output) {
            let memory = self.memory_store.record(kind, &content, Vec::new())?;
            info!(id = %memory.id, kind = %kind, "memory recorded");
        }
        Ok(())
    }

    // ── Final validation (build-level review + QA) ──────────────────────

    /// Runs build-level review and the QA sub-loop once all subtasks are
    /// complete. Returns a termination reason when the run must stop, `None`
    /// when the loop should continue (approved, or subtasks re-opened).
    fn run_final_validation(
        &mut self,
        plan: &ImplementationPlan,
    ) -> Result<Option<TerminationReason>, OrchestratorError> {
        let baseline = self.baseline_commit.clone();

        if self.config.review.enabled && !self.config.review.per_subtask {
            info!("running build-level review");
            self.write_status("reviewing", None)?;
            let build_subtask = Subtask::new("build-complete", "Complete build review");
            let outcome = review::run_review_loop(
                &self.config,
                &build_subtask,
                &self.project_dir,
                &self.state_dir,
                baseline.as_deref(),
            );
            if !outcome.passed {
                if daemon::shutdown_requested() {
                    return Ok(Some(TerminationReason::UserCancelled));
                }
                error!("build-level review failed");
                self.status_store.mark_failed("review validation failed")?;
                return Ok(Some(TerminationReason::Error));
            }
        }

        if self.config.qa.enabled {
            info!("running build-level QA");
            self.write_status("qa", None)?;
            let outcome = qa::run_qa_loop(
                &self.config,
                plan,
                &self.task_description,
                &self.project_dir,
                &self.state_dir,
                baseline.as_deref(),
            );

            if !outcome.passed {
                if daemon::shutdown_requested() {
                    return Ok(Some(TerminationReason::UserCancelled));
                }
                // QA fix sessions may have re-opened subtasks; if so, go back
                // to coding instead of terminating.
                let reopened = self
                    .plan_store
                    .get_next_subtask()?
                    .is_some();
                if reopened && !outcome.escalated {
                    warn!("QA re-opened subtasks, returning to coding");
                    return Ok(None);
                }
                error!("QA validation failed or escalated");
                self.status_store.mark_failed("qa validation failed")?;
                return Ok(Some(TerminationReason::Error));
            }
        }

        self.final_validation_done = true;
        Ok(None)
    }

    // ── Session dispatch and VCS plumbing ───────────────────────────────

    fn dispatch_session(
        &mut self,
        role: AgentRole,
        prompt: &str,
        subtask_id: Option<&str>,
    ) -> Result<SessionResult, OrchestratorError> {
        let timeout = Duration::from_secs(self.config.orchestrator.session_timeout_seconds);
        let result = run_session(
            &self.config.agent,
            role,
            prompt,
            &self.project_dir,
            &self.state_dir,
            subtask_id,
            timeout,
        )?;
        Ok(result)
    }

    fn current_head(&self) -> Option<String> {
        if git::is_git_repo(&self.project_dir) {
            git::head(&self.project_dir).ok()
        } else {
            None
        }
    }

    fn count_commits_since(&self, head_before: Option<&str>) -> u32 {
        match head_before {
            Some(before) => git::count_commits_since(&self.project_dir, before).unwrap_or(0),
            None => 0,
        }
    }

    fn write_status(
        &self,
        status: &str,
        subtask: Option<&Subtask>,
    ) -> Result<(), OrchestratorError> {
        let (completed, total) = self.plan_store.completion_stats()?;
        let snapshot = StatusSnapshot {
            pid: std::process::id(),
            started_at: Utc::now()
                - chrono::Duration::from_std(self.state.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            iteration: self.state.iteration,
            subtask_id: subtask.map(|s| s.id.clone()).or_else(|| self.state.current_subtask_id.clone()),
            subtask_description: subtask.map(|s| s.description.clone()),
            completed_subtasks: completed,
            total_subtasks: total,
            session_started_at: subtask.map(|_| Utc::now()),
            last_activity_at: Utc::now(),
            commits_this_session: self.state.total_commits,
            status: status.to_string(),
            consecutive_failures: self.state.consecutive_failures,
            termination_reason: None,
        };
        self.status_store.update(snapshot)?;
        Ok(())
    }

    fn delay(&self) {
        std::thread::sleep(Duration::from_secs(
            self.config.orchestrator.session_delay_seconds,
        ));
    }
}

/// One-line approach summary from session output.
///
/// First line mentioning "approach" or "trying", else the first non-empty
/// line, truncated to 200 characters. This string keys the circular-fix
/// detector and feeds the failed-approach hints.
fn extract_approach(output: &str) -> String {
    let keyword_line = output.lines().find(|line| {
        let lower = line.to_lowercase();
        !line.trim().is_empty() && (lower.contains("approach") || lower.contains("trying"))
    });
    let line = keyword_line
        .or_else(|| output.lines().find(|line| !line.trim().is_empty()))
        .unwrap_or("(no output)");

    let trimmed = line.trim();
    trimmed.chars().take(200).collect()
}
