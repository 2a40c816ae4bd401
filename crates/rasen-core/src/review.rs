//! Review sub-loop: bounded Coder ↔ Reviewer cycle for a completed subtask.
//!
//! The Reviewer is logically read-only — its prompt forbids mutation and the
//! supervisor checks that no commits appeared during the review session. The
//! Reviewer signals through `review.approved` / `review.changes_requested`
//! events; on requested changes a Coder-fix session is seeded with the
//! feedback and the cycle repeats up to `review.max_loops`.
//!
//! Assistant-side failures never propagate out of this module; they degrade
//! into an approval (fail-open — the main loop's own gates still stand
//! between a bad change and completion).

use crate::config::Config;
use crate::events;
use crate::git;
use crate::models::{AgentRole, Subtask};
use crate::prompts;
use crate::session::run_session;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of the whole review loop.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub passed: bool,
    /// Last feedback when changes were requested and never resolved.
    pub feedback: Option<String>,
}

/// Runs the review loop for a subtask.
///
/// `baseline_commit` is the head before the subtask's work started; the diff
/// against it is what the Reviewer sees.
pub fn run_review_loop(
    config: &Config,
    subtask: &Subtask,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> ReviewOutcome {
    if !config.review.enabled {
        return ReviewOutcome {
            passed: true,
            feedback: None,
        };
    }

    let max_loops = config.review.max_loops;
    info!(subtask = %subtask.id, max_loops, "starting review loop");

    let mut last_feedback = None;

    for iteration in 1..=max_loops {
        if crate::daemon::shutdown_requested() {
            warn!(subtask = %subtask.id, "shutdown requested, abandoning review loop");
            return ReviewOutcome {
                passed: false,
                feedback: Some("shutdown requested".to_string()),
            };
        }

        info!(subtask = %subtask.id, iteration, max_loops, "review iteration");

        let review = run_reviewer_session(config, subtask, project_dir, state_dir, baseline_commit);

        match review {
            Review::Approved => {
                info!(subtask = %subtask.id, "review approved");
                return ReviewOutcome {
                    passed: true,
                    feedback: None,
                };
            }
            Review::ChangesRequested(feedback) => {
                warn!(subtask = %subtask.id, iteration, "review requested changes");
                last_feedback = Some(feedback.clone());

                // No fix session after the final rejection.
                if iteration >= max_loops {
                    break;
                }

                run_coder_fix_session(config, subtask, &feedback, project_dir, state_dir);
                std::thread::sleep(Duration::from_secs(
                    config.orchestrator.session_delay_seconds,
                ));
            }
        }
    }

    warn!(subtask = %subtask.id, "review loop exhausted without approval");
    ReviewOutcome {
        passed: false,
        feedback: last_feedback,
    }
}

enum Review {
    Approved,
    ChangesRequested(String),
}

fn run_reviewer_session(
    config: &Config,
    subtask: &Subtask,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> Review {
    let diff = baseline_commit
        .map(|commit| {
            git::diff_since(project_dir, commit)
                .unwrap_or_else(|e| format!("(could not generate diff: {e})"))
        })
        .unwrap_or_else(|| "(no baseline commit available)".to_string());

    let prompt = prompts::create_agent_prompt(
        state_dir,
        AgentRole::Reviewer,
        &[
            ("subtask_id", subtask.id.as_str()),
            ("subtask_description", subtask.description.as_str()),
            ("git_diff", diff.as_str()),
        ],
    );

    let head_before = git::head(project_dir).ok();

    let result = match run_session(
        &config.agent,
        AgentRole::Reviewer,
        &prompt,
        project_dir,
        state_dir,
        Some(&subtask.id),
        Duration::from_secs(config.orchestrator.session_timeout_seconds),
    ) {
        Ok(result) => result,
        Err(e) => {
            // Fail-open: a broken reviewer must not wedge the build.
            warn!(subtask = %subtask.id, "reviewer session failed, assuming approved: {e}");
            return Review::Approved;
        }
    };

    // Read-only contract check: a reviewer that commits gets flagged.
    if let (Some(before), Ok(after)) = (head_before, git::head(project_dir)) {
        if before != after {
            warn!(subtask = %subtask.id, "reviewer session produced commits; prompt contract violated");
        }
    }

    if events::event_payload(&result.events, events::topic::REVIEW_APPROVED).is_some() {
        return Review::Approved;
    }
    if let Some(feedback) =
        events::event_payload(&result.events, events::topic::REVIEW_CHANGES_REQUESTED)
    {
        return Review::ChangesRequested(feedback.to_string());
    }

    warn!(subtask = %subtask.id, "no clear review signal, assuming approved");
    Review::Approved
}

fn run_coder_fix_session(
    config: &Config,
    subtask: &Subtask,
    feedback: &str,
    project_dir: &Path,
    state_dir: &Path,
) {
    info!(subtask = %subtask.id, "running coder fix session");

    let description = format!("Fix review issues for {}:\n{}", subtask.id, feedback);
    let prompt = prompts::create_agent_prompt(
        state_dir,
        AgentRole::Coder,
        &[
            ("subtask_id", subtask.id.as_str()),
            ("subtask_description", description.as_str()),
            ("attempt_number", "review-fix"),
            ("memory_context", ""),
            ("failed_approaches_section", ""),
            ("recovery_hints", ""),
        ],
    );

    if let Err(e) = run_session(
        &config.agent,
        AgentRole::Coder,
        &prompt,
        project_dir,
        state_dir,
        Some(&subtask.id),
        Duration::from_secs(config.orchestrator.session_timeout_seconds),
    ) {
        warn!(subtask = %subtask.id, "coder fix session failed: {e}");
    }
}
