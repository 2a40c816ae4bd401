//! QA sub-loop: bounded Coder ↔ QA cycle with recurring-issue escalation.
//!
//! QA runs after all subtasks complete (build-level, the default) or as a
//! single check per subtask. Each QA session is logically read-only and
//! signals through `qa.approved` / `qa.rejected` events, the rejection
//! payload carrying one issue per line. A [`QaHistory`] counts normalized
//! issues across iterations; an issue that keeps coming back trips the
//! recurring-issue threshold, at which point a human-escalation document is
//! written to the project root and the sub-loop gives up.
//!
//! Unlike review, QA fails closed: a session with no clear signal counts as
//! a rejection.

use crate::config::Config;
use crate::events;
use crate::git;
use crate::models::{AgentRole, ImplementationPlan, Subtask};
use crate::prompts;
use crate::session::run_session;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Name of the human-escalation artifact written to the project root.
pub const ESCALATION_FILE: &str = "QA_ESCALATION.md";

/// Normalized issues are truncated to this length before counting.
const NORMALIZED_ISSUE_LEN: usize = 200;

/// Result of one QA session.
#[derive(Debug, Clone)]
pub struct QaResult {
    pub approved: bool,
    pub issues: Vec<String>,
}

/// Outcome of the whole QA loop.
#[derive(Debug, Clone)]
pub struct QaLoopOutcome {
    pub passed: bool,
    /// Outstanding issues when rejected.
    pub issues: Vec<String>,
    /// True when the recurring-issue threshold wrote the escalation artifact.
    pub escalated: bool,
}

impl QaLoopOutcome {
    fn passed() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
            escalated: false,
        }
    }

    fn rejected(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            issues,
            escalated: false,
        }
    }
}

/// Issue counts across QA iterations.
#[derive(Debug, Default)]
pub struct QaHistory {
    iterations: Vec<QaResult>,
    issue_counts: HashMap<String, u32>,
}

impl QaHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a QA result, counting each issue under its normalized form.
    pub fn record(&mut self, result: QaResult) {
        for issue in &result.issues {
            *self
                .issue_counts
                .entry(normalize_issue(issue))
                .or_insert(0) += 1;
        }
        self.iterations.push(result);
    }

    /// True if any normalized issue has reached the threshold.
    pub fn has_recurring_issues(&self, threshold: u32) -> bool {
        self.issue_counts.values().any(|&count| count >= threshold)
    }

    /// Recurring issues with their counts, most frequent first.
    pub fn recurring_issues(&self, threshold: u32) -> Vec<(String, u32)> {
        let mut recurring: Vec<_> = self
            .issue_counts
            .iter()
            .filter(|(_, &count)| count >= threshold)
            .map(|(issue, &count)| (issue.clone(), count))
            .collect();
        recurring.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        recurring
    }

    pub fn iterations(&self) -> &[QaResult] {
        &self.iterations
    }
}

/// Lowercased, whitespace-collapsed, length-capped issue key.
fn normalize_issue(issue: &str) -> String {
    let collapsed = issue
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(NORMALIZED_ISSUE_LEN).collect()
}

/// Runs the build-level QA loop after all subtasks complete.
pub fn run_qa_loop(
    config: &Config,
    plan: &ImplementationPlan,
    task_description: &str,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> QaLoopOutcome {
    if !config.qa.enabled {
        return QaLoopOutcome::passed();
    }

    let max_iterations = config.qa.max_iterations;
    let threshold = config.qa.recurring_issue_threshold;
    let mut history = QaHistory::new();

    info!(max_iterations, "starting QA loop");

    for iteration in 1..=max_iterations {
        if crate::daemon::shutdown_requested() {
            warn!("shutdown requested, abandoning QA loop");
            return QaLoopOutcome::rejected(vec!["shutdown requested".to_string()]);
        }

        info!(iteration, max_iterations, "QA iteration");

        let result = run_qa_session(
            config,
            plan,
            task_description,
            project_dir,
            state_dir,
            baseline_commit,
        );
        let approved = result.approved;
        let issues = result.issues.clone();
        history.record(result);

        if approved {
            info!("QA approved");
            return QaLoopOutcome::passed();
        }

        warn!(iteration, issues = issues.len(), "QA rejected");

        if history.has_recurring_issues(threshold) {
            let recurring = history.recurring_issues(threshold);
            error!(
                recurring = recurring.len(),
                "recurring QA issues detected, escalating to human"
            );
            write_escalation_file(project_dir, &recurring, &history);
            return QaLoopOutcome {
                passed: false,
                issues: recurring
                    .iter()
                    .map(|(issue, count)| format!("{issue} (x{count})"))
                    .collect(),
                escalated: true,
            };
        }

        // No fix session after the final rejection.
        if iteration >= max_iterations {
            break;
        }

        run_coder_qa_fix_session(config, &issues, project_dir, state_dir);
        std::thread::sleep(Duration::from_secs(
            config.orchestrator.session_delay_seconds,
        ));
    }

    error!(max_iterations, "QA loop exhausted without approval");
    let issues = history
        .iterations()
        .last()
        .map(|r| r.issues.clone())
        .unwrap_or_default();
    QaLoopOutcome::rejected(issues)
}

/// Single approve-or-reject QA session for one subtask.
pub fn run_qa_for_subtask(
    config: &Config,
    subtask: &Subtask,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> QaLoopOutcome {
    if !config.qa.enabled {
        return QaLoopOutcome::passed();
    }

    info!(subtask = %subtask.id, "running per-subtask QA");

    let plan_summary = format!("Validating subtask {}: {}", subtask.id, subtask.description);
    let result = run_qa_session_with_context(
        config,
        &subtask.description,
        &plan_summary,
        project_dir,
        state_dir,
        baseline_commit,
    );

    if result.approved {
        QaLoopOutcome::passed()
    } else {
        QaLoopOutcome::rejected(result.issues)
    }
}

fn run_qa_session(
    config: &Config,
    plan: &ImplementationPlan,
    task_description: &str,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> QaResult {
    let mut plan_summary = format!("Total subtasks: {}\n", plan.subtasks.len());
    for subtask in &plan.subtasks {
        plan_summary.push_str(&format!(
            "- {}: {} [{:?}]\n",
            subtask.id, subtask.description, subtask.status
        ));
    }
    run_qa_session_with_context(
        config,
        task_description,
        &plan_summary,
        project_dir,
        state_dir,
        baseline_commit,
    )
}

fn run_qa_session_with_context(
    config: &Config,
    task_description: &str,
    plan_summary: &str,
    project_dir: &Path,
    state_dir: &Path,
    baseline_commit: Option<&str>,
) -> QaResult {
    let diff = baseline_commit
        .map(|commit| {
            git::diff_since(project_dir, commit)
                .unwrap_or_else(|e| format!("(could not generate diff: {e})"))
        })
        .unwrap_or_else(|| "(no baseline commit available)".to_string());

    let prompt = prompts::create_agent_prompt(
        state_dir,
        AgentRole::Qa,
        &[
            ("task_description", task_description),
            ("implementation_plan", plan_summary),
            ("full_git_diff", diff.as_str()),
        ],
    );

    let result = match run_session(
        &config.agent,
        AgentRole::Qa,
        &prompt,
        project_dir,
        state_dir,
        None,
        Duration::from_secs(config.orchestrator.session_timeout_seconds),
    ) {
        Ok(result) => result,
        Err(e) => {
            warn!("QA session failed: {e}");
            return QaResult {
                approved: false,
                issues: vec![format!("QA session failed: {e}")],
            };
        }
    };

    if events::event_payload(&result.events, events::topic::QA_APPROVED).is_some() {
        return QaResult {
            approved: true,
            issues: Vec::new(),
        };
    }
    if let Some(payload) = events::event_payload(&result.events, events::topic::QA_REJECTED) {
        return QaResult {
            approved: false,
            issues: parse_issue_lines(payload),
        };
    }

    // Fail closed: quality gates do not get the benefit of the doubt.
    warn!("no clear QA signal, assuming rejected");
    QaResult {
        approved: false,
        issues: vec!["No clear QA signal received".to_string()],
    }
}

/// One issue per payload line; leading list markers are stripped.
fn parse_issue_lines(payload: &str) -> Vec<String> {
    payload
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*']).trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_coder_qa_fix_session(
    config: &Config,
    issues: &[String],
    project_dir: &Path,
    state_dir: &Path,
) {
    info!(issues = issues.len(), "running coder QA fix session");

    let issues_text = issues
        .iter()
        .enumerate()
        .map(|(i, issue)| format!("{}. {}", i + 1, issue))
        .collect::<Vec<_>>()
        .join("\n");
    let description = format!("Fix QA issues:\n{issues_text}");

    let prompt = prompts::create_agent_prompt(
        state_dir,
        AgentRole::Coder,
        &[
            ("subtask_id", "qa-fix"),
            ("subtask_description", description.as_str()),
            ("attempt_number", "qa-fix"),
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
        Some("qa-fix"),
        Duration::from_secs(config.orchestrator.session_timeout_seconds),
    ) {
        warn!("coder QA fix session failed: {e}");
    }
}

fn write_escalation_file(project_dir: &Path, recurring: &[(String, u32)], history: &QaHistory) {
    let mut content = String::from(
        "# QA Escalation - Human Intervention Required\n\n\
         ## Summary\n\n\
         The QA validation loop has detected recurring issues that the agent cannot\n\
         resolve autonomously. Human review is required to proceed.\n\n\
         ## Recurring Issues\n\n",
    );
    content.push_str(&format!(
        "{} issue(s) kept coming back:\n\n",
        recurring.len()
    ));
    for (issue, count) in recurring {
        content.push_str(&format!("### Issue (occurred {count} times)\n\n{issue}\n\n"));
    }

    content.push_str(&format!(
        "## QA History\n\nTotal QA iterations: {}\n\n",
        history.iterations().len()
    ));
    for (i, result) in history.iterations().iter().enumerate() {
        let status = if result.approved {
            "APPROVED"
        } else {
            "REJECTED"
        };
        content.push_str(&format!("### Iteration {}: {}\n\n", i + 1, status));
        if !result.approved {
            for issue in &result.issues {
                content.push_str(&format!("- {issue}\n"));
            }
            content.push('\n');
        }
    }

    content.push_str(
        "## Next Steps\n\n\
         1. Review the recurring issues above\n\
         2. Fix them manually or sharpen the task description\n\
         3. Delete this file when ready\n\
         4. Run `rasen resume` to continue\n",
    );

    let path = project_dir.join(ESCALATION_FILE);
    if let Err(e) = std::fs::write(&path, content) {
        error!(path = %path.display(), "failed to write escalation file: {e}");
    } else {
        info!(path = %path.display(), "escalation file written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::models::Subtask;
    use tempfile::TempDir;

    fn config_with_script(script: &str) -> Config {
        let mut config = Config::default();
        config.agent = AgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        };
        config.orchestrator.session_delay_seconds = 0;
        config
    }

    fn plan() -> ImplementationPlan {
        ImplementationPlan::new("demo", vec![Subtask::new("a", "A"), Subtask::new("b", "B")])
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(
            normalize_issue("  Missing   Password\nValidation "),
            "missing password validation"
        );
    }

    #[test]
    fn normalization_caps_length() {
        let long = "word ".repeat(100);
        assert_eq!(normalize_issue(&long).chars().count(), NORMALIZED_ISSUE_LEN);
    }

    #[test]
    fn history_counts_normalized_issues_across_iterations() {
        let mut history = QaHistory::new();
        for variant in [
            "Missing password validation",
            "missing  password validation",
            "MISSING PASSWORD VALIDATION",
        ] {
            history.record(QaResult {
                approved: false,
                issues: vec![variant.to_string()],
            });
        }

        assert!(history.has_recurring_issues(3));
        let recurring = history.recurring_issues(3);
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].1, 3);
    }

    #[test]
    fn history_below_threshold_is_quiet() {
        let mut history = QaHistory::new();
        history.record(QaResult {
            approved: false,
            issues: vec!["issue one".to_string(), "issue two".to_string()],
        });
        history.record(QaResult {
            approved: false,
            issues: vec!["issue one".to_string()],
        });
        assert!(!history.has_recurring_issues(3));
    }

    #[test]
    fn issue_lines_strip_list_markers() {
        let issues = parse_issue_lines("- missing tests\n* flaky fixture\n\n  plain line  ");
        assert_eq!(issues, vec!["missing tests", "flaky fixture", "plain line"]);
    }

    #[test]
    fn approval_passes_immediately() {
        let config = config_with_script(r#"echo '<event topic="qa.approved">solid</event>'"#);
        let tmp = TempDir::new().unwrap();

        let outcome = run_qa_loop(&config, &plan(), "build a demo", tmp.path(), tmp.path(), None);
        assert!(outcome.passed);
        assert!(!tmp.path().join(ESCALATION_FILE).exists());
    }

    #[test]
    fn recurring_issue_writes_escalation_and_rejects() {
        // The same issue every iteration: threshold of 3 trips on the third.
        let config = config_with_script(
            r#"echo '<event topic="qa.rejected">missing password validation</event>'"#,
        );
        let tmp = TempDir::new().unwrap();

        let outcome = run_qa_loop(&config, &plan(), "build a demo", tmp.path(), tmp.path(), None);
        assert!(!outcome.passed);
        assert!(outcome.escalated);
        assert_eq!(outcome.issues.len(), 1);
        assert!(outcome.issues[0].contains("(x3)"));

        let escalation = std::fs::read_to_string(tmp.path().join(ESCALATION_FILE)).unwrap();
        assert!(escalation.contains("missing password validation"));
        assert!(escalation.contains("occurred 3 times"));
        assert!(escalation.contains("rasen resume"));
    }

    #[test]
    fn unclear_signal_fails_closed() {
        let config = config_with_script("echo nothing structured");
        let tmp = TempDir::new().unwrap();

        let outcome = run_qa_for_subtask(
            &config,
            &Subtask::new("a", "A"),
            tmp.path(),
            tmp.path(),
            None,
        );
        assert!(!outcome.passed);
    }

    #[test]
    fn disabled_qa_passes_through() {
        let mut config = config_with_script("false");
        config.qa.enabled = false;
        let tmp = TempDir::new().unwrap();

        assert!(run_qa_loop(&config, &plan(), "t", tmp.path(), tmp.path(), None).passed);
        assert!(
            run_qa_for_subtask(&config, &Subtask::new("a", "A"), tmp.path(), tmp.path(), None)
                .passed
        );
    }

    #[test]
    fn per_subtask_qa_rejection_carries_issues() {
        let config = config_with_script(
            r#"echo '<event topic="qa.rejected">- acceptance criteria unmet</event>'"#,
        );
        let tmp = TempDir::new().unwrap();

        let outcome = run_qa_for_subtask(
            &config,
            &Subtask::new("a", "A"),
            tmp.path(),
            tmp.path(),
            None,
        );
        assert!(!outcome.passed);
        assert_eq!(outcome.issues, vec!["acceptance criteria unmet"]);
    }
}
