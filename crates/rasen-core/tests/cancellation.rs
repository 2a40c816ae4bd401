//! Shutdown-flag handling, isolated in its own test binary because the flag
//! is process-global.

use rasen_core::config::{AgentConfig, Config};
use rasen_core::daemon;
use rasen_core::models::{ImplementationPlan, Subtask, TerminationReason};
use rasen_core::orchestrator::{OrchestrationLoop, STATE_DIR_NAME};
use rasen_core::stores::{PlanStore, StatusStore};
use tempfile::TempDir;

#[test]
fn shutdown_flag_terminates_with_user_cancelled() {
    let tmp = TempDir::new().unwrap();

    let mut config = Config::default();
    config.agent = AgentConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "echo should never run".to_string()],
    };
    config.orchestrator.session_delay_seconds = 0;

    let plan_store = PlanStore::new(tmp.path().join(STATE_DIR_NAME));
    let mut plan = ImplementationPlan::new("demo", vec![Subtask::new("a", "work")]);
    plan_store.save(&mut plan).unwrap();

    let status = StatusStore::new(tmp.path().join(&config.background.status_file));

    // Signal arrives before the next iteration boundary.
    daemon::request_shutdown();

    let mut orchestration = OrchestrationLoop::new(config, tmp.path(), "demo".to_string());
    let reason = orchestration.run().unwrap();
    daemon::reset_shutdown_flag();

    assert_eq!(reason, TerminationReason::UserCancelled);

    // The flag is observed at the top of the loop: no session ran, the plan
    // is untouched, and the status store records the cancellation.
    let plan = plan_store.load().unwrap().unwrap();
    assert_eq!(plan.subtasks[0].attempts, 0);

    let snapshot = status.load().unwrap().unwrap();
    assert_eq!(
        snapshot.termination_reason.as_deref(),
        Some("user_cancelled")
    );
}
