//! Single round-trip with the external coding assistant.
//!
//! The runner renders nothing itself — it receives a fully rendered prompt,
//! writes it to the state directory for debugging, feeds it to the assistant
//! subprocess on stdin, and enforces the per-session wall-clock deadline.
//! The child runs in its own process group so that on expiry the whole tree
//! is killed, not just the direct child.

use crate::config::AgentConfig;
use crate::events;
use crate::models::{AgentRole, SessionResult, SessionStatus};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Keep at most this much of each stream in memory; the pipes are still
/// drained past the cap so the child never blocks on a full pipe.
const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Errors raised while running a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(
        "assistant command '{command}' not found - install the coding assistant CLI \
         or set agent.command in config.yml"
    )]
    AssistantUnavailable { command: String },

    #[error("failed to run assistant: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one assistant session and returns what was observed.
///
/// `commits_made` in the result is left at zero; counting commits against the
/// pre-session head is the post-session processor's job.
pub fn run_session(
    agent: &AgentConfig,
    role: AgentRole,
    prompt: &str,
    project_dir: &Path,
    state_dir: &Path,
    subtask_id: Option<&str>,
    timeout: Duration,
) -> Result<SessionResult, SessionError> {
    write_prompt_artifact(state_dir, role, subtask_id, prompt);

    let start = Instant::now();
    let mut child = spawn_assistant(agent, project_dir)?;

    // Feed the prompt from a separate thread: a large prompt written inline
    // would deadlock against a child that is already filling its stdout pipe.
    let stdin_handle = child.stdin.take().map(|mut stdin| {
        let prompt = prompt.to_string();
        thread::spawn(move || {
            // A child that exits without reading stdin yields EPIPE; that is
            // its prerogative, not an error.
            let _ = stdin.write_all(prompt.as_bytes());
        })
    });

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = stdout.map(|pipe| {
        thread::spawn(move || drain_stream(pipe, "out"))
    });
    let stderr_handle = stderr.map(|pipe| {
        thread::spawn(move || drain_stream(pipe, "err"))
    });

    info!(role = %role, timeout_secs = timeout.as_secs(), "session started");

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            warn!(role = %role, "session deadline exceeded, killing process tree");
            timed_out = true;
            kill_process_tree(&mut child);
            child.wait()?
        }
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let output = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr_output = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    if !stderr_output.trim().is_empty() {
        debug!(role = %role, "session stderr: {}", truncate(&stderr_output, 1000));
    }

    let duration = start.elapsed();
    let parsed = events::parse_events(&output);

    let session_status = if timed_out {
        SessionStatus::Timeout
    } else if status.success() && events::has_completion_event(&parsed) {
        SessionStatus::Complete
    } else if events::has_blocked_event(&parsed) {
        SessionStatus::Blocked
    } else if status.success() {
        SessionStatus::Continue
    } else {
        SessionStatus::Failed
    };

    info!(
        role = %role,
        status = ?session_status,
        events = parsed.len(),
        duration_secs = duration.as_secs(),
        "session finished"
    );

    Ok(SessionResult {
        status: session_status,
        output,
        commits_made: 0,
        events: parsed,
        duration,
    })
}

fn spawn_assistant(agent: &AgentConfig, project_dir: &Path) -> Result<Child, SessionError> {
    let mut cmd = Command::new(&agent.command);
    cmd.args(effective_args(agent))
        .current_dir(project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group so a timeout can kill the whole tree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SessionError::AssistantUnavailable {
                command: agent.command.clone(),
            }
        } else {
            SessionError::Io(e)
        }
    })
}

/// Arguments for the assistant invocation.
///
/// The stock `claude` binary needs its non-interactive flags; any other
/// command (including test stubs) gets exactly what the config says.
fn effective_args(agent: &AgentConfig) -> Vec<String> {
    if agent.command == "claude" && agent.args.is_empty() {
        return vec![
            "-p".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
    }
    agent.args.clone()
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // The child is its own process group leader (process_group(0)).
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
}

/// Drains a pipe to completion, logging lines and keeping a bounded copy.
fn drain_stream<R: Read>(reader: R, label: &str) -> String {
    use std::io::BufRead;
    let mut collected = String::new();
    let buffered = std::io::BufReader::new(reader);
    for line in buffered.lines() {
        let Ok(line) = line else { break };
        debug!("[{label}] {}", truncate(&line, 200));
        if collected.len() < OUTPUT_LIMIT_BYTES {
            collected.push_str(&line);
            collected.push('\n');
        }
    }
    collected
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn write_prompt_artifact(state_dir: &Path, role: AgentRole, subtask_id: Option<&str>, prompt: &str) {
    let name = match subtask_id {
        Some(id) => format!("prompt_{}_{}.md", role.name(), id),
        None => format!("prompt_{}.md", role.name()),
    };
    let path = state_dir.join(name);
    if let Err(e) = std::fs::create_dir_all(state_dir).and_then(|()| std::fs::write(&path, prompt))
    {
        // Debug artifact only; the session itself proceeds.
        warn!(path = %path.display(), "could not write prompt artifact: {e}");
    }
}
