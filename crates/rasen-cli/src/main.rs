//! # rasen-cli
//!
//! Binary entry point for the RASEN supervisor.
//!
//! Thin command wrappers over `rasen-core`: `init` seeds the state
//! directory, `run`/`resume` enter the orchestration loop (optionally as a
//! background daemon), and `status`/`logs`/`stop`/`merge` observe or control
//! a run from the outside.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rasen_core::orchestrator::STATE_DIR_NAME;
use rasen_core::{
    daemon, git, worktree, Config, DaemonStatus, OrchestrationLoop, StatusStore,
};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "rasen",
    version,
    about = "Supervisor that drives long-running autonomous coding tasks to completion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record the task and write a default config; does not run the assistant.
    Init {
        /// The task description the assistant will work on.
        #[arg(long)]
        task: String,
    },

    /// Start the orchestration loop.
    Run {
        /// Detach and run as a background daemon.
        #[arg(long)]
        background: bool,

        /// Disable the review sub-loop for this run only.
        #[arg(long)]
        skip_review: bool,

        /// Disable the QA sub-loop for this run only.
        #[arg(long)]
        skip_qa: bool,
    },

    /// Print the live status snapshot.
    Status,

    /// Print or tail the daemon log.
    Logs {
        /// Keep following the log as it grows.
        #[arg(long)]
        follow: bool,

        /// Number of trailing lines to print.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// Stop the background daemon.
    Stop {
        /// SIGKILL immediately instead of a graceful SIGTERM.
        #[arg(long)]
        force: bool,
    },

    /// Continue a stopped run; identical to `run`.
    Resume {
        /// Detach and run as a background daemon.
        #[arg(long)]
        background: bool,
    },

    /// Merge the task worktree branch back into its source branch.
    Merge,
}

/// Worktree bookkeeping persisted at creation so `merge` knows where to land.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WorktreeRecord {
    path: PathBuf,
    branch: String,
    source_branch: String,
    task_slug: String,
}

fn main() {
    let cli = Cli::parse();
    let project_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("error: cannot determine working directory: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match run_command(cli.command, &project_dir) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run_command(command: Commands, project_dir: &Path) -> Result<i32> {
    match command {
        Commands::Init { task } => init_command(project_dir, &task),
        Commands::Run {
            background,
            skip_review,
            skip_qa,
        } => run_loop_command(project_dir, background, skip_review, skip_qa),
        Commands::Resume { background } => run_loop_command(project_dir, background, false, false),
        Commands::Status => status_command(project_dir),
        Commands::Logs { follow, lines } => logs_command(project_dir, follow, lines),
        Commands::Stop { force } => stop_command(project_dir, force),
        Commands::Merge => merge_command(project_dir),
    }
}

fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR_NAME)
}

fn load_config(project_dir: &Path) -> Result<Config> {
    let path = state_dir(project_dir).join("config.yml");
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── init ────────────────────────────────────────────────────────────────

fn init_command(project_dir: &Path, task: &str) -> Result<i32> {
    if task.trim().is_empty() {
        bail!("task description must not be empty");
    }

    let state_dir = state_dir(project_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating {}", state_dir.display()))?;

    std::fs::write(state_dir.join("task.txt"), task)?;

    let config_path = state_dir.join("config.yml");
    if !config_path.exists() {
        let defaults = serde_yaml::to_string(&Config::default())?;
        std::fs::write(&config_path, defaults)?;
        println!("Wrote default config to {}", config_path.display());
    } else {
        println!("Keeping existing config at {}", config_path.display());
    }

    println!("Task recorded in {}", state_dir.join("task.txt").display());
    println!("Run 'rasen run' to start.");
    Ok(0)
}

// ── run / resume ────────────────────────────────────────────────────────

fn run_loop_command(
    project_dir: &Path,
    background: bool,
    skip_review: bool,
    skip_qa: bool,
) -> Result<i32> {
    let mut config = load_config(project_dir)?;
    // Flags override per-run only; config on disk is untouched.
    if skip_review {
        config.review.enabled = false;
    }
    if skip_qa {
        config.qa.enabled = false;
    }

    let task = read_task(project_dir);
    let pid_file = project_dir.join(&config.background.pid_file);
    let log_file = project_dir.join(&config.background.log_file);

    if background {
        daemon::daemonize(&pid_file, &log_file, project_dir)
            .context("failed to start background daemon")?;
        // From here on we are the detached child; stderr goes to the log.
    } else {
        if let DaemonStatus::Running(pid) = daemon::daemon_status(&pid_file) {
            bail!("a background daemon is already running with PID {pid}; use 'rasen stop' first");
        }
        daemon::install_signal_handlers().context("failed to install signal handlers")?;
    }
    init_logging();

    let effective_dir = resolve_working_dir(project_dir, &config, &task)?;
    let mut orchestration = OrchestrationLoop::new(config, effective_dir, task);

    let outcome = orchestration.run();

    if background {
        daemon::remove_pid_file(&pid_file);
    }

    match outcome {
        Ok(reason) => {
            println!("rasen finished: {reason}");
            Ok(reason.exit_code())
        }
        Err(e) => Err(e.into()),
    }
}

fn read_task(project_dir: &Path) -> String {
    std::fs::read_to_string(state_dir(project_dir).join("task.txt"))
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Picks the directory the assistant works in: the project itself, or an
/// isolated worktree when `worktree.enabled` is set.
fn resolve_working_dir(project_dir: &Path, config: &Config, task: &str) -> Result<PathBuf> {
    if !config.worktree.enabled {
        return Ok(project_dir.to_path_buf());
    }
    if !git::is_git_repo(project_dir) {
        warn!("worktree.enabled set but this is not a git repository; staying in place");
        return Ok(project_dir.to_path_buf());
    }

    let record_path = state_dir(project_dir).join("worktree.json");
    if let Ok(content) = std::fs::read_to_string(&record_path) {
        let record: WorktreeRecord =
            serde_json::from_str(&content).context("corrupt worktree.json")?;
        if record.path.exists() {
            info!(path = %record.path.display(), "reusing task worktree");
            return Ok(record.path);
        }
    }

    let slug = task_slug(task);
    let created = worktree::create_worktree(project_dir, &slug, &config.worktree.base_path)
        .context("failed to create task worktree")?;
    let record = WorktreeRecord {
        path: created.path.clone(),
        branch: created.branch.clone(),
        source_branch: created.source_branch.clone(),
        task_slug: slug,
    };
    std::fs::write(&record_path, serde_json::to_string_pretty(&record)?)?;
    info!(path = %created.path.display(), branch = %created.branch, "created task worktree");
    Ok(created.path)
}

fn task_slug(task: &str) -> String {
    let slug: String = task
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(40)
        .collect();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.trim_end_matches('-').to_string()
    }
}

// ── status ──────────────────────────────────────────────────────────────

fn status_command(project_dir: &Path) -> Result<i32> {
    let config = load_config(project_dir)?;
    let store = StatusStore::new(project_dir.join(&config.background.status_file));

    let Some(snapshot) = store.load()? else {
        println!("No status recorded; has 'rasen run' been started?");
        return Ok(1);
    };

    let pid_file = project_dir.join(&config.background.pid_file);
    let daemon_line = match daemon::daemon_status(&pid_file) {
        DaemonStatus::Running(pid) => format!("daemon running (pid {pid})"),
        DaemonStatus::Stale(pid) => format!("stale pid file (pid {pid} is gone)"),
        DaemonStatus::NotRunning => "no daemon".to_string(),
    };

    println!("status:      {}", snapshot.status);
    println!("daemon:      {daemon_line}");
    println!("iteration:   {}", snapshot.iteration);
    println!(
        "subtasks:    {}/{} complete",
        snapshot.completed_subtasks, snapshot.total_subtasks
    );
    if let Some(id) = &snapshot.subtask_id {
        let description = snapshot.subtask_description.as_deref().unwrap_or("");
        println!("current:     {id} {description}");
    }
    println!("commits:     {}", snapshot.commits_this_session);
    println!("failures:    {} consecutive", snapshot.consecutive_failures);
    println!("started:     {}", snapshot.started_at.to_rfc3339());
    println!("last active: {}", snapshot.last_activity_at.to_rfc3339());
    if let Some(reason) = &snapshot.termination_reason {
        println!("terminated:  {reason}");
    }
    Ok(0)
}

// ── logs ────────────────────────────────────────────────────────────────

fn logs_command(project_dir: &Path, follow: bool, lines: usize) -> Result<i32> {
    let config = load_config(project_dir)?;
    let log_path = project_dir.join(&config.background.log_file);

    if !log_path.exists() {
        println!("No log file at {}", log_path.display());
        return Ok(1);
    }

    let content = std::fs::read_to_string(&log_path)?;
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    for line in tail.into_iter().rev() {
        println!("{line}");
    }

    if follow {
        follow_log(&log_path, content.len() as u64)?;
    }
    Ok(0)
}

/// Poll-based tail -f; ^C exits the command, not a daemon.
fn follow_log(log_path: &Path, mut offset: u64) -> Result<()> {
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let mut file = std::fs::File::open(log_path)?;
        let len = file.metadata()?.len();
        if len < offset {
            // Log rotated or truncated; start over.
            offset = 0;
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            print!("{buf}");
            offset = len;
        }
    }
}

// ── stop ────────────────────────────────────────────────────────────────

fn stop_command(project_dir: &Path, force: bool) -> Result<i32> {
    let config = load_config(project_dir)?;
    let pid_file = project_dir.join(&config.background.pid_file);

    let stopped = daemon::stop_daemon(&pid_file, Duration::from_secs(30), force)?;
    if stopped {
        println!("Daemon stopped.");
        Ok(0)
    } else {
        println!("No running daemon to stop.");
        Ok(1)
    }
}

// ── merge ───────────────────────────────────────────────────────────────

fn merge_command(project_dir: &Path) -> Result<i32> {
    let record_path = state_dir(project_dir).join("worktree.json");
    let content = std::fs::read_to_string(&record_path)
        .context("no worktree record; was this task run with worktree.enabled?")?;
    let record: WorktreeRecord =
        serde_json::from_str(&content).context("corrupt worktree.json")?;

    worktree::merge_task_branch(project_dir, &record.task_slug, &record.source_branch)
        .with_context(|| format!("merging {} into {}", record.branch, record.source_branch))?;

    println!(
        "Merged {} into {}.",
        record.branch, record.source_branch
    );
    Ok(0)
}
