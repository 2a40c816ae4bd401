//! Background daemon lifecycle.
//!
//! The shutdown flag is the only process-wide mutable state in the crate: a
//! one-shot `AtomicBool` set by the signal handler and checked by the loop
//! driver at iteration boundaries. Everything else here is POSIX plumbing —
//! double-fork detachment, pid-file handling, and the stop escalation used by
//! the `stop` command.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Errors raised by daemon management.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon already running with PID {0}; use 'rasen stop' first")]
    AlreadyRunning(i32),

    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("failed to detach: {0}")]
    Detach(nix::errno::Errno),
}

/// Requests a graceful shutdown; observed at the next iteration boundary.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Returns true once a shutdown has been requested.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Clears the flag. Test-only; a real process shuts down after one trip.
#[doc(hidden)]
pub fn reset_shutdown_flag() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
}

extern "C" fn handle_signal(_signum: nix::libc::c_int) {
    // Async-signal-safe: just flip the flag.
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs handlers translating SIGTERM, SIGINT, and SIGHUP into the
/// shutdown flag.
pub fn install_signal_handlers() -> Result<(), DaemonError> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
        // Safety: the handler only performs an atomic store.
        unsafe {
            sigaction(signal, &action).map_err(DaemonError::Detach)?;
        }
    }
    Ok(())
}

/// Writes the current pid to the pid file atomically.
pub fn write_pid_file(pid_file: &Path) -> Result<(), DaemonError> {
    crate::file_lock::atomic_write(pid_file, &std::process::id().to_string())?;
    info!(pid = std::process::id(), path = %pid_file.display(), "pid file written");
    Ok(())
}

/// Reads the pid file; `None` if absent or unparseable.
pub fn read_pid_file(pid_file: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    (pid > 0).then_some(pid)
}

/// Removes the pid file, ignoring absence.
pub fn remove_pid_file(pid_file: &Path) {
    if let Err(e) = std::fs::remove_file(pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %pid_file.display(), "failed to remove pid file: {e}");
        }
    }
}

/// Probes whether a process exists (signal 0).
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Daemon state as seen through the pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// No pid file.
    NotRunning,
    /// Pid file present and the process is alive.
    Running(i32),
    /// Pid file present but the process is gone; the file can be reclaimed.
    Stale(i32),
}

/// Reads daemon status from the pid file.
pub fn daemon_status(pid_file: &Path) -> DaemonStatus {
    match read_pid_file(pid_file) {
        None => DaemonStatus::NotRunning,
        Some(pid) if is_process_running(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
    }
}

/// Detaches the current process into a background daemon.
///
/// Classic double fork: the parent exits, the intermediate child calls
/// `setsid` and forks again so the daemon can never reacquire a controlling
/// terminal. Standard streams are redirected to the log file, the pid file is
/// written, and signal handlers are installed.
///
/// Refuses to start while a live daemon holds the pid file; a stale pid file
/// is reclaimed.
pub fn daemonize(pid_file: &Path, log_file: &Path, working_dir: &Path) -> Result<(), DaemonError> {
    use nix::unistd::{fork, setsid, ForkResult};

    match daemon_status(pid_file) {
        DaemonStatus::Running(pid) => return Err(DaemonError::AlreadyRunning(pid)),
        DaemonStatus::Stale(pid) => {
            warn!(pid, "reclaiming stale pid file");
            remove_pid_file(pid_file);
        }
        DaemonStatus::NotRunning => {}
    }

    // First fork: parent returns to the shell.
    // Safety: single-threaded at this point in the CLI lifecycle.
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { .. } => {
            std::thread::sleep(Duration::from_millis(300));
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    std::env::set_current_dir(working_dir)?;
    setsid().map_err(DaemonError::Detach)?;

    // Second fork: the session leader exits, orphaning the daemon for good.
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio(log_file)?;
    write_pid_file(pid_file)?;
    install_signal_handlers()?;

    info!(pid = std::process::id(), "daemon started");
    Ok(())
}

fn redirect_stdio(log_file: &Path) -> Result<(), DaemonError> {
    use nix::unistd::dup2;
    use std::os::fd::AsRawFd;

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let devnull = std::fs::File::open("/dev/null")?;

    dup2(devnull.as_raw_fd(), 0).map_err(DaemonError::Detach)?;
    dup2(log.as_raw_fd(), 1).map_err(DaemonError::Detach)?;
    dup2(log.as_raw_fd(), 2).map_err(DaemonError::Detach)?;
    Ok(())
}

/// Stops a running daemon.
///
/// Sends SIGTERM and polls for exit up to `timeout`; escalates to SIGKILL if
/// the daemon does not shut down in time. With `force`, SIGKILL is sent
/// immediately. Returns true if a daemon was actually stopped.
pub fn stop_daemon(pid_file: &Path, timeout: Duration, force: bool) -> Result<bool, DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = match daemon_status(pid_file) {
        DaemonStatus::NotRunning => {
            info!("no daemon running (no pid file)");
            return Ok(false);
        }
        DaemonStatus::Stale(pid) => {
            info!(pid, "daemon not running, removing stale pid file");
            remove_pid_file(pid_file);
            return Ok(false);
        }
        DaemonStatus::Running(pid) => pid,
    };

    let target = Pid::from_raw(pid);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    info!(pid, signal = ?signal, "stopping daemon");
    let _ = kill(target, signal);

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_running(pid) {
            remove_pid_file(pid_file);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    if !force {
        warn!(pid, "daemon ignored SIGTERM, escalating to SIGKILL");
        let _ = kill(target, Signal::SIGKILL);
        std::thread::sleep(Duration::from_millis(500));
        if !is_process_running(pid) {
            remove_pid_file(pid_file);
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // The shutdown flag is process-global; it is exercised in the dedicated
    // cancellation integration test, not here, so parallel unit tests of the
    // sub-loops never observe a transient flag.

    #[test]
    fn pid_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("rasen.pid");

        assert!(read_pid_file(&pid_file).is_none());
        write_pid_file(&pid_file).unwrap();
        assert_eq!(read_pid_file(&pid_file), Some(std::process::id() as i32));

        remove_pid_file(&pid_file);
        assert!(read_pid_file(&pid_file).is_none());
        // Removing twice is fine.
        remove_pid_file(&pid_file);
    }

    #[test]
    fn garbage_pid_file_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("rasen.pid");
        std::fs::write(&pid_file, "not a pid").unwrap();
        assert!(read_pid_file(&pid_file).is_none());

        std::fs::write(&pid_file, "-5").unwrap();
        assert!(read_pid_file(&pid_file).is_none());
    }

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id() as i32));
        assert!(!is_process_running(0));
    }

    #[test]
    fn status_distinguishes_live_and_stale() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("rasen.pid");

        assert_eq!(daemon_status(&pid_file), DaemonStatus::NotRunning);

        write_pid_file(&pid_file).unwrap();
        assert_eq!(
            daemon_status(&pid_file),
            DaemonStatus::Running(std::process::id() as i32)
        );

        // A pid that cannot exist on Linux (> pid_max ceiling).
        std::fs::write(&pid_file, "99999999").unwrap();
        assert_eq!(daemon_status(&pid_file), DaemonStatus::Stale(99_999_999));
    }

    #[test]
    fn stop_with_stale_pid_file_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("rasen.pid");
        std::fs::write(&pid_file, "99999999").unwrap();

        let stopped = stop_daemon(&pid_file, Duration::from_millis(100), false).unwrap();
        assert!(!stopped);
        assert!(!pid_file.exists());
    }

    #[test]
    fn stop_without_pid_file_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("rasen.pid");
        assert!(!stop_daemon(&pid_file, Duration::from_millis(100), false).unwrap());
    }
}
