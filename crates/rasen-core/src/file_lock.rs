//! File locking and atomic writes for the state stores.
//!
//! Every store file is guarded two ways:
//!
//! - **Advisory `flock`** on a sibling `.lock` file: shared for readers,
//!   exclusive for writers. The lock lives next to the target rather than on
//!   it so that the rename in [`atomic_write`] does not invalidate the held
//!   lock.
//! - **Atomic replacement**: writes go to a temp file, are fsynced, and then
//!   renamed over the target. Readers never observe a partial file; a failed
//!   write leaves the previous content intact and removes its temp file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Advisory lock for a state file.
///
/// The lock file is created at `{path}.lock` on first use.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Creates a lock handle for the given state file, creating parent
    /// directories as needed.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let lock_path = path.with_file_name(name);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self { lock_path })
    }

    /// Acquires a shared (read) lock, blocking until available.
    pub fn shared(&self) -> io::Result<LockGuard> {
        self.acquire(false)
    }

    /// Acquires an exclusive (write) lock, blocking until available.
    pub fn exclusive(&self) -> io::Result<LockGuard> {
        self.acquire(true)
    }

    /// Tries to acquire an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` if another holder is in the way.
    pub fn try_exclusive(&self) -> io::Result<Option<LockGuard>> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(LockGuard { _flock: flock })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => Ok(None),
            Err((_, errno)) => Err(io::Error::other(format!("flock failed: {errno}"))),
        }
    }

    fn acquire(&self, exclusive: bool) -> io::Result<LockGuard> {
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        let arg = if exclusive {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockShared
        };

        match Flock::lock(file, arg) {
            Ok(flock) => Ok(LockGuard { _flock: flock }),
            Err((_, errno)) => Err(io::Error::other(format!("flock failed: {errno}"))),
        }
    }

    fn open_lock_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
    }

    /// Path of the sibling lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Holds the flock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _flock: nix::fcntl::Flock<File>,
}

/// Writes `content` to `path` atomically (temp file + fsync + rename).
///
/// The caller is expected to hold an exclusive [`FileLock`] when the target is
/// a shared store file. On any failure the temp file is removed and the
/// previous target content is untouched.
pub fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    let temp_path = path.with_file_name(name);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn lock_file_sits_next_to_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("implementation_plan.json");
        let lock = FileLock::new(&target).unwrap();
        assert_eq!(
            lock.lock_path(),
            tmp.path().join("implementation_plan.json.lock")
        );
    }

    #[test]
    fn multiple_shared_locks_coexist() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let lock1 = FileLock::new(&target).unwrap();
        let lock2 = FileLock::new(&target).unwrap();

        let _g1 = lock1.shared().unwrap();
        let _g2 = lock2.shared().unwrap();
    }

    #[test]
    fn exclusive_blocks_until_released() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let target2 = target.clone();

        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();

        let holder = thread::spawn(move || {
            let lock = FileLock::new(&target).unwrap();
            let _guard = lock.exclusive().unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(50));
        });

        let start = Instant::now();
        let waiter = thread::spawn(move || {
            let lock = FileLock::new(&target2).unwrap();
            barrier2.wait();
            let _guard = lock.exclusive().unwrap();
        });

        holder.join().unwrap();
        waiter.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn try_exclusive_reports_contention() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let lock1 = FileLock::new(&target).unwrap();
        let lock2 = FileLock::new(&target).unwrap();

        let guard = lock1.exclusive().unwrap();
        assert!(lock2.try_exclusive().unwrap().is_none());
        drop(guard);
        assert!(lock2.try_exclusive().unwrap().is_some());
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("nested/dir/status.json");

        atomic_write(&target, "v1").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "v1");

        atomic_write(&target, "v2").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "v2");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("status.json");
        atomic_write(&target, "content").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }
}
