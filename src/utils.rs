//! Shared filesystem utilities: lock files with stale-lock reclamation,
//! directory fsync, and small read helpers used by the store and WAL layers.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use tracing::warn;

use crate::errors::{ChronError, Result};

/// Age after which an unattended lock file is considered abandoned.
pub const LOCK_STALE_SECS: u64 = 60;

pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// An exclusively held `<target>.lock` file.
///
/// Acquisition creates the lock with `create_new`; a concurrent holder makes
/// acquisition fail. A lock left behind by a crashed process is reclaimed once
/// its age exceeds [`LOCK_STALE_SECS`]. Dropping the guard removes the lock
/// unless it was consumed by [`LockFile::commit`].
pub struct LockFile {
    path: PathBuf,
    armed: bool,
}

impl LockFile {
    /// Path of the lock file guarding `target`.
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Acquire the lock for `target`, waiting for a concurrent holder up to
    /// `timeout`. A stale lock is reclaimed instead of waited on. Ref CAS
    /// locks are held only for the duration of a write, so waiting briefly
    /// is the serialization the store promises.
    pub fn acquire_timeout(target: &Path, timeout: Duration) -> Result<LockFile> {
        let path = Self::lock_path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let start = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(LockFile { path, armed: true }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, Duration::from_secs(LOCK_STALE_SECS)) {
                        warn!(lock = %path.display(), "reclaiming stale lock file");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(lock_held(&path));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocking acquisition with the default lock timeout.
    pub fn acquire(target: &Path) -> Result<LockFile> {
        Self::acquire_timeout(target, Duration::from_secs(10))
    }

    /// Single-attempt acquisition for long-lived locks (the WAL writer and
    /// the index `write.lock`), where waiting on a live holder is pointless.
    pub fn try_acquire(target: &Path) -> Result<LockFile> {
        Self::acquire_timeout(target, Duration::ZERO)
    }

    /// Write `contents` into the lock file and atomically rename it onto
    /// `target`, consuming the guard. This is the commit half of a ref CAS.
    pub fn commit(mut self, target: &Path, contents: &[u8]) -> Result<()> {
        {
            let mut f = fs::OpenOptions::new().write(true).open(&self.path)?;
            f.write_all(contents)?;
            f.sync_data()?;
        }
        fs::rename(&self.path, target)?;
        self.armed = false;
        if let Some(parent) = target.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn lock_held(path: &Path) -> ChronError {
    ChronError::Io(io::Error::new(
        io::ErrorKind::WouldBlock,
        format!("lock file held: {}", path.display()),
    ))
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .map(|age| age > stale_after)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Remove every `*.lock` file under `dir` older than [`LOCK_STALE_SECS`].
/// Called at startup, when no writer can be live.
pub fn reclaim_stale_locks(dir: &Path) -> Result<usize> {
    let mut reclaimed = 0;
    if !dir.exists() {
        return Ok(0);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "lock")
                && is_stale(&path, Duration::from_secs(LOCK_STALE_SECS))
            {
                warn!(lock = %path.display(), "removing stale lock at startup");
                fs::remove_file(&path)?;
                reclaimed += 1;
            }
        }
    }
    Ok(reclaimed)
}

/// Fsync a directory so a rename inside it survives a crash.
#[cfg(unix)]
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("refs/heads/main");
        fs::create_dir_all(target.parent().unwrap()).unwrap();

        let lock = LockFile::try_acquire(&target).unwrap();
        assert!(LockFile::try_acquire(&target).is_err());
        drop(lock);
        let lock2 = LockFile::try_acquire(&target).unwrap();
        drop(lock2);
    }

    #[test]
    fn test_blocking_acquire_waits_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("busy-ref");
        let lock = LockFile::try_acquire(&target).unwrap();

        let path = target.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(lock);
            path
        });
        let reacquired = LockFile::acquire(&target).unwrap();
        releaser.join().unwrap();
        drop(reacquired);
    }

    #[test]
    fn test_lock_commit_renames_onto_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("value");
        let lock = LockFile::acquire(&target).unwrap();
        lock.commit(&target, b"abc\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"abc\n");
        assert!(!LockFile::lock_path(&target).exists());
    }

    #[test]
    fn test_reclaim_skips_fresh_locks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("busy");
        let _lock = LockFile::acquire(&target).unwrap();
        assert_eq!(reclaim_stale_locks(dir.path()).unwrap(), 0);
        assert!(LockFile::lock_path(&target).exists());
    }
}
