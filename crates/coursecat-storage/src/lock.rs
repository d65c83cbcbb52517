//! Scoped exclusive lock over a partition directory.
//!
//! The OS advisory lock on the sentinel file is authoritative; the file itself is
//! created on demand and unlinked on release.

use std::fs::{File, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs;
use tracing::{debug, warn};

use crate::StoreError;

pub const LOCK_FILE_NAME: &str = ".coursecat.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirLock {
    /// Poll for the lock until `timeout` elapses, then fail with `LockTimeout`.
    pub async fn acquire(dir: &Path, timeout: Duration) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?;
        let path = dir.join(LOCK_FILE_NAME);
        let started = Instant::now();

        loop {
            if let Some(file) = try_lock_once(&path).await? {
                debug!(
                    lock = %path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "directory lock acquired"
                );
                return Ok(Self {
                    path,
                    file: Some(file),
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(dir = %dir.display(), ?waited, "directory lock timed out");
                return Err(StoreError::LockTimeout {
                    dir: dir.to_path_buf(),
                    waited,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink before unlocking: a waiter that wins the old inode afterwards
        // sees it is no longer linked and retries.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(lock = %self.path.display(), %err, "could not remove lock sentinel");
            }
        }
        if let Err(err) = file.unlock() {
            warn!(lock = %self.path.display(), %err, "unlocking directory lock failed");
        }
    }
}

async fn try_lock_once(path: &Path) -> Result<Option<File>, StoreError> {
    let file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?
        .into_std()
        .await;

    match file.try_lock() {
        Ok(()) if still_linked(&file, path) => Ok(Some(file)),
        Ok(()) => {
            let _ = file.unlock();
            Ok(None)
        }
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(err)) => Err(StoreError::io(path, err)),
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let dir = tempdir().expect("tempdir");
        let held = DirLock::acquire(dir.path(), Duration::from_secs(1))
            .await
            .expect("first lock");

        let err = DirLock::acquire(dir.path(), Duration::from_millis(250))
            .await
            .expect_err("second lock must time out");
        assert!(matches!(err, StoreError::LockTimeout { .. }));

        drop(held);
        let again = DirLock::acquire(dir.path(), Duration::from_millis(250))
            .await
            .expect("lock after release");
        assert!(again.path().exists());
    }

    #[tokio::test]
    async fn release_removes_sentinel() {
        let dir = tempdir().expect("tempdir");
        let lock = DirLock::acquire(dir.path(), Duration::from_secs(1))
            .await
            .expect("lock");
        let sentinel = lock.path().to_path_buf();
        assert!(sentinel.exists());
        drop(lock);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn waiter_proceeds_once_holder_releases() {
        let dir = tempdir().expect("tempdir");
        let held = DirLock::acquire(dir.path(), Duration::from_secs(1))
            .await
            .expect("first lock");

        let path = dir.path().to_path_buf();
        let waiter =
            tokio::spawn(async move { DirLock::acquire(&path, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);

        let lock = waiter.await.expect("join").expect("waiter acquires");
        assert!(lock.path().exists());
    }
}
