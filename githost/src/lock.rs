//! Per-repository deploy lock shared between hook processes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

const LOCK_FILE: &str = "deploy.lock";

/// Exclusive `flock` on `<repo>/deploy.lock`, released on drop
pub struct DeployLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl DeployLock {
    /// Block until the lock for `repo_path` is held
    pub async fn acquire(repo_path: &Path) -> std::io::Result<Self> {
        if let Some(lock) = Self::try_acquire(repo_path)? {
            debug!(lock = %lock.path.display(), "deploy lock acquired");
            return Ok(lock);
        }

        let path = repo_path.join(LOCK_FILE);
        info!(lock = %path.display(), "another deploy is running, waiting for it to finish");
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(std::io::Error::other)?
    }

    /// Take the lock without blocking, returning `None` when it is held elsewhere
    pub fn try_acquire(repo_path: &Path) -> std::io::Result<Option<Self>> {
        let path = repo_path.join(LOCK_FILE);
        let file = open_lock_file(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(DeployLock { _lock: lock, path })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    fn acquire_blocking(path: PathBuf) -> std::io::Result<Self> {
        let file = open_lock_file(&path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;
        debug!(lock = %path.display(), "deploy lock acquired");
        Ok(DeployLock { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}
