//! Cross-process exclusive lock backed by `flock(2)`.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to lock {path:?}")]
    Flock { path: PathBuf, source: nix::Error },
}

/// Holds an exclusive lock on a file until dropped.
///
/// The lock belongs to the open file description, so two independent
/// acquisitions contend with each other whether they come from separate
/// processes or separate threads of one process.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl DirLock {
    /// Blocks until the exclusive lock on `path` is obtained. The lock file
    /// is created if it does not exist yet.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|err| {
                tracing::error!(?path, %err, "failed to open lock file");
                LockError::Open {
                    path: path.clone(),
                    source: err,
                }
            })?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            tracing::error!(?path, %errno, "failed to acquire lock");
            LockError::Flock {
                path: path.clone(),
                source: errno,
            }
        })?;
        tracing::trace!(?path, "lock acquired");

        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        tracing::trace!(path = ?self.path(), "lock released");
    }
}
