//! Namespace scoped mapping of container names to container IDs.
//!
//! Every name is a file under `<data_root>/names/<namespace>/` holding the
//! owner's ID. Mutations are serialized through a lock file in the same
//! directory, so separate processes observe a consistent mapping.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::ValidationError;
use crate::lock::{DirLock, LockError};
use crate::utils::{self, short_id};

#[derive(Debug, thiserror::Error)]
pub enum NameStoreError {
    #[error("name {name:?} is already used by container {}", short_id(.owner))]
    Conflict { name: String, owner: String },
    #[error("name {name:?} is owned by container {}, not {}", short_id(.owner), short_id(.id))]
    NotOwner {
        name: String,
        owner: String,
        id: String,
    },
    #[error(transparent)]
    InvalidName(#[from] ValidationError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to access name store entry {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, NameStoreError>;

#[derive(Debug, Clone)]
pub struct NameStore {
    dir: PathBuf,
}

impl NameStore {
    const LOCK_FILE: &'static str = ".lock";

    pub fn new(data_root: &Path, namespace: &str) -> Result<Self> {
        let dir = data_root.join("names").join(namespace);
        fs::create_dir_all(&dir).map_err(|err| NameStoreError::Io {
            path: dir.clone(),
            source: err,
        })?;
        Ok(Self { dir })
    }

    /// Returns the ID currently holding `name`.
    pub fn lookup(&self, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            return Ok(None);
        }
        utils::validate_name(name)?;
        self.read_owner(name)
    }

    /// Reserves `name` for `id`. Reserving a name already held by the same
    /// ID succeeds; an empty name is an anonymous container and is a no-op.
    pub fn acquire(&self, name: &str, id: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        utils::validate_name(name)?;
        let _lock = self.lock()?;
        self.acquire_locked(name, id)
    }

    /// Drops the reservation of `name` if it belongs to `id`. A missing
    /// reservation is not an error.
    pub fn release(&self, name: &str, id: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        utils::validate_name(name)?;
        let _lock = self.lock()?;
        self.release_locked(name, id)
    }

    /// Moves the reservation of `id` from `old` to `new`. If `new` cannot be
    /// reserved the reservation of `old` is left untouched.
    pub fn rename(&self, old: &str, id: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if !old.is_empty() {
            utils::validate_name(old)?;
        }
        if !new.is_empty() {
            utils::validate_name(new)?;
        }

        let _lock = self.lock()?;
        if !new.is_empty() {
            self.acquire_locked(new, id)?;
        }
        if !old.is_empty() {
            if let Err(err) = self.release_locked(old, id) {
                tracing::error!(
                    old,
                    new,
                    id,
                    %err,
                    "failed to release the previous name, restoring"
                );
                if !new.is_empty() {
                    if let Err(err) = self.release_locked(new, id) {
                        tracing::warn!(new, id, %err, "failed to release the new name");
                    }
                }
                return Err(err);
            }
        }

        Ok(())
    }

    fn acquire_locked(&self, name: &str, id: &str) -> Result<()> {
        match self.read_owner(name)? {
            Some(owner) if owner == id => Ok(()),
            Some(owner) => Err(NameStoreError::Conflict {
                name: name.to_owned(),
                owner,
            }),
            None => {
                let path = self.entry_path(name);
                utils::atomic_write(&path, id.as_bytes()).map_err(|err| {
                    tracing::error!(?path, %err, "failed to write name reservation");
                    NameStoreError::Io { path, source: err }
                })?;
                tracing::debug!(name, id, "name acquired");
                Ok(())
            }
        }
    }

    fn release_locked(&self, name: &str, id: &str) -> Result<()> {
        match self.read_owner(name)? {
            None => {
                tracing::debug!(name, id, "name was not reserved");
                Ok(())
            }
            Some(owner) if owner != id => Err(NameStoreError::NotOwner {
                name: name.to_owned(),
                owner,
                id: id.to_owned(),
            }),
            Some(_) => {
                let path = self.entry_path(name);
                match fs::remove_file(&path) {
                    Err(err) if err.kind() != ErrorKind::NotFound => {
                        Err(NameStoreError::Io { path, source: err })
                    }
                    _ => {
                        tracing::debug!(name, id, "name released");
                        Ok(())
                    }
                }
            }
        }
    }

    fn read_owner(&self, name: &str) -> Result<Option<String>> {
        let path = self.entry_path(name);
        match fs::read_to_string(&path) {
            Ok(owner) => Ok(Some(owner.trim().to_owned())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(NameStoreError::Io { path, source: err }),
        }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn lock(&self) -> Result<DirLock> {
        Ok(DirLock::acquire(self.dir.join(Self::LOCK_FILE))?)
    }
}
