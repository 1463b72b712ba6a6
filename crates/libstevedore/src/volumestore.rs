//! Durable named and anonymous volumes of one namespace.
//!
//! Volumes live in `<data_root>/volumes/<ns>/<name>/` with the payload in
//! `_data` and the record in `volume.json`. Every operation needs a
//! [`VolumeStoreGuard`], which holds the namespace's cross-process lock for
//! as long as it lives.
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::lock::{DirLock, LockError};
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum VolumeStoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    InvalidName(#[from] ValidationError),
    #[error("no such volume: {0}")]
    NotFound(String),
    #[error("failed to access volume path {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse volume record {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, VolumeStoreError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub anonymous: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VolumeStore {
    dir: PathBuf,
}

impl VolumeStore {
    const LOCK_FILE: &'static str = ".lock";
    const DATA_DIR: &'static str = "_data";
    const RECORD_FILE: &'static str = "volume.json";

    pub fn new(data_root: &Path, namespace: &str) -> Result<Self> {
        let dir = data_root.join("volumes").join(namespace);
        fs::create_dir_all(&dir).map_err(|err| VolumeStoreError::Io {
            path: dir.clone(),
            source: err,
        })?;
        Ok(Self { dir })
    }

    /// Blocks until the namespace's volume lock is held.
    pub fn lock(&self) -> Result<VolumeStoreGuard<'_>> {
        let lock = DirLock::acquire(self.dir.join(Self::LOCK_FILE))?;
        Ok(VolumeStoreGuard {
            store: self,
            _lock: lock,
        })
    }

    pub fn list(&self) -> Result<Vec<Volume>> {
        self.lock()?.list()
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Proof that the volume lock is held. Dropping it releases the lock.
#[derive(Debug)]
pub struct VolumeStoreGuard<'a> {
    store: &'a VolumeStore,
    _lock: DirLock,
}

impl VolumeStoreGuard<'_> {
    /// Creates a named volume. An existing volume of the same name is
    /// returned unchanged.
    pub fn create(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        anonymous: bool,
    ) -> Result<Volume> {
        utils::validate_name(name)?;
        if let Some(existing) = self.get(name)? {
            return Ok(existing);
        }

        let vol_dir = self.store.volume_dir(name);
        let mountpoint = vol_dir.join(VolumeStore::DATA_DIR);
        fs::create_dir_all(&mountpoint).map_err(|err| VolumeStoreError::Io {
            path: mountpoint.clone(),
            source: err,
        })?;
        let volume = Volume {
            name: name.to_owned(),
            mountpoint,
            labels,
            anonymous,
            created_at: Utc::now(),
        };
        let record = vol_dir.join(VolumeStore::RECORD_FILE);
        let data = serde_json::to_vec_pretty(&volume).map_err(|err| VolumeStoreError::Parse {
            path: record.clone(),
            source: err,
        })?;
        if let Err(err) = utils::atomic_write(&record, &data) {
            let _ = utils::remove_dir_all_if_exists(&vol_dir);
            return Err(VolumeStoreError::Io {
                path: record,
                source: err,
            });
        }
        tracing::debug!(name, anonymous, "volume created");
        Ok(volume)
    }

    /// Creates a volume with a generated name.
    pub fn create_anonymous(&self) -> Result<Volume> {
        self.create(&utils::generate_id(), HashMap::new(), true)
    }

    pub fn get(&self, name: &str) -> Result<Option<Volume>> {
        utils::validate_name(name)?;
        let record = self.store.volume_dir(name).join(VolumeStore::RECORD_FILE);
        let data = match fs::read(&record) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(VolumeStoreError::Io {
                    path: record,
                    source: err,
                })
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| VolumeStoreError::Parse {
                path: record,
                source: err,
            })
    }

    pub fn list(&self) -> Result<Vec<Volume>> {
        let entries = fs::read_dir(&self.store.dir).map_err(|err| VolumeStoreError::Io {
            path: self.store.dir.clone(),
            source: err,
        })?;
        let mut volumes = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match self.get(&name) {
                Ok(Some(volume)) => volumes.push(volume),
                Ok(None) => {}
                Err(err) => tracing::warn!(name, %err, "skipping unreadable volume"),
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Removes a volume and its data.
    pub fn remove(&self, name: &str) -> Result<()> {
        if self.get(name)?.is_none() {
            return Err(VolumeStoreError::NotFound(name.to_owned()));
        }
        let vol_dir = self.store.volume_dir(name);
        utils::remove_dir_all_if_exists(&vol_dir).map_err(|err| VolumeStoreError::Io {
            path: vol_dir,
            source: err,
        })?;
        tracing::debug!(name, "volume removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_create_get_list_remove() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = VolumeStore::new(tmp.path(), "default")?;
        let guard = store.lock()?;
        let labels = HashMap::from([("app".to_owned(), "web".to_owned())]);
        let vol = guard.create("data", labels.clone(), false)?;
        assert!(vol.mountpoint.is_dir());
        assert_eq!(
            vol.mountpoint,
            tmp.path().join("volumes/default/data/_data")
        );

        let again = guard.create("data", HashMap::new(), false)?;
        assert_eq!(again.labels, labels, "existing volume must be returned");

        let anon = guard.create_anonymous()?;
        assert!(anon.anonymous);
        assert_eq!(anon.name.len(), 64);

        let names: Vec<_> = guard.list()?.into_iter().map(|v| v.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"data".to_owned()));

        guard.remove("data")?;
        assert_eq!(guard.get("data")?, None);
        assert!(matches!(guard.remove("data"), Err(VolumeStoreError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_list_without_guard_takes_lock() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = VolumeStore::new(tmp.path(), "default")?;
        store.lock()?.create("data", HashMap::new(), false)?;
        assert_eq!(store.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_volume_name() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = VolumeStore::new(tmp.path(), "default")?;
        let guard = store.lock()?;
        assert!(matches!(
            guard.create("../x", HashMap::new(), false),
            Err(VolumeStoreError::InvalidName(_))
        ));
        Ok(())
    }

    #[test]
    fn test_lock_serializes_independent_stores() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let events = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|tag| {
                let root = tmp.path().to_path_buf();
                let events = Arc::clone(&events);
                std::thread::spawn(move || -> Result<()> {
                    let store = VolumeStore::new(&root, "default")?;
                    let guard = store.lock()?;
                    events.lock().unwrap().push(format!("{tag}-enter"));
                    guard.create_anonymous()?;
                    std::thread::sleep(Duration::from_millis(50));
                    events.lock().unwrap().push(format!("{tag}-exit"));
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked")?;
        }

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 4);
        for pair in events.chunks(2) {
            let tag = pair[0].trim_end_matches("-enter");
            assert_eq!(pair[1], format!("{tag}-exit"), "interleaved: {events:?}");
        }
        Ok(())
    }
}
