use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::instrument;

use super::{ContainerRecord, NewContainer, Runtime, RuntimeError, TaskInfo};
use crate::lock::DirLock;
use crate::utils;

type Result<T> = std::result::Result<T, RuntimeError>;

/// File backed container metadata for hosts without a runtime daemon
/// socket. Records live in `<data_root>/runtime/<ns>/containers/<id>.json`.
/// There is no task service, so no container ever has a task.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    dir: PathBuf,
}

impl LocalRuntime {
    const LOCK_FILE: &'static str = ".lock";

    pub fn new(data_root: &Path, namespace: &str) -> Result<Self> {
        let dir = data_root.join("runtime").join(namespace).join("containers");
        fs::create_dir_all(&dir).map_err(|err| RuntimeError::Io {
            path: dir.clone(),
            source: err,
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock(&self) -> Result<DirLock> {
        Ok(DirLock::acquire(self.dir.join(Self::LOCK_FILE))?)
    }

    fn load(&self, id: &str) -> Result<ContainerRecord> {
        let path = self.record_path(id);
        let file = fs::File::open(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                RuntimeError::NotFound(id.to_owned())
            } else {
                RuntimeError::Io {
                    path: path.clone(),
                    source: err,
                }
            }
        })?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| RuntimeError::Serde { path, source: err })
    }

    fn store(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let data = serde_json::to_vec(record).map_err(|err| RuntimeError::Serde {
            path: path.clone(),
            source: err,
        })?;
        utils::atomic_write(&path, &data).map_err(|err| RuntimeError::Io { path, source: err })
    }
}

impl Runtime for LocalRuntime {
    #[instrument(level = "debug", skip(self, new), fields(id = %new.id))]
    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord> {
        let record = ContainerRecord::from_new(new);
        let path = self.record_path(&record.id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == ErrorKind::AlreadyExists {
                    RuntimeError::AlreadyExists(record.id.clone())
                } else {
                    tracing::error!(?path, %err, "failed to create container record");
                    RuntimeError::Io {
                        path: path.clone(),
                        source: err,
                    }
                }
            })?;
        let mut writer = BufWriter::new(file);
        let written = serde_json::to_writer(&mut writer, &record)
            .map_err(|err| RuntimeError::Serde {
                path: path.clone(),
                source: err,
            })
            .and_then(|_| {
                writer
                    .flush()
                    .map_err(|err| RuntimeError::Io {
                        path: path.clone(),
                        source: err,
                    })
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        Ok(record)
    }

    fn containers(&self) -> Result<Vec<ContainerRecord>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| RuntimeError::Io {
            path: self.dir.clone(),
            source: err,
        })?;
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = file_name.strip_suffix(".json") else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            match self.load(id) {
                Ok(record) => records.push(record),
                // removed concurrently
                Err(RuntimeError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    fn container(&self, id: &str) -> Result<ContainerRecord> {
        self.load(id)
    }

    fn set_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let _lock = self.lock()?;
        let mut record = self.load(id)?;
        record.labels.extend(labels);
        self.store(&record)?;
        Ok(record.labels)
    }

    fn delete_container(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        fs::remove_file(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                RuntimeError::NotFound(id.to_owned())
            } else {
                RuntimeError::Io { path, source: err }
            }
        })
    }

    fn task(&self, _id: &str) -> Result<Option<TaskInfo>> {
        Ok(None)
    }

    fn kill_task(&self, _id: &str, _signal: &str) -> Result<()> {
        Err(RuntimeError::TaskUnsupported { op: "kill" })
    }

    fn delete_task(&self, _id: &str) -> Result<()> {
        Err(RuntimeError::TaskUnsupported { op: "delete" })
    }
}
