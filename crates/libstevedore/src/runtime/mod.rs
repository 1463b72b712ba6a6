//! Boundary to the container runtime daemon.
//!
//! The daemon owns container objects (spec, image, snapshot and a flat
//! label map) and their tasks. Everything here talks to it through the
//! [`Runtime`] trait so the orchestration logic can run against the local
//! metadata store or an in-memory fake.
mod local;

pub use local::LocalRuntime;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

use crate::labels;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {0} already exists")]
    AlreadyExists(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("failed to access runtime metadata {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to (de)serialize runtime metadata {path:?}")]
    Serde {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),
    #[error("task operation {op} is not supported by this runtime")]
    TaskUnsupported { op: &'static str },
    #[error("container {0} is not running")]
    NotRunning(String),
    #[error("{0}")]
    Other(String),
}

/// Indicates status of the task of a container
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };

        write!(f, "{print}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: i32,
    pub status: TaskStatus,
}

/// Everything needed to create a container object.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub image: Option<String>,
    pub snapshotter: String,
    pub snapshot_key: Option<String>,
    pub runtime: String,
    pub spec: Spec,
    pub labels: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub image: Option<String>,
    pub snapshotter: String,
    pub snapshot_key: Option<String>,
    pub runtime: String,
    pub spec: Spec,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn from_new(new: NewContainer) -> Self {
        Self {
            id: new.id,
            labels: new.labels,
            image: new.image,
            snapshotter: new.snapshotter,
            snapshot_key: new.snapshot_key,
            runtime: new.runtime,
            spec: new.spec,
            created_at: Utc::now(),
        }
    }

    /// The name recorded in the container's labels, empty if anonymous.
    pub fn name(&self) -> &str {
        self.labels
            .get(labels::NAME)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The subset of the runtime daemon's API the orchestration core uses.
pub trait Runtime {
    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord, RuntimeError>;
    /// Every container object of the namespace, in no particular order.
    fn containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError>;
    fn container(&self, id: &str) -> Result<ContainerRecord, RuntimeError>;
    /// Merges `labels` into the labels of `id`, returning the result.
    fn set_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<HashMap<String, String>, RuntimeError>;
    fn delete_container(&self, id: &str) -> Result<(), RuntimeError>;
    fn task(&self, id: &str) -> Result<Option<TaskInfo>, RuntimeError>;
    fn kill_task(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;
    fn delete_task(&self, id: &str) -> Result<(), RuntimeError>;
}

/// The task of `id`, which must be running. Used to join the namespaces
/// of another container.
pub fn running_task(runtime: &dyn Runtime, id: &str) -> Result<TaskInfo, RuntimeError> {
    match runtime.task(id)? {
        Some(task) if task.status.is_running() && task.pid > 0 => Ok(task),
        _ => Err(RuntimeError::NotRunning(id.to_owned())),
    }
}
