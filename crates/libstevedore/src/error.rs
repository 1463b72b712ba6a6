use crate::config::ConfigError;
use crate::container::walker::WalkError;
use crate::hostsstore::HostsStoreError;
use crate::image::ImageError;
use crate::ipc::IpcError;
use crate::labels::LabelsError;
use crate::lock::LockError;
use crate::logdriver::LogDriverError;
use crate::mounts::MountError;
use crate::namestore::NameStoreError;
use crate::network::NetworkError;
use crate::ocispec::SpecError;
use crate::runtime::RuntimeError;
use crate::utils::MkdirWithModeError;
use crate::volumestore::VolumeStoreError;

/// Rejections of a malformed request. These are raised before any side
/// effect takes place.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid name {0:?}: only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed")]
    Name(String),
    #[error("invalid namespace {0:?}")]
    Namespace(String),
    #[error("label {0:?} uses the reserved prefix \"stevedore/\"")]
    ReservedLabel(String),
    #[error("invalid restart policy {0:?}")]
    RestartPolicy(String),
    #[error("--rm cannot be combined with restart policy {0:?}")]
    AutoRemoveWithRestart(String),
    #[error("invalid signal {0:?}")]
    Signal(String),
    #[error("invalid size {0:?}")]
    Size(String),
    #[error("invalid umask {0:?}")]
    Umask(String),
    #[error("invalid ipc mode {0:?}")]
    IpcMode(String),
    #[error("invalid {option} value {value:?}")]
    Option { option: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LibstevedoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    NameStore(#[from] NameStoreError),
    #[error(transparent)]
    HostsStore(#[from] HostsStoreError),
    #[error(transparent)]
    VolumeStore(#[from] VolumeStoreError),
    #[error(transparent)]
    Labels(#[from] LabelsError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    LogDriver(#[from] LogDriverError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error("failed to create state directory")]
    StateDir(#[from] MkdirWithModeError),
    #[error("container {id} has a {status} task, stop it first or force the removal")]
    TaskRunning { id: String, status: String },
    #[error("container {id} is already named {name}")]
    SameName { id: String, name: String },
}
