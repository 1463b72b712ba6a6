//! IPC namespace modes.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use oci_spec::runtime::{LinuxNamespaceType, MountBuilder};

use crate::container::walker::{ContainerWalker, WalkError};
use crate::error::ValidationError;
use crate::labels::{self, InternalLabels};
use crate::ocispec::platform::{remove_namespace, set_namespace};
use crate::ocispec::{opt, SpecError, SpecOpt};
use crate::runtime::{self, Runtime, RuntimeError};
use crate::utils;

const SHM_DIR: &str = "shm";
const SHM_DESTINATION: &str = "/dev/shm";

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Labels(#[from] labels::LabelsError),
    #[error("container {0} does not share its IPC namespace, create it with --ipc=shareable")]
    NotShareable(String),
    #[error("failed to prepare {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IpcMode {
    #[default]
    Private,
    Shareable,
    Host,
    Container(String),
}

impl FromStr for IpcMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "private" => Ok(Self::Private),
            "shareable" => Ok(Self::Shareable),
            "host" => Ok(Self::Host),
            other => match other.strip_prefix("container:") {
                Some(target) if !target.is_empty() => Ok(Self::Container(target.to_owned())),
                _ => Err(ValidationError::IpcMode(s.to_owned())),
            },
        }
    }
}

impl fmt::Display for IpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Shareable => write!(f, "shareable"),
            Self::Host => write!(f, "host"),
            Self::Container(target) => write!(f, "container:{target}"),
        }
    }
}

fn shm_bind(source: PathBuf) -> Result<oci_spec::runtime::Mount, SpecError> {
    Ok(MountBuilder::default()
        .destination(SHM_DESTINATION)
        .typ("bind")
        .source(source)
        .options(vec![
            "rbind".to_owned(),
            "nosuid".to_owned(),
            "noexec".to_owned(),
            "nodev".to_owned(),
        ])
        .build()?)
}

fn with_shm_mount(source: PathBuf) -> SpecOpt {
    opt(move |spec| {
        let mount = shm_bind(source)?;
        let mut mounts = spec.mounts().clone().unwrap_or_default();
        mounts.retain(|m| m.destination() != Path::new(SHM_DESTINATION));
        mounts.push(mount);
        spec.set_mounts(Some(mounts));
        Ok(())
    })
}

fn with_shm_size(size: u64) -> SpecOpt {
    opt(move |spec| {
        if let Some(mut mounts) = spec.mounts().clone() {
            let shm = Path::new(SHM_DESTINATION);
            for mount in mounts.iter_mut().filter(|m| m.destination() == shm) {
                let mut options: Vec<String> = mount
                    .options()
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|o| !o.starts_with("size="))
                    .collect();
                options.push(format!("size={size}"));
                mount.set_options(Some(options));
            }
            spec.set_mounts(Some(mounts));
        }
        Ok(())
    })
}

/// Spec options for `mode`. A shareable container gets its `/dev/shm`
/// from a directory under its state directory so that other containers
/// can bind the same one.
pub fn spec_opts(
    mode: &IpcMode,
    state_dir: &Path,
    shm_size: Option<u64>,
    runtime: &dyn Runtime,
) -> Result<Vec<SpecOpt>, IpcError> {
    let mut opts = Vec::new();
    match mode {
        IpcMode::Private => {
            if let Some(size) = shm_size {
                opts.push(with_shm_size(size));
            }
        }
        IpcMode::Shareable => {
            let dir = state_dir.join(SHM_DIR);
            std::fs::create_dir_all(&dir).map_err(|err| {
                tracing::error!(?dir, %err, "failed to create shareable shm directory");
                IpcError::Io {
                    path: dir.clone(),
                    source: err,
                }
            })?;
            opts.push(with_shm_mount(dir));
        }
        IpcMode::Host => {
            opts.push(with_shm_mount(PathBuf::from(SHM_DESTINATION)));
            opts.push(opt(|spec| {
                remove_namespace(spec, LinuxNamespaceType::Ipc);
                Ok(())
            }));
        }
        IpcMode::Container(target) => {
            let container = ContainerWalker::new(runtime).resolve_unique(target)?;
            let target_labels = InternalLabels::from_labels(&container.labels)?;
            let target_mode: IpcMode = target_labels.ipc.parse().unwrap_or_default();
            match target_mode {
                IpcMode::Host => {
                    return spec_opts(&IpcMode::Host, state_dir, shm_size, runtime);
                }
                IpcMode::Shareable => {}
                _ => return Err(IpcError::NotShareable(container.id)),
            }
            let task = runtime::running_task(runtime, &container.id)?;
            let ns_path = PathBuf::from(format!("/proc/{}/ns/ipc", task.pid));
            opts.push(opt(move |spec| set_namespace(spec, LinuxNamespaceType::Ipc, Some(ns_path))));
            opts.push(with_shm_mount(target_labels.state_dir.join(SHM_DIR)));
        }
    }
    Ok(opts)
}

/// Releases IPC resources owned by a container. Safe to call repeatedly.
pub fn cleanup(state_dir: &Path) -> Result<(), IpcError> {
    let dir = state_dir.join(SHM_DIR);
    utils::remove_dir_all_if_exists(&dir).map_err(|err| IpcError::Io {
        path: dir,
        source: err,
    })
}
