//! Generators of OCI runtime spec options.
//!
//! Every stage of the creation pipeline contributes [`SpecOpt`]s; they are
//! applied in order to a default spec only once the runtime object is about
//! to be created, so a failing stage never leaves a half-built spec behind.
pub mod platform;
pub mod process;
pub mod security;
pub mod user;

use std::path::PathBuf;

use oci_spec::runtime::{Mount, Spec};

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error(transparent)]
    Oci(#[from] oci_spec::OciSpecError),
    #[error("no command specified")]
    NoCommand,
    #[error("--privileged is incompatible with systemd mode unless the security option privileged-without-host-devices is set")]
    SystemdPrivileged,
    #[error("unknown capability {0:?}")]
    UnknownCapability(String),
    #[error("invalid security option {0:?}")]
    SecurityOpt(String),
    #[error("invalid user {0:?}")]
    User(String),
    #[error("failed to read {path:?} from the container rootfs")]
    RootfsFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {option} value {value:?}")]
    Invalid { option: &'static str, value: String },
}

pub type SpecOpt = Box<dyn FnOnce(&mut Spec) -> Result<(), SpecError>>;

/// Wraps a closure as a [`SpecOpt`].
pub fn opt<F>(f: F) -> SpecOpt
where
    F: FnOnce(&mut Spec) -> Result<(), SpecError> + 'static,
{
    Box::new(f)
}

/// Builds the final spec by applying `opts` in order to the default spec.
pub fn generate(opts: Vec<SpecOpt>) -> Result<Spec, SpecError> {
    let mut spec = Spec::default();
    for opt in opts {
        opt(&mut spec)?;
    }
    Ok(spec)
}

/// Appends `mounts`, replacing existing mounts on the same destinations.
pub fn with_mounts(mounts: Vec<Mount>) -> SpecOpt {
    opt(move |spec| {
        let mut existing = spec.mounts().clone().unwrap_or_default();
        existing.retain(|m| !mounts.iter().any(|n| n.destination() == m.destination()));
        existing.extend(mounts);
        spec.set_mounts(Some(existing));
        Ok(())
    })
}
