//! Container lifecycle orchestration for the stevedore client.
//!
//! The crate owns the on-disk side state of a runtime namespace (names,
//! generated hosts files, volumes), the identifier walker used to resolve
//! user input to live containers, and the creation pipeline that ties them
//! together with the runtime, image and network collaborators.
pub mod config;
pub mod container;
pub mod error;
pub mod hostsstore;
pub mod image;
pub mod ipc;
pub mod labels;
pub mod lock;
pub mod logdriver;
pub mod mounts;
pub mod namestore;
pub mod network;
pub mod ocispec;
pub mod runtime;
pub mod utils;
pub mod volumestore;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

use std::path::Path;

/// The three per-namespace stores, constructed explicitly for one
/// (data root, namespace) pair and passed into every operation that
/// mutates side state.
#[derive(Debug, Clone)]
pub struct Stores {
    pub names: namestore::NameStore,
    pub hosts: hostsstore::HostsStore,
    pub volumes: volumestore::VolumeStore,
}

impl Stores {
    pub fn open(data_root: &Path, namespace: &str) -> Result<Self, error::LibstevedoreError> {
        Ok(Self {
            names: namestore::NameStore::new(data_root, namespace)?,
            hosts: hostsstore::HostsStore::new(data_root, namespace)?,
            volumes: volumestore::VolumeStore::new(data_root, namespace)?,
        })
    }
}
