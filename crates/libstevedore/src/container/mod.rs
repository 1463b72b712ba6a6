//! Container lifecycle operations.
pub mod create;
pub mod inspect;
pub mod remove;
pub mod rename;
pub mod request;
pub mod walker;

pub use create::{create_container, CreateError, RollbackKind, Stage};
pub use inspect::{inspect_container, ContainerInspect};
pub use remove::{remove_container, RemoveOptions};
pub use rename::rename_container;
pub use request::{ContainerCreateRequest, ContainerName, ImageSource};
pub use walker::{ContainerWalker, Found, WalkError};

use crate::config::GlobalConfig;
use crate::hostsstore::HostsStore;
use crate::image::ImageService;
use crate::network::{NetworkContext, NetworkProvider};
use crate::runtime::Runtime;

/// The collaborators every lifecycle operation talks to.
#[derive(Clone, Copy)]
pub struct Backend<'a> {
    pub config: &'a GlobalConfig,
    pub runtime: &'a dyn Runtime,
    pub images: &'a dyn ImageService,
    pub networks: &'a dyn NetworkProvider,
}

impl<'a> Backend<'a> {
    pub fn walker(&self) -> ContainerWalker<'a> {
        ContainerWalker::new(self.runtime)
    }

    fn network_context(
        &self,
        hosts: &'a HostsStore,
        state_dir: std::path::PathBuf,
    ) -> NetworkContext<'a> {
        NetworkContext {
            runtime: self.runtime,
            hosts,
            state_dir,
        }
    }
}
