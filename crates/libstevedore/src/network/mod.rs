//! Network collaborator.
//!
//! A [`NetworkProvider`] builds one [`NetworkOptionsManager`] per create
//! call. The manager verifies the requested options, contributes spec and
//! container options, reports the networking facts recorded in the
//! container's labels, and activates or tears down networking.
//!
//! Only the modes that need no plugin are implemented here: `none`, `host`
//! and `container:<id>`. CNI networks are rejected.
mod manager;
pub mod ports;
pub mod resolvconf;

pub use manager::{ContainerManager, StandaloneManager};

use std::fmt;
use std::path::PathBuf;

use oci_spec::runtime::{Mount, MountBuilder};

use crate::container::walker::WalkError;
use crate::hostsstore::{HostsStore, HostsStoreError};
use crate::labels::{InternalLabels, LabelsError};
use crate::ocispec::{SpecError, SpecOpt};
use crate::runtime::{ContainerRecord, NewContainer, Runtime, RuntimeError};
use ports::PortMapping;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network {0:?} is not supported, only none, host and container:<id> are available")]
    Unsupported(String),
    #[error("network mode {0} cannot be combined with other networks")]
    ExclusiveMode(String),
    #[error("{option} cannot be used with network mode {mode}")]
    Conflict { option: &'static str, mode: String },
    #[error("invalid published port {0:?}")]
    InvalidPort(String),
    #[error("invalid {option} value {value:?}")]
    Invalid { option: &'static str, value: String },
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    HostsStore(#[from] HostsStoreError),
    #[error(transparent)]
    Labels(#[from] LabelsError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("failed to determine the host name")]
    Hostname(#[source] nix::Error),
    #[error("failed to write {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("network setup failed: {0}")]
    Setup(String),
}

impl From<oci_spec::OciSpecError> for NetworkError {
    fn from(err: oci_spec::OciSpecError) -> Self {
        Self::Spec(SpecError::Oci(err))
    }
}

/// Networking part of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub networks: Vec<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub ip6_address: Option<String>,
    pub ports: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
    pub extra_hosts: Vec<String>,
    /// Container name, resolved by the pipeline before networking is
    /// configured.
    pub name: String,
}

impl NetworkOptions {
    /// Rebuilds the options of an existing container from its labels, for
    /// teardown.
    pub fn from_labels(labels: &InternalLabels) -> Self {
        Self {
            networks: labels.networks.clone(),
            hostname: Some(labels.hostname.clone()).filter(|h| !h.is_empty()),
            domainname: Some(labels.domainname.clone()).filter(|d| !d.is_empty()),
            mac_address: labels.mac_address.clone(),
            ip_address: labels.ip_address.clone(),
            ip6_address: labels.ip6_address.clone(),
            ports: labels.ports.iter().map(PortMapping::to_spec).collect(),
            extra_hosts: labels.extra_hosts.clone(),
            name: labels.name.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Host,
    Container(String),
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Host => write!(f, "host"),
            Self::Container(target) => write!(f, "container:{target}"),
        }
    }
}

impl NetworkMode {
    pub fn parse(network: &str) -> Result<Self, NetworkError> {
        match network {
            "none" => Ok(Self::None),
            "host" => Ok(Self::Host),
            other => match other.strip_prefix("container:") {
                Some(target) if !target.is_empty() => Ok(Self::Container(target.to_owned())),
                _ => Err(NetworkError::Unsupported(other.to_owned())),
            },
        }
    }

    /// Parses every requested network. An empty list is valid and means
    /// the configured default network.
    pub fn parse_all(networks: &[String]) -> Result<Vec<Self>, NetworkError> {
        let modes = networks
            .iter()
            .map(|n| Self::parse(n))
            .collect::<Result<Vec<_>, _>>()?;
        if modes.len() > 1 {
            return Err(NetworkError::ExclusiveMode(modes[0].to_string()));
        }
        Ok(modes)
    }
}

/// Networking facts recorded on the container object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkingLabels {
    pub hostname: String,
    pub ports: Vec<PortMapping>,
    pub ip_address: Option<String>,
    pub ip6_address: Option<String>,
    pub mac_address: Option<String>,
    pub networks: Vec<String>,
}

/// An option applied to the container object just before it is created.
pub type ContainerOpt = Box<dyn FnOnce(&mut NewContainer) -> Result<(), NetworkError>>;

/// What a manager may touch while configuring networking.
#[derive(Clone)]
pub struct NetworkContext<'a> {
    pub runtime: &'a dyn Runtime,
    pub hosts: &'a HostsStore,
    /// State directory of the container being configured.
    pub state_dir: PathBuf,
}

pub trait NetworkOptionsManager {
    fn network_options(&self) -> &NetworkOptions;
    /// Rejects option combinations the mode cannot honour. No side effects.
    fn verify_network_options(&self) -> Result<(), NetworkError>;
    /// Generates the files and options for container `id`. May allocate a
    /// hosts store entry.
    fn container_networking_opts(
        &mut self,
        id: &str,
    ) -> Result<(Vec<SpecOpt>, Vec<ContainerOpt>), NetworkError>;
    fn internal_networking_option_labels(&self) -> Result<NetworkingLabels, NetworkError>;
    /// Activates networking once the container object exists.
    fn setup_networking(&self, id: &str) -> Result<(), NetworkError>;
    /// Releases everything networking allocated for `container`.
    fn cleanup_networking(&self, container: &ContainerRecord) -> Result<(), NetworkError>;
}

pub trait NetworkProvider {
    fn manager<'a>(
        &self,
        options: NetworkOptions,
        ctx: NetworkContext<'a>,
    ) -> Result<Box<dyn NetworkOptionsManager + 'a>, NetworkError>;
}

/// Provider of the built-in modes. `default_network` is used when a
/// request names no network.
#[derive(Debug, Clone)]
pub struct DefaultNetworkProvider {
    default_network: String,
}

impl DefaultNetworkProvider {
    pub fn new<S: Into<String>>(default_network: S) -> Self {
        Self {
            default_network: default_network.into(),
        }
    }
}

impl NetworkProvider for DefaultNetworkProvider {
    fn manager<'a>(
        &self,
        mut options: NetworkOptions,
        ctx: NetworkContext<'a>,
    ) -> Result<Box<dyn NetworkOptionsManager + 'a>, NetworkError> {
        if options.networks.is_empty() {
            options.networks = vec![self.default_network.clone()];
        }
        let mode = NetworkMode::parse_all(&options.networks)?
            .into_iter()
            .next()
            .ok_or_else(|| NetworkError::Unsupported(String::new()))?;
        tracing::debug!(%mode, "network mode selected");
        Ok(match mode {
            NetworkMode::None => Box::new(StandaloneManager::new(options, ctx, false)),
            NetworkMode::Host => Box::new(StandaloneManager::new(options, ctx, true)),
            NetworkMode::Container(target) => Box::new(ContainerManager::new(options, ctx, target)),
        })
    }
}

fn etc_bind(source: PathBuf, destination: &str) -> Result<Mount, NetworkError> {
    Ok(MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(source)
        .options(vec!["rbind".to_owned(), "rprivate".to_owned()])
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(NetworkMode::parse("none").unwrap(), NetworkMode::None);
        assert_eq!(
            NetworkMode::parse("container:web").unwrap(),
            NetworkMode::Container("web".to_owned())
        );
        assert!(matches!(
            NetworkMode::parse("bridge"),
            Err(NetworkError::Unsupported(_))
        ));
        assert!(matches!(
            NetworkMode::parse("container:"),
            Err(NetworkError::Unsupported(_))
        ));
    }

    #[test]
    fn test_parse_all() {
        assert!(NetworkMode::parse_all(&[]).unwrap().is_empty());
        assert_eq!(
            NetworkMode::parse_all(&strings(&["host"])).unwrap(),
            vec![NetworkMode::Host]
        );
        assert!(matches!(
            NetworkMode::parse_all(&strings(&["none", "host"])),
            Err(NetworkError::ExclusiveMode(_))
        ));
    }

    #[test]
    fn test_options_from_labels() {
        let labels = InternalLabels {
            networks: strings(&["host"]),
            hostname: "box".to_owned(),
            ports: vec![PortMapping::parse("8080:80").unwrap()],
            name: "web".to_owned(),
            ..Default::default()
        };
        let options = NetworkOptions::from_labels(&labels);
        assert_eq!(options.networks, strings(&["host"]));
        assert_eq!(options.hostname.as_deref(), Some("box"));
        assert_eq!(options.domainname, None);
        assert_eq!(options.ports, strings(&["8080:80/tcp"]));
        assert_eq!(options.name, "web");
    }
}
