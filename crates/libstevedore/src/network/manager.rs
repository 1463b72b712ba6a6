use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use oci_spec::runtime::LinuxNamespaceType;

use super::ports::PortMapping;
use super::resolvconf::ResolvConf;
use super::{
    etc_bind, ContainerOpt, NetworkContext, NetworkError, NetworkOptions, NetworkOptionsManager,
    NetworkingLabels,
};
use crate::container::walker::ContainerWalker;
use crate::hostsstore::{ExtraHost, Meta};
use crate::labels::{self, InternalLabels};
use crate::ocispec::platform::{remove_namespace, set_namespace};
use crate::ocispec::{opt, with_mounts, SpecOpt};
use crate::runtime::{self, ContainerRecord};
use crate::utils;

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const RESOLV_CONF: &str = "resolv.conf";
const HOSTNAME: &str = "hostname";

fn write_state_file(path: &Path, content: &str) -> Result<(), NetworkError> {
    utils::atomic_write(path, content.as_bytes()).map_err(|err| {
        tracing::error!(?path, %err, "failed to write network file");
        NetworkError::Io {
            path: path.to_path_buf(),
            source: err,
        }
    })
}

fn reject(option: &'static str, set: bool, mode: &str) -> Result<(), NetworkError> {
    if set {
        return Err(NetworkError::Conflict {
            option,
            mode: mode.to_owned(),
        });
    }
    Ok(())
}

fn host_hostname() -> Result<String, NetworkError> {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .map_err(NetworkError::Hostname)
}

/// Manager of the `none` and `host` modes. Neither needs a plugin; both
/// get a generated `/etc/hosts`, `/etc/resolv.conf` and `/etc/hostname`.
pub struct StandaloneManager<'a> {
    options: NetworkOptions,
    ctx: NetworkContext<'a>,
    host: bool,
    hostname: Option<String>,
}

impl<'a> StandaloneManager<'a> {
    pub fn new(options: NetworkOptions, ctx: NetworkContext<'a>, host: bool) -> Self {
        Self {
            options,
            ctx,
            host,
            hostname: None,
        }
    }

    fn mode(&self) -> &'static str {
        if self.host {
            "host"
        } else {
            "none"
        }
    }

    fn resolv_conf(&self) -> Result<String, NetworkError> {
        let host_conf = match fs::read_to_string(HOST_RESOLV_CONF) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(%err, "failed to read the host resolv.conf");
                String::new()
            }
        };
        let opts = &self.options;
        let no_overrides =
            opts.dns.is_empty() && opts.dns_search.is_empty() && opts.dns_options.is_empty();
        if self.host && no_overrides {
            return Ok(host_conf);
        }
        let mut conf = ResolvConf::parse(&host_conf);
        if !self.host {
            conf = conf.without_loopback();
        }
        Ok(conf
            .with_overrides(&opts.dns, &opts.dns_search, &opts.dns_options)
            .render())
    }
}

impl NetworkOptionsManager for StandaloneManager<'_> {
    fn network_options(&self) -> &NetworkOptions {
        &self.options
    }

    fn verify_network_options(&self) -> Result<(), NetworkError> {
        let opts = &self.options;
        let mode = self.mode();
        reject("--ip", opts.ip_address.is_some(), mode)?;
        reject("--ip6", opts.ip6_address.is_some(), mode)?;
        reject("--mac-address", opts.mac_address.is_some(), mode)?;
        if !self.host {
            reject("--publish", !opts.ports.is_empty(), mode)?;
        } else if !opts.ports.is_empty() {
            tracing::warn!("published ports are discarded when using host network mode");
        }
        for dns in &opts.dns {
            dns.parse::<IpAddr>().map_err(|_| NetworkError::Invalid {
                option: "dns",
                value: dns.clone(),
            })?;
        }
        for host in &opts.extra_hosts {
            ExtraHost::parse(host)?;
        }
        Ok(())
    }

    fn container_networking_opts(
        &mut self,
        id: &str,
    ) -> Result<(Vec<SpecOpt>, Vec<ContainerOpt>), NetworkError> {
        let hostname = match &self.options.hostname {
            Some(hostname) => hostname.clone(),
            None if self.host => host_hostname()?,
            None => utils::short_id(id).to_owned(),
        };
        let domainname = self.options.domainname.clone().unwrap_or_default();

        let state_dir = &self.ctx.state_dir;
        let hostname_path = state_dir.join(HOSTNAME);
        write_state_file(&hostname_path, &format!("{hostname}\n"))?;
        let resolv_path = state_dir.join(RESOLV_CONF);
        write_state_file(&resolv_path, &self.resolv_conf()?)?;

        let extra_hosts = self
            .options
            .extra_hosts
            .iter()
            .map(|h| ExtraHost::parse(h))
            .collect::<Result<Vec<_>, _>>()?;
        let hosts_path = self.ctx.hosts.acquire(Meta {
            id: id.to_owned(),
            hostname: hostname.clone(),
            domainname: domainname.clone(),
            name: self.options.name.clone(),
            networks: vec![self.mode().to_owned()],
            addresses: Vec::new(),
            extra_hosts,
        })?;

        let mounts = vec![
            etc_bind(hosts_path, "/etc/hosts")?,
            etc_bind(resolv_path, "/etc/resolv.conf")?,
            etc_bind(hostname_path, "/etc/hostname")?,
        ];
        let host = self.host;
        let spec_hostname = hostname.clone();
        let spec_opts = vec![
            with_mounts(mounts),
            opt(move |spec| {
                if host {
                    remove_namespace(spec, LinuxNamespaceType::Network);
                }
                spec.set_hostname(Some(spec_hostname));
                if !domainname.is_empty() {
                    spec.set_domainname(Some(domainname));
                }
                Ok(())
            }),
        ];

        self.hostname = Some(hostname);
        Ok((spec_opts, Vec::new()))
    }

    fn internal_networking_option_labels(&self) -> Result<NetworkingLabels, NetworkError> {
        let ports = if self.host {
            Vec::new()
        } else {
            self.options
                .ports
                .iter()
                .map(|p| PortMapping::parse(p))
                .collect::<Result<_, _>>()?
        };
        Ok(NetworkingLabels {
            hostname: self
                .hostname
                .clone()
                .or_else(|| self.options.hostname.clone())
                .unwrap_or_default(),
            ports,
            networks: vec![self.mode().to_owned()],
            ..Default::default()
        })
    }

    fn setup_networking(&self, id: &str) -> Result<(), NetworkError> {
        tracing::debug!(id, mode = self.mode(), "no network setup needed");
        Ok(())
    }

    fn cleanup_networking(&self, container: &ContainerRecord) -> Result<(), NetworkError> {
        self.ctx.hosts.dealloc(&container.id)?;
        Ok(())
    }
}

/// Manager of `container:<id>`: joins the network namespace of another,
/// running container and shares its network files.
pub struct ContainerManager<'a> {
    options: NetworkOptions,
    ctx: NetworkContext<'a>,
    target: String,
    joined: Option<InternalLabels>,
}

impl<'a> ContainerManager<'a> {
    pub fn new(options: NetworkOptions, ctx: NetworkContext<'a>, target: String) -> Self {
        Self {
            options,
            ctx,
            target,
            joined: None,
        }
    }
}

impl NetworkOptionsManager for ContainerManager<'_> {
    fn network_options(&self) -> &NetworkOptions {
        &self.options
    }

    fn verify_network_options(&self) -> Result<(), NetworkError> {
        let opts = &self.options;
        let mode = "container";
        reject("--hostname", opts.hostname.is_some(), mode)?;
        reject("--domainname", opts.domainname.is_some(), mode)?;
        reject("--publish", !opts.ports.is_empty(), mode)?;
        reject("--dns", !opts.dns.is_empty(), mode)?;
        reject("--dns-search", !opts.dns_search.is_empty(), mode)?;
        reject("--dns-option", !opts.dns_options.is_empty(), mode)?;
        reject("--add-host", !opts.extra_hosts.is_empty(), mode)?;
        reject("--mac-address", opts.mac_address.is_some(), mode)?;
        reject("--ip", opts.ip_address.is_some(), mode)?;
        reject("--ip6", opts.ip6_address.is_some(), mode)?;
        Ok(())
    }

    fn container_networking_opts(
        &mut self,
        id: &str,
    ) -> Result<(Vec<SpecOpt>, Vec<ContainerOpt>), NetworkError> {
        let target = ContainerWalker::new(self.ctx.runtime).resolve_unique(&self.target)?;
        if target.id == id {
            return Err(NetworkError::Invalid {
                option: "network",
                value: self.target.clone(),
            });
        }
        let task = runtime::running_task(self.ctx.runtime, &target.id)?;
        let target_labels = InternalLabels::from_labels(&target.labels)?;

        let mut mounts = Vec::new();
        let shared_files: [(PathBuf, &str); 3] = [
            (self.ctx.hosts.hosts_path(&target.id), "/etc/hosts"),
            (target_labels.state_dir.join(RESOLV_CONF), "/etc/resolv.conf"),
            (target_labels.state_dir.join(HOSTNAME), "/etc/hostname"),
        ];
        for (source, destination) in shared_files {
            if source.exists() {
                mounts.push(etc_bind(source, destination)?);
            }
        }

        let ns_path = PathBuf::from(format!("/proc/{}/ns/net", task.pid));
        let hostname = target_labels.hostname.clone();
        let spec_opts = vec![
            with_mounts(mounts),
            opt(move |spec| {
                set_namespace(spec, LinuxNamespaceType::Network, Some(ns_path))?;
                if !hostname.is_empty() {
                    spec.set_hostname(Some(hostname));
                }
                Ok(())
            }),
        ];

        // Pin the resolved ID so that renaming the target later does not
        // change what this container is attached to.
        let network = format!("container:{}", target.id);
        let container_opts: Vec<ContainerOpt> = vec![Box::new(move |new| {
            let networks = serde_json::to_string(&[network]).map_err(|err| {
                NetworkError::Labels(labels::LabelsError::Encode {
                    key: labels::NETWORKS,
                    source: err,
                })
            })?;
            new.labels.insert(labels::NETWORKS.to_owned(), networks);
            Ok(())
        })];

        tracing::debug!(id, target = %target.id, pid = task.pid, "joining container network");
        self.joined = Some(target_labels);
        Ok((spec_opts, container_opts))
    }

    fn internal_networking_option_labels(&self) -> Result<NetworkingLabels, NetworkError> {
        Ok(NetworkingLabels {
            hostname: self
                .joined
                .as_ref()
                .map(|l| l.hostname.clone())
                .unwrap_or_default(),
            networks: vec![format!("container:{}", self.target)],
            ..Default::default()
        })
    }

    fn setup_networking(&self, _id: &str) -> Result<(), NetworkError> {
        Ok(())
    }

    fn cleanup_networking(&self, container: &ContainerRecord) -> Result<(), NetworkError> {
        tracing::debug!(
            id = %container.id,
            "container shares another network namespace, nothing to clean up"
        );
        Ok(())
    }
}
