//! Generated `/etc/hosts` files for the containers of one namespace.
//!
//! Each container with a hosts entry owns `<data_root>/etchosts/<ns>/<id>/`
//! holding `meta.json` (the facts the file is generated from) and `hosts`
//! (the file bind-mounted into the container). Any change regenerates the
//! files of every container in the namespace so peers see each other.
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lock::{DirLock, LockError};
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum HostsStoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to access hosts store path {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse hosts metadata {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid extra host {0:?}, expected host:ip")]
    InvalidExtraHost(String),
}

type Result<T> = std::result::Result<T, HostsStoreError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraHost {
    pub host: String,
    pub ip: IpAddr,
}

impl ExtraHost {
    /// Parses the `--add-host` form `host:ip`. IPv6 addresses contain
    /// colons, so the host ends at the first one.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || HostsStoreError::InvalidExtraHost(input.to_owned());
        let (host, ip) = input.split_once(':').ok_or_else(invalid)?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_owned(),
            ip: ip.parse().map_err(|_| invalid())?,
        })
    }
}

/// Everything the hosts file of one container is generated from.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub extra_hosts: Vec<ExtraHost>,
}

impl Meta {
    fn aliases(&self) -> Vec<String> {
        let mut aliases = Vec::new();
        if !self.domainname.is_empty() {
            aliases.push(format!("{}.{}", self.hostname, self.domainname));
        }
        aliases.push(self.hostname.clone());
        if !self.name.is_empty() && self.name != self.hostname {
            aliases.push(self.name.clone());
        }
        aliases
    }

    fn shares_network_with(&self, other: &Meta) -> bool {
        self.networks.iter().any(|n| other.networks.contains(n))
    }
}

const PREAMBLE: &str = "127.0.0.1\tlocalhost localhost.localdomain
::1\tlocalhost localhost.localdomain ip6-localhost ip6-loopback
fe00::0\tip6-localnet
ff00::0\tip6-mcastprefix
ff02::1\tip6-allnodes
ff02::2\tip6-allrouters
";

/// Address used for the container's own names when it has no interface
/// address of its own.
const SELF_FALLBACK_ADDRESS: &str = "127.0.1.1";

/// Renders the hosts file of `meta` given every entry of the namespace.
pub fn render(meta: &Meta, all: &[Meta]) -> String {
    let mut out = String::from(PREAMBLE);
    let aliases = meta.aliases().join(" ");
    if meta.addresses.is_empty() {
        let _ = writeln!(out, "{SELF_FALLBACK_ADDRESS}\t{aliases}");
    }
    for addr in &meta.addresses {
        let _ = writeln!(out, "{addr}\t{aliases}");
    }

    for peer in all {
        if peer.id == meta.id || !peer.shares_network_with(meta) {
            continue;
        }
        let peer_aliases = peer.aliases().join(" ");
        for addr in &peer.addresses {
            let _ = writeln!(out, "{addr}\t{peer_aliases}");
        }
    }

    for extra in &meta.extra_hosts {
        let _ = writeln!(out, "{}\t{}", extra.ip, extra.host);
    }
    out
}

#[derive(Debug, Clone)]
pub struct HostsStore {
    dir: PathBuf,
}

impl HostsStore {
    const LOCK_FILE: &'static str = ".lock";
    const META_FILE: &'static str = "meta.json";
    const HOSTS_FILE: &'static str = "hosts";

    pub fn new(data_root: &Path, namespace: &str) -> Result<Self> {
        let dir = data_root.join("etchosts").join(namespace);
        fs::create_dir_all(&dir).map_err(|err| HostsStoreError::Io {
            path: dir.clone(),
            source: err,
        })?;
        Ok(Self { dir })
    }

    pub fn hosts_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(Self::HOSTS_FILE)
    }

    /// Records `meta` and generates its hosts file, returning the path to
    /// bind-mount into the container.
    pub fn acquire(&self, meta: Meta) -> Result<PathBuf> {
        let _lock = self.lock()?;
        let entry_dir = self.dir.join(&meta.id);
        fs::create_dir_all(&entry_dir).map_err(|err| HostsStoreError::Io {
            path: entry_dir.clone(),
            source: err,
        })?;
        self.write_meta(&meta)?;
        self.regenerate_locked()?;
        tracing::debug!(id = %meta.id, "hosts entry allocated");
        Ok(self.hosts_path(&meta.id))
    }

    /// Updates the name recorded for `id` and regenerates every hosts file.
    /// Containers without an entry, such as those sharing another
    /// container's network namespace, are left alone.
    pub fn update(&self, id: &str, name: &str) -> Result<()> {
        let _lock = self.lock()?;
        let Some(mut meta) = self.read_meta(id)? else {
            tracing::debug!(id, "no hosts entry to update");
            return Ok(());
        };
        meta.name = name.to_owned();
        self.write_meta(&meta)?;
        self.regenerate_locked()
    }

    /// Removes the entry of `id`. Safe to call when it does not exist.
    pub fn dealloc(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        let entry_dir = self.dir.join(id);
        if !entry_dir.exists() {
            return Ok(());
        }
        utils::remove_dir_all_if_exists(&entry_dir).map_err(|err| HostsStoreError::Io {
            path: entry_dir,
            source: err,
        })?;
        tracing::debug!(id, "hosts entry deallocated");
        self.regenerate_locked()
    }

    pub fn load(&self, id: &str) -> Result<Option<Meta>> {
        self.read_meta(id)
    }

    pub fn list(&self) -> Result<Vec<Meta>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| HostsStoreError::Io {
            path: self.dir.clone(),
            source: err,
        })?;
        let mut metas = Vec::new();
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with('.') {
                continue;
            }
            if let Some(meta) = self.read_meta(&id)? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metas)
    }

    fn regenerate_locked(&self) -> Result<()> {
        let all = self.list()?;
        for meta in &all {
            let path = self.hosts_path(&meta.id);
            utils::atomic_write(&path, render(meta, &all).as_bytes())
                .map_err(|err| HostsStoreError::Io { path, source: err })?;
        }
        Ok(())
    }

    fn read_meta(&self, id: &str) -> Result<Option<Meta>> {
        let path = self.dir.join(id).join(Self::META_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HostsStoreError::Io { path, source: err }),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| HostsStoreError::Parse { path, source: err })
    }

    fn write_meta(&self, meta: &Meta) -> Result<()> {
        let path = self.dir.join(&meta.id).join(Self::META_FILE);
        let data = serde_json::to_vec(meta).map_err(|err| HostsStoreError::Parse {
            path: path.clone(),
            source: err,
        })?;
        utils::atomic_write(&path, &data).map_err(|err| HostsStoreError::Io { path, source: err })
    }

    fn lock(&self) -> Result<DirLock> {
        Ok(DirLock::acquire(self.dir.join(Self::LOCK_FILE))?)
    }
}
