//! The typed sidecar record stored on every container object.
//!
//! The runtime only persists a flat string map of labels, so
//! [`InternalLabels`] is converted to that map when the container object is
//! created and parsed back by every command that needs the side state.
//! Composite values are carried as JSON strings.
use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::mounts::MountPoint;
use crate::network::ports::PortMapping;

/// Every label owned by this crate starts with this prefix.
pub const PREFIX: &str = "stevedore/";

pub const NAMESPACE: &str = "stevedore/namespace";
pub const PLATFORM: &str = "stevedore/platform";
pub const STATE_DIR: &str = "stevedore/state-dir";
pub const EXTRA_HOSTS: &str = "stevedore/extra-hosts";
pub const NETWORKS: &str = "stevedore/networks";
pub const PORTS: &str = "stevedore/ports";
pub const IP_ADDRESS: &str = "stevedore/ip";
pub const IP6_ADDRESS: &str = "stevedore/ip6";
pub const MAC_ADDRESS: &str = "stevedore/mac-address";
pub const HOSTNAME: &str = "stevedore/hostname";
pub const DOMAINNAME: &str = "stevedore/domainname";
pub const LOG_URI: &str = "stevedore/log-uri";
pub const ANONYMOUS_VOLUMES: &str = "stevedore/anonymous-volumes";
pub const MOUNTS: &str = "stevedore/mounts";
pub const PID_FILE: &str = "stevedore/pid-file";
pub const NAME: &str = "stevedore/name";
pub const AUTO_REMOVE: &str = "stevedore/auto-remove";
pub const STOP_SIGNAL: &str = "stevedore/stop-signal";
pub const IPC: &str = "stevedore/ipc";
pub const RESTART_POLICY: &str = "stevedore/restart-policy";

#[derive(Debug, thiserror::Error)]
pub enum LabelsError {
    #[error("failed to encode label {key}")]
    Encode {
        key: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to decode label {key}")]
    Decode {
        key: &'static str,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, LabelsError>;

/// Side effects of one create call, accumulated stage by stage.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InternalLabels {
    pub namespace: String,
    pub platform: String,
    pub state_dir: PathBuf,
    pub extra_hosts: Vec<String>,
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub ip_address: Option<String>,
    pub ip6_address: Option<String>,
    pub mac_address: Option<String>,
    pub hostname: String,
    pub domainname: String,
    pub log_uri: Option<String>,
    pub anonymous_volumes: Vec<String>,
    pub mount_points: Vec<MountPoint>,
    pub pid_file: Option<PathBuf>,
    pub name: String,
    pub auto_remove: bool,
    pub stop_signal: String,
    pub ipc: String,
    pub restart_policy: String,
}

impl InternalLabels {
    /// Flattens the record into the label map handed to the runtime.
    /// Empty fields are left out.
    pub fn into_labels(self) -> Result<HashMap<String, String>> {
        let mut labels = HashMap::new();
        let mut put = |key: &str, value: String| {
            if !value.is_empty() {
                labels.insert(key.to_owned(), value);
            }
        };

        put(NAMESPACE, self.namespace);
        put(PLATFORM, self.platform);
        put(STATE_DIR, self.state_dir.to_string_lossy().into_owned());
        put(HOSTNAME, self.hostname);
        put(DOMAINNAME, self.domainname);
        put(NAME, self.name);
        put(STOP_SIGNAL, self.stop_signal);
        put(IPC, self.ipc);
        put(RESTART_POLICY, self.restart_policy);
        put(IP_ADDRESS, self.ip_address.unwrap_or_default());
        put(IP6_ADDRESS, self.ip6_address.unwrap_or_default());
        put(MAC_ADDRESS, self.mac_address.unwrap_or_default());
        put(LOG_URI, self.log_uri.unwrap_or_default());
        put(
            PID_FILE,
            self.pid_file
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        if self.auto_remove {
            put(AUTO_REMOVE, "true".to_owned());
        }

        put(EXTRA_HOSTS, encode_list(EXTRA_HOSTS, &self.extra_hosts)?);
        put(NETWORKS, encode_list(NETWORKS, &self.networks)?);
        put(PORTS, encode_list(PORTS, &self.ports)?);
        put(
            ANONYMOUS_VOLUMES,
            encode_list(ANONYMOUS_VOLUMES, &self.anonymous_volumes)?,
        );
        put(MOUNTS, encode_list(MOUNTS, &self.mount_points)?);

        Ok(labels)
    }

    /// Rebuilds the record from a container's labels. Unknown labels are
    /// ignored and missing ones take their default.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<Self> {
        let text = |key: &str| labels.get(key).cloned().unwrap_or_default();
        let optional = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();

        Ok(Self {
            namespace: text(NAMESPACE),
            platform: text(PLATFORM),
            state_dir: PathBuf::from(text(STATE_DIR)),
            extra_hosts: decode_list(labels, EXTRA_HOSTS)?,
            networks: decode_list(labels, NETWORKS)?,
            ports: decode_list(labels, PORTS)?,
            ip_address: optional(IP_ADDRESS),
            ip6_address: optional(IP6_ADDRESS),
            mac_address: optional(MAC_ADDRESS),
            hostname: text(HOSTNAME),
            domainname: text(DOMAINNAME),
            log_uri: optional(LOG_URI),
            anonymous_volumes: decode_list(labels, ANONYMOUS_VOLUMES)?,
            mount_points: decode_list(labels, MOUNTS)?,
            pid_file: optional(PID_FILE).map(PathBuf::from),
            name: text(NAME),
            auto_remove: labels.get(AUTO_REMOVE).is_some_and(|v| v == "true"),
            stop_signal: text(STOP_SIGNAL),
            ipc: text(IPC),
            restart_policy: text(RESTART_POLICY),
        })
    }
}

fn encode_list<T: Serialize>(key: &'static str, values: &[T]) -> Result<String> {
    if values.is_empty() {
        return Ok(String::new());
    }
    serde_json::to_string(values).map_err(|err| LabelsError::Encode { key, source: err })
}

fn decode_list<T: DeserializeOwned>(
    labels: &HashMap<String, String>,
    key: &'static str,
) -> Result<Vec<T>> {
    match labels.get(key) {
        None => Ok(Vec::new()),
        Some(v) if v.is_empty() => Ok(Vec::new()),
        Some(v) => serde_json::from_str(v).map_err(|err| LabelsError::Decode { key, source: err }),
    }
}

/// Rejects user supplied labels that would collide with internal ones.
pub fn validate_user_labels(
    labels: &HashMap<String, String>,
) -> std::result::Result<(), ValidationError> {
    match labels.keys().find(|k| k.starts_with(PREFIX)) {
        Some(key) => Err(ValidationError::ReservedLabel(key.clone())),
        None => Ok(()),
    }
}

/// Layers image labels, user labels and internal labels, later layers
/// overriding earlier ones.
pub fn merge(
    image: &HashMap<String, String>,
    user: &HashMap<String, String>,
    internal: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = image.clone();
    merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(internal);
    merged
}
