//! Client wide configuration.
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::utils;

pub const NAMESPACE_ENV: &str = "STEVEDORE_NAMESPACE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    #[default]
    Cgroupfs,
    Systemd,
    None,
}

impl FromStr for CgroupManager {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cgroupfs" => Ok(Self::Cgroupfs),
            "systemd" => Ok(Self::Systemd),
            "none" => Ok(Self::None),
            _ => Err(ValidationError::Option {
                option: "cgroup-manager",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub data_root: PathBuf,
    pub namespace: String,
    pub snapshotter: String,
    pub cgroup_manager: CgroupManager,
    pub default_network: String,
    pub default_runtime: String,
    pub log_driver: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/stevedore"),
            namespace: "default".to_owned(),
            snapshotter: "overlayfs".to_owned(),
            cgroup_manager: CgroupManager::Cgroupfs,
            default_network: "none".to_owned(),
            default_runtime: "io.containerd.runc.v2".to_owned(),
            log_driver: "json-file".to_owned(),
        }
    }
}

impl GlobalConfig {
    pub const DEFAULT_PATH: &'static str = "/etc/stevedore/stevedore.json";

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|err| {
            tracing::error!(?path, %err, "failed to read config file");
            ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            }
        })?;
        serde_json::from_slice(&data).map_err(|err| {
            tracing::error!(?path, %err, "failed to parse config file");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    /// Loads `path` if given, otherwise the default location when it
    /// exists, otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(Self::DEFAULT_PATH).exists() => {
                Self::load(Path::new(Self::DEFAULT_PATH))
            }
            None => Ok(Self::default()),
        }
    }

    /// Applies overrides from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(namespace) = std::env::var(NAMESPACE_ENV) {
            if !namespace.is_empty() {
                self.namespace = namespace;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        utils::validate_namespace(&self.namespace)?;
        Ok(())
    }

    /// Directory holding the state directories of the namespace's
    /// containers.
    pub fn containers_dir(&self) -> PathBuf {
        self.data_root.join("containers").join(&self.namespace)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_root.join("images")
    }
}
