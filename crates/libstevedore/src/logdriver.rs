//! Log driver configuration.
//!
//! The configuration is persisted in the container's state directory so
//! that the logging shim spawned by the runtime (and `logs`) can find it
//! without access to the original request.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils;

pub const LOG_CONFIG_FILE: &str = "log-config.json";
pub const INTERNAL_LOGGING_ENV: &str = "_STEVEDORE_INTERNAL_LOGGING";

#[derive(Debug, thiserror::Error)]
pub enum LogDriverError {
    #[error("unknown log driver {0:?}")]
    UnknownDriver(String),
    #[error("unknown log option {option:?} for log driver {driver}")]
    UnknownOption { driver: LogDriver, option: String },
    #[error("invalid value {value:?} for log option {option:?}")]
    InvalidOption { option: String, value: String },
    #[error("failed to determine the path of the current executable")]
    CurrentExe(#[source] std::io::Error),
    #[error("failed to write log configuration {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to (de)serialize log configuration {path:?}")]
    Serde {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, LogDriverError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    JsonFile,
    Journald,
    None,
}

impl fmt::Display for LogDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonFile => write!(f, "json-file"),
            Self::Journald => write!(f, "journald"),
            Self::None => write!(f, "none"),
        }
    }
}

impl LogDriver {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "json-file" => Ok(Self::JsonFile),
            "journald" => Ok(Self::Journald),
            "none" => Ok(Self::None),
            other => Err(LogDriverError::UnknownDriver(other.to_owned())),
        }
    }

    fn allowed_options(&self) -> &'static [&'static str] {
        match self {
            Self::JsonFile => &["max-size", "max-file"],
            Self::Journald => &["tag"],
            Self::None => &[],
        }
    }

    /// Checks `driver` and its options, returning the parsed driver.
    pub fn validate(driver: &str, opts: &HashMap<String, String>) -> Result<Self> {
        let parsed = Self::from_name(driver)?;
        for (option, value) in opts {
            if !parsed.allowed_options().contains(&option.as_str()) {
                return Err(LogDriverError::UnknownOption {
                    driver: parsed,
                    option: option.clone(),
                });
            }
            let invalid = || LogDriverError::InvalidOption {
                option: option.clone(),
                value: value.clone(),
            };
            match option.as_str() {
                "max-size" => {
                    utils::parse_size(value).map_err(|_| invalid())?;
                }
                "max-file" => {
                    let count: u32 = value.parse().map_err(|_| invalid())?;
                    if count == 0 {
                        return Err(invalid());
                    }
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    pub driver: LogDriver,
    #[serde(default)]
    pub opts: HashMap<String, String>,
    #[serde(default)]
    pub log_uri: Option<String>,
}

/// The URI the runtime uses to spawn the logging shim.
pub fn log_uri(exe: &Path, data_root: &Path) -> String {
    format!(
        "binary://{}?{}={}",
        exe.display(),
        INTERNAL_LOGGING_ENV,
        data_root.display()
    )
}

/// Validates the driver, writes `log-config.json` into `state_dir` and
/// returns the written configuration.
pub fn init(
    state_dir: &Path,
    data_root: &Path,
    driver: &str,
    opts: HashMap<String, String>,
) -> Result<LogConfig> {
    let driver = LogDriver::validate(driver, &opts)?;
    let log_uri = match driver {
        LogDriver::None => None,
        _ => {
            let exe = std::env::current_exe().map_err(LogDriverError::CurrentExe)?;
            Some(log_uri(&exe, data_root))
        }
    };
    let config = LogConfig {
        driver,
        opts,
        log_uri,
    };

    let path = state_dir.join(LOG_CONFIG_FILE);
    let bytes = serde_json::to_vec(&config).map_err(|err| LogDriverError::Serde {
        path: path.clone(),
        source: err,
    })?;
    utils::atomic_write(&path, &bytes).map_err(|err| {
        tracing::error!(?path, %err, "failed to write log configuration");
        LogDriverError::Io {
            path: path.clone(),
            source: err,
        }
    })?;
    tracing::debug!(?path, %driver, "log configuration written");
    Ok(config)
}

pub fn load(state_dir: &Path) -> Result<LogConfig> {
    let path = state_dir.join(LOG_CONFIG_FILE);
    let content = fs::read(&path).map_err(|err| LogDriverError::Io {
        path: path.clone(),
        source: err,
    })?;
    serde_json::from_slice(&content).map_err(|err| LogDriverError::Serde { path, source: err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_validate() {
        let rotation = opts(&[("max-size", "10m"), ("max-file", "3")]);
        assert_eq!(
            LogDriver::validate("json-file", &rotation).unwrap(),
            LogDriver::JsonFile
        );
        assert_eq!(
            LogDriver::validate("journald", &opts(&[("tag", "web")])).unwrap(),
            LogDriver::Journald
        );
        assert!(matches!(
            LogDriver::validate("syslog", &HashMap::new()),
            Err(LogDriverError::UnknownDriver(_))
        ));
        assert!(matches!(
            LogDriver::validate("none", &opts(&[("tag", "x")])),
            Err(LogDriverError::UnknownOption { .. })
        ));
        assert!(matches!(
            LogDriver::validate("json-file", &opts(&[("max-file", "0")])),
            Err(LogDriverError::InvalidOption { .. })
        ));
        assert!(LogDriver::validate("json-file", &opts(&[("max-size", "big")])).is_err());
    }

    #[test]
    fn test_init_and_load() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = init(
            tmp.path(),
            Path::new("/data"),
            "json-file",
            opts(&[("max-file", "2")]),
        )?;
        let uri = config.log_uri.clone().unwrap();
        assert!(uri.starts_with("binary://"));
        assert!(uri.ends_with("?_STEVEDORE_INTERNAL_LOGGING=/data"));
        assert_eq!(load(tmp.path())?, config);

        let config = init(tmp.path(), Path::new("/data"), "none", HashMap::new())?;
        assert_eq!(config.log_uri, None);
        Ok(())
    }

    #[test]
    fn test_init_missing_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone");
        assert!(matches!(
            init(&missing, tmp.path(), "json-file", HashMap::new()),
            Err(LogDriverError::Io { .. })
        ));
    }
}
