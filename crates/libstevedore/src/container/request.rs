use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::image::PullMode;
use crate::ipc::IpcMode;
use crate::labels;
use crate::logdriver::LogDriver;
use crate::network::{NetworkMode, NetworkOptions};
use crate::ocispec::process::{validate_signal, SystemdMode};
use crate::utils;

/// Where the root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image reference resolved through the image collaborator.
    Image(String),
    /// Explicit, already unpacked root filesystem.
    Rootfs(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContainerName {
    /// `<image basename>-<first ID characters>` for image backed
    /// containers, anonymous for an explicit rootfs.
    #[default]
    Derived,
    Anonymous,
    Explicit(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    /// Memory limit in the `512m` form.
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub pids_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure(Option<u32>),
}

impl FromStr for RestartPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::RestartPolicy(s.to_owned());
        match s.split_once(':') {
            None => match s {
                "" | "no" => Ok(Self::No),
                "always" => Ok(Self::Always),
                "unless-stopped" => Ok(Self::UnlessStopped),
                "on-failure" => Ok(Self::OnFailure(None)),
                _ => Err(invalid()),
            },
            Some(("on-failure", count)) => {
                let count = count.parse().map_err(|_| invalid())?;
                Ok(Self::OnFailure(Some(count)))
            }
            Some(_) => Err(invalid()),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
            Self::OnFailure(None) => write!(f, "on-failure"),
            Self::OnFailure(Some(count)) => write!(f, "on-failure:{count}"),
        }
    }
}

/// Immutable description of one create call. Built by the command line
/// layer and only read by the pipeline.
#[derive(Debug, Clone)]
pub struct ContainerCreateRequest {
    pub source: ImageSource,
    pub args: Vec<String>,
    /// `Some(vec![])` resets the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub group_add: Vec<String>,
    pub umask: Option<String>,
    pub tty: bool,
    pub resources: Resources,
    pub cgroup_parent: Option<String>,
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub network: NetworkOptions,
    pub name: ContainerName,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub restart: String,
    pub log_driver: Option<String>,
    pub log_opts: HashMap<String, String>,
    pub auto_remove: bool,
    pub platform: Option<String>,
    pub pull: PullMode,
    pub systemd: SystemdMode,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub read_only: bool,
    pub runtime: Option<String>,
    pub stop_signal: Option<String>,
    pub ipc: String,
    pub pid_file: Option<PathBuf>,
    pub shm_size: Option<String>,
}

impl ContainerCreateRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            args: Vec::new(),
            entrypoint: None,
            env: Vec::new(),
            workdir: None,
            user: None,
            group_add: Vec::new(),
            umask: None,
            tty: false,
            resources: Resources::default(),
            cgroup_parent: None,
            volumes: Vec::new(),
            tmpfs: Vec::new(),
            network: NetworkOptions::default(),
            name: ContainerName::Derived,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            restart: "no".to_owned(),
            log_driver: None,
            log_opts: HashMap::new(),
            auto_remove: false,
            platform: None,
            pull: PullMode::Missing,
            systemd: SystemdMode::False,
            privileged: false,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            security_opt: Vec::new(),
            read_only: false,
            runtime: None,
            stop_signal: None,
            ipc: String::new(),
            pid_file: None,
            shm_size: None,
        }
    }

    /// Rejects malformed requests before anything is allocated.
    pub fn validate(&self) -> Result<(), crate::error::LibstevedoreError> {
        labels::validate_user_labels(&self.labels)?;
        if let ContainerName::Explicit(name) = &self.name {
            utils::validate_name(name)?;
        }

        let restart: RestartPolicy = self.restart.parse()?;
        if self.auto_remove && restart != RestartPolicy::No {
            return Err(ValidationError::AutoRemoveWithRestart(self.restart.clone()).into());
        }
        if let Some(signal) = &self.stop_signal {
            validate_signal(signal)?;
        }
        if let Some(size) = &self.shm_size {
            utils::parse_size(size)?;
        }
        if let Some(memory) = &self.resources.memory {
            utils::parse_size(memory)?;
        }
        if let Some(cpus) = self.resources.cpus {
            if !(cpus > 0.0) {
                return Err(ValidationError::Option {
                    option: "cpus",
                    value: cpus.to_string(),
                }
                .into());
            }
        }
        if let Some(umask) = &self.umask {
            u32::from_str_radix(umask, 8).map_err(|_| ValidationError::Umask(umask.clone()))?;
        }
        self.ipc.parse::<IpcMode>()?;
        let log_driver = self.log_driver.as_deref().unwrap_or("json-file");
        LogDriver::validate(log_driver, &self.log_opts)?;
        NetworkMode::parse_all(&self.network.networks)?;

        Ok(())
    }

    pub fn image_reference(&self) -> Option<&str> {
        match &self.source {
            ImageSource::Image(reference) => Some(reference),
            ImageSource::Rootfs(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ContainerCreateRequest {
        ContainerCreateRequest::new(ImageSource::Image("alpine".to_owned()))
    }

    #[test]
    fn test_restart_policy() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure(Some(3))
        );
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap().to_string(),
            "on-failure:3"
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("always:2".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_validate_default_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let cases: Vec<Box<dyn Fn(&mut ContainerCreateRequest)>> = vec![
            Box::new(|r| r.name = ContainerName::Explicit("bad/name".to_owned())),
            Box::new(|r| {
                r.labels.insert(labels::NAME.to_owned(), "x".to_owned());
            }),
            Box::new(|r| {
                r.auto_remove = true;
                r.restart = "always".to_owned();
            }),
            Box::new(|r| r.stop_signal = Some("SIGNOPE".to_owned())),
            Box::new(|r| r.shm_size = Some("lots".to_owned())),
            Box::new(|r| r.resources.cpus = Some(0.0)),
            Box::new(|r| r.umask = Some("999".to_owned())),
            Box::new(|r| r.ipc = "sometimes".to_owned()),
            Box::new(|r| r.log_driver = Some("syslog".to_owned())),
            Box::new(|r| r.network.networks = vec!["none".to_owned(), "host".to_owned()]),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut req = request();
            mutate(&mut req);
            assert!(req.validate().is_err(), "case {i} should be rejected");
        }
    }
}
