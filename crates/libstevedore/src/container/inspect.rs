use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::runtime::Spec;
use serde::Serialize;

use crate::error::LibstevedoreError;
use crate::labels::{self, InternalLabels};
use crate::mounts::MountPoint;
use crate::runtime::{ContainerRecord, Runtime, TaskStatus};

/// Docker compatible view of a container, as printed by `inspect`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    /// The name with a leading `/`, empty for anonymous containers.
    pub name: String,
    pub created: DateTime<Utc>,
    pub image: Option<String>,
    pub platform: String,
    pub state: ContainerState,
    pub host_config: HostConfig,
    pub config: ContainerConfig,
    pub mounts: Vec<MountPoint>,
    pub network_settings: NetworkSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Spec>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub pid: i32,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub restart_policy: String,
    pub auto_remove: bool,
    pub runtime: String,
    pub log_uri: Option<String>,
    pub extra_hosts: Vec<String>,
    pub state_dir: PathBuf,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub hostname: String,
    pub domainname: String,
    pub stop_signal: String,
    /// User labels only; labels owned by stevedore are left out.
    pub labels: HashMap<String, String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    pub networks: Vec<String>,
    pub ports: Vec<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
    #[serde(rename = "GlobalIPv6Address")]
    pub ip6_address: Option<String>,
    pub mac_address: Option<String>,
}

/// Builds the inspect view of `container`. The OCI spec is only included
/// when `with_spec` is set.
pub fn inspect_container(
    runtime: &dyn Runtime,
    container: &ContainerRecord,
    with_spec: bool,
) -> Result<ContainerInspect, LibstevedoreError> {
    let internal = InternalLabels::from_labels(&container.labels)?;
    let task = runtime.task(&container.id)?;
    let status = task.as_ref().map_or(TaskStatus::Created, |t| t.status);

    let user_labels = container
        .labels
        .iter()
        .filter(|(k, _)| !k.starts_with(labels::PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(ContainerInspect {
        id: container.id.clone(),
        name: if internal.name.is_empty() {
            String::new()
        } else {
            format!("/{}", internal.name)
        },
        created: container.created_at,
        image: container.image.clone(),
        platform: internal.platform,
        state: ContainerState {
            status: status.to_string(),
            running: status.is_running(),
            pid: task.map(|t| t.pid).unwrap_or_default(),
        },
        host_config: HostConfig {
            restart_policy: internal.restart_policy,
            auto_remove: internal.auto_remove,
            runtime: container.runtime.clone(),
            log_uri: internal.log_uri,
            extra_hosts: internal.extra_hosts,
            state_dir: internal.state_dir,
        },
        config: ContainerConfig {
            hostname: internal.hostname,
            domainname: internal.domainname,
            stop_signal: internal.stop_signal,
            labels: user_labels,
        },
        mounts: internal.mount_points,
        network_settings: NetworkSettings {
            networks: internal.networks,
            ports: internal.ports.iter().map(ToString::to_string).collect(),
            ip_address: internal.ip_address,
            ip6_address: internal.ip6_address,
            mac_address: internal.mac_address,
        },
        spec: with_spec.then(|| container.spec.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{create_container, ContainerCreateRequest, ContainerName, ImageSource};
    use crate::image::ImageConfig;
    use crate::runtime::TaskInfo;
    use crate::test_utils::{FakeImageService, FakeNetworkProvider, FakeRuntime, TestEnv};
    use anyhow::Result;

    #[test]
    fn test_inspect() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = FakeImageService::default().with_image(
            "alpine",
            ImageConfig {
                cmd: vec!["/bin/sh".to_owned()],
                ..Default::default()
            },
        );
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = ContainerCreateRequest::new(ImageSource::Image("alpine".to_owned()));
        req.name = ContainerName::Explicit("web".to_owned());
        req.labels.insert("app".to_owned(), "shop".to_owned());
        req.volumes = vec!["/data".to_owned()];
        let container = create_container(&backend, &env.stores, &req)?;

        let view = inspect_container(&runtime, &container, false)?;
        assert_eq!(view.name, "/web");
        assert_eq!(view.state.status, "created");
        assert!(!view.state.running);
        assert_eq!(
            view.config.labels,
            HashMap::from([("app".to_owned(), "shop".to_owned())])
        );
        assert_eq!(view.mounts.len(), 1);
        assert_eq!(view.network_settings.networks, vec!["none".to_owned()]);
        assert!(view.spec.is_none());

        runtime.set_task(
            &container.id,
            TaskInfo {
                pid: 7,
                status: TaskStatus::Running,
            },
        );
        let json = serde_json::to_value(inspect_container(&runtime, &container, true)?)?;
        assert_eq!(json["State"]["Running"], true);
        assert_eq!(json["State"]["Pid"], 7);
        assert_eq!(json["HostConfig"]["RestartPolicy"], "no");
        assert!(json["Spec"].is_object());
        Ok(())
    }
}
