//! The creation pipeline.
//!
//! Stages run strictly in order. Every stage that allocates something
//! upgrades the [`RollbackPlan`], and the plan in effect when a stage fails
//! is executed exactly once before the error is returned, so a failed
//! create leaves behind precisely what existed before it started.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use oci_spec::runtime::Spec;

use super::request::{ContainerCreateRequest, ContainerName, ImageSource};
use super::Backend;
use crate::error::LibstevedoreError;
use crate::image::{self, reference, EnsuredImage, PullOptions};
use crate::ipc::{self, IpcMode};
use crate::labels::{self, InternalLabels};
use crate::logdriver;
use crate::mounts;
use crate::network::{ContainerOpt, NetworkOptionsManager};
use crate::ocispec::platform::{
    cgroups_path, with_annotations, with_cgroups_path, with_resources, with_terminal,
};
use crate::ocispec::process::{
    is_systemd, resolve_args, resolve_stop_signal, systemd_opts, with_args, with_cwd, with_env,
};
use crate::ocispec::security::{
    capability_names, security_opts, with_capabilities, with_readonly_rootfs, SecurityOptions,
};
use crate::ocispec::user::{parse_umask, resolve_identity, rootfs_for_lookup, with_identity};
use crate::ocispec::{self, opt, with_mounts, SpecError, SpecOpt};
use crate::runtime::{ContainerRecord, NewContainer};
use crate::utils;
use crate::volumestore::VolumeStoreGuard;
use crate::Stores;

const DEFAULT_PID_FILE: &str = "init.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    StateDir,
    PlatformOpts,
    EnsureImage,
    RootfsProcess,
    Mounts,
    LogConfig,
    Network,
    Generators,
    Name,
    CreateObject,
    SetupNetworking,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validate => "validating the request",
            Self::StateDir => "creating the state directory",
            Self::PlatformOpts => "generating platform options",
            Self::EnsureImage => "resolving the image",
            Self::RootfsProcess => "configuring the root filesystem and process",
            Self::Mounts => "generating mounts",
            Self::LogConfig => "configuring logging",
            Self::Network => "configuring networking",
            Self::Generators => "generating user and security options",
            Self::Name => "reserving the name",
            Self::CreateObject => "creating the container object",
            Self::SetupNetworking => "setting up networking",
        };
        write!(f, "{s}")
    }
}

/// The cleanup that ran after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    None,
    /// Depth A: the state directory only.
    StateDir,
    /// Depth B: the state directory and the hosts entry.
    OrphanedDirs,
    /// Depth C: everything, including the runtime object and the name.
    FullGc,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create container while {stage}")]
pub struct CreateError {
    /// Generated ID, `None` if the request was rejected before one was
    /// generated.
    pub id: Option<String>,
    pub stage: Stage,
    pub rollback: RollbackKind,
    #[source]
    pub source: LibstevedoreError,
}

/// What has to be undone if the pipeline stops now.
enum RollbackPlan {
    None,
    StateDir {
        state_dir: PathBuf,
    },
    OrphanedDirs {
        id: String,
        state_dir: PathBuf,
    },
    FullGc {
        id: String,
        state_dir: PathBuf,
        name: String,
        container: Option<ContainerRecord>,
    },
}

impl RollbackPlan {
    fn kind(&self) -> RollbackKind {
        match self {
            Self::None => RollbackKind::None,
            Self::StateDir { .. } => RollbackKind::StateDir,
            Self::OrphanedDirs { .. } => RollbackKind::OrphanedDirs,
            Self::FullGc { .. } => RollbackKind::FullGc,
        }
    }
}

struct Pipeline<'a> {
    backend: Backend<'a>,
    stores: &'a Stores,
    req: &'a ContainerCreateRequest,
    id: String,
    state_dir: PathBuf,
    stage: Stage,
    plan: RollbackPlan,
    opts: Vec<SpecOpt>,
    internal: InternalLabels,
    image: Option<EnsuredImage>,
    rootfs: Option<PathBuf>,
    name: String,
    volume_guard: Option<VolumeStoreGuard<'a>>,
    network: Option<Box<dyn NetworkOptionsManager + 'a>>,
    container_opts: Vec<ContainerOpt>,
}

/// Creates a container from `req`.
///
/// On failure, the returned error tells which stage failed and which
/// rollback depth ran; the rollback has completed by the time this returns.
#[tracing::instrument(level = "debug", skip_all)]
pub fn create_container(
    backend: &Backend<'_>,
    stores: &Stores,
    req: &ContainerCreateRequest,
) -> Result<ContainerRecord, CreateError> {
    req.validate().map_err(|err| CreateError {
        id: None,
        stage: Stage::Validate,
        rollback: RollbackKind::None,
        source: err,
    })?;

    let mut pipeline = Pipeline::new(*backend, stores, req);
    match pipeline.run() {
        Ok(container) => {
            tracing::debug!(id = %container.id, name = %pipeline.name, "container created");
            Ok(container)
        }
        Err(err) => {
            let stage = pipeline.stage;
            tracing::error!(id = %pipeline.id, %stage, %err, "failed to create container");
            // The lock must not outlive the call, whatever the plan.
            pipeline.volume_guard = None;
            let rollback = pipeline.rollback();
            Err(CreateError {
                id: Some(pipeline.id),
                stage,
                rollback,
                source: err,
            })
        }
    }
}

impl<'a> Pipeline<'a> {
    fn new(backend: Backend<'a>, stores: &'a Stores, req: &'a ContainerCreateRequest) -> Self {
        let id = utils::generate_id();
        let state_dir = backend.config.containers_dir().join(&id);
        Self {
            backend,
            stores,
            req,
            id,
            state_dir,
            stage: Stage::Validate,
            plan: RollbackPlan::None,
            opts: Vec::new(),
            internal: InternalLabels::default(),
            image: None,
            rootfs: None,
            name: String::new(),
            volume_guard: None,
            network: None,
            container_opts: Vec::new(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(id = %self.id, %stage, "create stage");
        self.stage = stage;
    }

    fn run(&mut self) -> Result<ContainerRecord, LibstevedoreError> {
        self.enter(Stage::StateDir);
        self.create_state_dir()?;
        self.enter(Stage::PlatformOpts);
        self.platform_opts()?;
        self.enter(Stage::EnsureImage);
        self.ensure_image()?;
        self.enter(Stage::RootfsProcess);
        self.rootfs_and_process()?;
        self.enter(Stage::Mounts);
        self.mounts()?;
        self.enter(Stage::LogConfig);
        self.log_config()?;
        self.enter(Stage::Network);
        self.network()?;
        self.enter(Stage::Generators);
        self.generators()?;
        self.enter(Stage::Name);
        self.reserve_name()?;
        self.enter(Stage::CreateObject);
        let container = self.create_object()?;
        self.enter(Stage::SetupNetworking);
        self.setup_networking()?;
        Ok(container)
    }

    fn create_state_dir(&mut self) -> Result<(), LibstevedoreError> {
        utils::create_private_dir(&self.state_dir).map_err(|err| {
            tracing::error!(state_dir = ?self.state_dir, %err, "failed to create state directory");
            err
        })?;
        self.plan = RollbackPlan::StateDir {
            state_dir: self.state_dir.clone(),
        };

        let config = self.backend.config;
        let req = self.req;
        self.internal.namespace = config.namespace.clone();
        self.internal.state_dir = self.state_dir.clone();
        self.internal.auto_remove = req.auto_remove;
        self.internal.restart_policy = req.restart.clone();
        self.internal.pid_file = Some(
            req.pid_file
                .clone()
                .unwrap_or_else(|| self.state_dir.join(DEFAULT_PID_FILE)),
        );
        Ok(())
    }

    fn platform_opts(&mut self) -> Result<(), LibstevedoreError> {
        let config = self.backend.config;
        let req = self.req;

        self.internal.platform = match &req.platform {
            Some(platform) => image::normalize_platform(platform)?,
            None => image::host_platform(),
        };
        self.opts.push(with_cgroups_path(cgroups_path(
            config.cgroup_manager,
            req.cgroup_parent.as_deref(),
            &config.namespace,
            &self.id,
        )));
        self.opts.push(with_terminal(req.tty));
        self.opts
            .push(with_resources(req.resources.clone(), config.cgroup_manager)?);
        self.opts.push(with_annotations(req.annotations.clone()));

        let ipc_mode: IpcMode = req.ipc.parse()?;
        let shm_size = req.shm_size.as_deref().map(utils::parse_size).transpose()?;
        self.opts.extend(ipc::spec_opts(
            &ipc_mode,
            &self.state_dir,
            shm_size,
            self.backend.runtime,
        )?);
        self.internal.ipc = ipc_mode.to_string();
        Ok(())
    }

    fn ensure_image(&mut self) -> Result<(), LibstevedoreError> {
        if let ImageSource::Image(reference) = &self.req.source {
            let pull = PullOptions {
                mode: self.req.pull,
                platform: self.req.platform.clone(),
            };
            let ensured = self.backend.images.ensure_image(reference, &pull)?;
            tracing::debug!(
                reference = %ensured.reference,
                digest = %ensured.digest,
                "image resolved"
            );
            self.internal.platform = ensured.platform.clone();
            self.image = Some(ensured);
        }
        Ok(())
    }

    fn rootfs_and_process(&mut self) -> Result<(), LibstevedoreError> {
        let req = self.req;

        if let ImageSource::Rootfs(path) = &req.source {
            let rootfs = fs::canonicalize(path).map_err(|err| SpecError::RootfsFile {
                path: path.clone(),
                source: err,
            })?;
            if !rootfs.is_dir() {
                return Err(SpecError::Invalid {
                    option: "rootfs",
                    value: path.to_string_lossy().into_owned(),
                }
                .into());
            }
            let root_path = rootfs.clone();
            self.opts.push(opt(move |spec| {
                let mut root = spec.root().clone().unwrap_or_default();
                root.set_path(root_path);
                spec.set_root(Some(root));
                Ok(())
            }));
            self.rootfs = Some(rootfs);
        }

        let image_config = self.image.as_ref().map(|i| &i.config);
        let args = resolve_args(req.entrypoint.as_deref(), &req.args, image_config)?;
        let systemd = is_systemd(req.systemd, &args);
        self.opts.push(with_args(args));
        self.opts.push(with_env(
            image_config.map(|c| c.env.clone()).unwrap_or_default(),
            req.env.clone(),
            req.tty,
        ));
        self.opts.push(with_cwd(
            req.workdir
                .clone()
                .or_else(|| image_config.and_then(|c| c.working_dir.clone()))
                .filter(|w| !w.is_empty()),
        )?);

        if systemd {
            let security = SecurityOptions::parse(&req.security_opt)?;
            self.opts.extend(systemd_opts(
                req.privileged,
                security.privileged_without_host_devices,
            )?);
        }
        self.internal.stop_signal = resolve_stop_signal(
            req.stop_signal.as_deref(),
            image_config.and_then(|c| c.stop_signal.as_deref()),
            systemd,
        );

        self.name = match (&req.name, &self.image) {
            (ContainerName::Explicit(name), _) => name.clone(),
            (ContainerName::Anonymous, _) => String::new(),
            (ContainerName::Derived, Some(image)) => {
                reference::default_container_name(&image.reference, &self.id)
            }
            (ContainerName::Derived, None) => String::new(),
        };
        Ok(())
    }

    fn mounts(&mut self) -> Result<(), LibstevedoreError> {
        self.plan = RollbackPlan::OrphanedDirs {
            id: self.id.clone(),
            state_dir: self.state_dir.clone(),
        };

        let stores: &'a Stores = self.stores;
        let guard = stores.volumes.lock()?;
        let image_volumes = self
            .image
            .as_ref()
            .map(|i| i.config.volumes.clone())
            .unwrap_or_default();
        let generated = mounts::generate_mounts(
            &guard,
            &self.req.volumes,
            &self.req.tmpfs,
            &image_volumes,
        );
        // Held until the container object exists, so that no other create
        // call sees half-made volumes.
        self.volume_guard = Some(guard);
        let generated = generated?;

        self.opts.push(with_mounts(generated.mounts));
        self.internal.mount_points = generated.mount_points;
        self.internal.anonymous_volumes = generated.anonymous_volumes;
        Ok(())
    }

    fn log_config(&mut self) -> Result<(), LibstevedoreError> {
        let driver = self
            .req
            .log_driver
            .as_deref()
            .unwrap_or(&self.backend.config.log_driver);
        let config = logdriver::init(
            &self.state_dir,
            &self.backend.config.data_root,
            driver,
            self.req.log_opts.clone(),
        )?;
        self.internal.log_uri = config.log_uri;
        Ok(())
    }

    fn network(&mut self) -> Result<(), LibstevedoreError> {
        let stores: &'a Stores = self.stores;
        let mut options = self.req.network.clone();
        options.name = self.name.clone();

        let ctx = self
            .backend
            .network_context(&stores.hosts, self.state_dir.clone());
        let manager = self
            .network
            .insert(self.backend.networks.manager(options, ctx)?);
        manager.verify_network_options()?;
        let (spec_opts, container_opts) = manager.container_networking_opts(&self.id)?;
        let facts = manager.internal_networking_option_labels()?;

        self.opts.extend(spec_opts);
        self.container_opts = container_opts;
        self.internal.hostname = facts.hostname;
        self.internal.ports = facts.ports;
        self.internal.ip_address = facts.ip_address;
        self.internal.ip6_address = facts.ip6_address;
        self.internal.mac_address = facts.mac_address;
        self.internal.networks = facts.networks;
        self.internal.extra_hosts = self.req.network.extra_hosts.clone();
        self.internal.domainname = self.req.network.domainname.clone().unwrap_or_default();
        Ok(())
    }

    fn generators(&mut self) -> Result<(), LibstevedoreError> {
        let req = self.req;
        let image_user = self.image.as_ref().and_then(|i| i.config.user.clone());
        let user = req.user.clone().or(image_user);
        let identity = resolve_identity(
            user.as_deref(),
            &req.group_add,
            rootfs_for_lookup(self.rootfs.as_ref()),
        )?;
        let umask = req.umask.as_deref().map(parse_umask).transpose()?;
        self.opts.push(with_identity(identity, umask));

        let caps = capability_names(req.privileged, &req.cap_add, &req.cap_drop)?;
        self.opts.push(with_capabilities(caps)?);
        let security = SecurityOptions::parse(&req.security_opt)?;
        self.opts.extend(security_opts(&security, req.privileged)?);
        self.opts.push(with_readonly_rootfs(req.read_only));
        Ok(())
    }

    fn reserve_name(&mut self) -> Result<(), LibstevedoreError> {
        if !self.name.is_empty() {
            self.stores.names.acquire(&self.name, &self.id)?;
        }
        self.internal.name = self.name.clone();
        Ok(())
    }

    fn create_object(&mut self) -> Result<ContainerRecord, LibstevedoreError> {
        self.plan = RollbackPlan::FullGc {
            id: self.id.clone(),
            state_dir: self.state_dir.clone(),
            name: self.name.clone(),
            container: None,
        };

        let empty = HashMap::new();
        let image_labels = self
            .image
            .as_ref()
            .map(|i| &i.config.labels)
            .unwrap_or(&empty);
        let internal = std::mem::take(&mut self.internal).into_labels()?;
        let labels = labels::merge(image_labels, &self.req.labels, internal);

        let spec: Spec = ocispec::generate(std::mem::take(&mut self.opts))?;
        let config = self.backend.config;
        let mut new = NewContainer {
            id: self.id.clone(),
            image: self.image.as_ref().map(|i| i.reference.clone()),
            snapshotter: self
                .image
                .as_ref()
                .map(|i| i.snapshotter.clone())
                .unwrap_or_else(|| config.snapshotter.clone()),
            snapshot_key: self.image.as_ref().map(|_| self.id.clone()),
            runtime: self
                .req
                .runtime
                .clone()
                .unwrap_or_else(|| config.default_runtime.clone()),
            spec,
            labels,
        };
        for container_opt in std::mem::take(&mut self.container_opts) {
            container_opt(&mut new)?;
        }

        let result = self.backend.runtime.create_container(new);
        self.volume_guard = None;
        let container = result?;
        if let RollbackPlan::FullGc { container: created, .. } = &mut self.plan {
            *created = Some(container.clone());
        }
        Ok(container)
    }

    fn setup_networking(&mut self) -> Result<(), LibstevedoreError> {
        if let Some(manager) = &self.network {
            manager.setup_networking(&self.id)?;
        }
        Ok(())
    }

    /// Executes the current plan. Failures are logged, never returned, so
    /// that they cannot hide the error that caused the rollback.
    fn rollback(&mut self) -> RollbackKind {
        let plan = std::mem::replace(&mut self.plan, RollbackPlan::None);
        let kind = plan.kind();
        tracing::debug!(id = %self.id, ?kind, "rolling back");

        match plan {
            RollbackPlan::None => {}
            RollbackPlan::StateDir { state_dir } => remove_state_dir(&state_dir),
            RollbackPlan::OrphanedDirs { id, state_dir } => {
                remove_state_dir(&state_dir);
                self.dealloc_hosts(&id);
            }
            RollbackPlan::FullGc {
                id,
                state_dir,
                name,
                container,
            } => {
                match container {
                    None => self.dealloc_hosts(&id),
                    Some(container) => {
                        if let Some(manager) = &self.network {
                            if let Err(err) = manager.cleanup_networking(&container) {
                                tracing::warn!(%id, %err, "failed to clean up networking");
                            }
                        }
                        if let Err(err) = self.backend.runtime.delete_container(&id) {
                            tracing::warn!(%id, %err, "failed to delete container object");
                        }
                    }
                }
                if let Err(err) = ipc::cleanup(&state_dir) {
                    tracing::warn!(%id, %err, "failed to clean up IPC resources");
                }
                remove_state_dir(&state_dir);
                if !name.is_empty() {
                    // Missing entries are fine: an auto-removed container
                    // may already have released it.
                    if let Err(err) = self.stores.names.release(&name, &id) {
                        tracing::warn!(%id, %name, %err, "failed to release name");
                    }
                }
            }
        }
        kind
    }

    fn dealloc_hosts(&self, id: &str) {
        if let Err(err) = self.stores.hosts.dealloc(id) {
            tracing::warn!(id, %err, "failed to deallocate hosts entry");
        }
    }
}

fn remove_state_dir(state_dir: &std::path::Path) {
    if let Err(err) = utils::remove_dir_all_if_exists(state_dir) {
        tracing::warn!(?state_dir, %err, "failed to remove state directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageConfig;
    use crate::namestore::NameStoreError;
    use crate::runtime::Runtime;
    use crate::test_utils::{FakeImageService, FakeNetworkProvider, FakeRuntime, TestEnv};
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn images() -> FakeImageService {
        FakeImageService::default()
            .with_image(
                "alpine",
                ImageConfig {
                    cmd: vec!["/bin/sh".to_owned()],
                    env: vec!["FROM_IMAGE=1".to_owned()],
                    labels: [
                        ("maintainer".to_owned(), "image".to_owned()),
                        ("tier".to_owned(), "image".to_owned()),
                    ]
                    .into_iter()
                    .collect(),
                    volumes: vec!["/cache".to_owned()],
                    ..Default::default()
                },
            )
            .with_image("scratch-tool", ImageConfig::default())
    }

    fn request(name: &str) -> ContainerCreateRequest {
        let mut req = ContainerCreateRequest::new(ImageSource::Image("alpine".to_owned()));
        req.name = ContainerName::Explicit(name.to_owned());
        req
    }

    fn state_dirs(env: &TestEnv) -> Result<usize> {
        let dir = env.config.containers_dir();
        if !dir.exists() {
            return Ok(0);
        }
        Ok(fs::read_dir(dir)?.count())
    }

    #[test]
    fn test_create_end_to_end() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let container = create_container(&backend, &env.stores, &request("web"))?;
        assert!(env.state_dir(&container.id).is_dir());
        assert_eq!(env.stores.names.lookup("web")?, Some(container.id.clone()));
        assert!(env.stores.hosts.load(&container.id)?.is_some());
        let state_dir = env.state_dir(&container.id);
        assert!(state_dir.join("log-config.json").exists());
        assert_eq!(
            networks.events(),
            vec![
                "verify-start".to_owned(),
                "verify-end".to_owned(),
                format!("opts:{}", container.id),
                format!("setup:{}", container.id),
            ]
        );

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        assert_eq!(err.stage, Stage::Name);
        assert_eq!(err.rollback, RollbackKind::OrphanedDirs);
        assert!(matches!(
            err.source,
            LibstevedoreError::NameStore(NameStoreError::Conflict { .. })
        ));
        let failed_id = err.id.unwrap();
        assert!(!env.state_dir(&failed_id).exists());
        assert!(env.stores.hosts.load(&failed_id)?.is_none());
        assert_eq!(state_dirs(&env)?, 1);
        assert_eq!(env.stores.names.lookup("web")?, Some(container.id));
        Ok(())
    }

    #[test]
    fn test_create_labels_and_spec() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = ContainerCreateRequest::new(ImageSource::Image("alpine".to_owned()));
        req.labels.insert("tier".to_owned(), "user".to_owned());
        req.env = vec!["FOO=bar".to_owned()];
        req.auto_remove = true;
        let container = create_container(&backend, &env.stores, &req)?;

        assert_eq!(container.labels["maintainer"], "image");
        assert_eq!(container.labels["tier"], "user");
        let internal = InternalLabels::from_labels(&container.labels)?;
        assert_eq!(internal.namespace, "default");
        assert_eq!(internal.state_dir, env.state_dir(&container.id));
        assert!(internal.auto_remove);
        assert_eq!(internal.stop_signal, "SIGTERM");
        assert_eq!(internal.networks, vec!["none".to_owned()]);
        assert_eq!(internal.hostname, utils::short_id(&container.id));
        assert_eq!(internal.anonymous_volumes.len(), 1);
        assert!(internal.name.starts_with("alpine-"));
        assert_eq!(internal.name, format!("alpine-{}", &container.id[..5]));
        assert_eq!(
            internal.pid_file,
            Some(env.state_dir(&container.id).join("init.pid"))
        );
        assert!(internal.log_uri.is_some());

        let process = container.spec.process().clone().unwrap();
        assert_eq!(process.args().clone().unwrap(), vec!["/bin/sh".to_owned()]);
        let envs = process.env().clone().unwrap();
        assert!(envs.contains(&"FROM_IMAGE=1".to_owned()));
        assert!(envs.contains(&"FOO=bar".to_owned()));
        assert_eq!(
            container.snapshot_key.as_deref(),
            Some(container.id.as_str())
        );
        assert_eq!(
            container.image.as_deref(),
            Some("docker.io/library/alpine:latest")
        );
        Ok(())
    }

    #[test]
    fn test_create_from_rootfs_is_anonymous() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);
        let rootfs = env.tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc"))?;

        let mut req = ContainerCreateRequest::new(ImageSource::Rootfs(rootfs.clone()));
        req.args = vec!["/init".to_owned()];
        let container = create_container(&backend, &env.stores, &req)?;
        assert_eq!(container.name(), "");
        assert_eq!(container.image, None);
        assert_eq!(
            container.spec.root().as_ref().unwrap().path(),
            &fs::canonicalize(&rootfs)?
        );
        Ok(())
    }

    #[test]
    fn test_validation_has_no_side_effects() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = request("web");
        req.labels.insert(labels::NAME.to_owned(), "x".to_owned());
        let err = create_container(&backend, &env.stores, &req).unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert_eq!(err.id, None);
        assert_eq!(err.rollback, RollbackKind::None);
        assert_eq!(state_dirs(&env)?, 0);
        Ok(())
    }

    #[test]
    fn test_rollback_state_dir_failure() -> Result<()> {
        let env = TestEnv::new()?;
        fs::write(env.config.data_root.join("containers"), b"")?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        assert_eq!(err.stage, Stage::StateDir);
        assert_eq!(err.rollback, RollbackKind::None);
        assert!(matches!(err.source, LibstevedoreError::StateDir(_)));
        assert!(!env.state_dir(err.id.as_deref().unwrap()).exists());
        // Nothing downstream was touched.
        assert_eq!(env.stores.names.lookup("web")?, None);
        assert!(env.stores.hosts.list()?.is_empty());
        assert!(networks.events().is_empty());
        Ok(())
    }

    #[test]
    fn test_rollback_depth_a() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = ContainerCreateRequest::new(ImageSource::Image("scratch-tool".to_owned()));
        req.name = ContainerName::Explicit("tool".to_owned());
        let err = create_container(&backend, &env.stores, &req).unwrap_err();
        assert_eq!(err.stage, Stage::RootfsProcess);
        assert_eq!(err.rollback, RollbackKind::StateDir);
        assert!(matches!(err.source, LibstevedoreError::Spec(SpecError::NoCommand)));
        assert_eq!(state_dirs(&env)?, 0);

        let mut req = request("web");
        req.source = ImageSource::Image("missing".to_owned());
        let err = create_container(&backend, &env.stores, &req).unwrap_err();
        assert_eq!(err.stage, Stage::EnsureImage);
        assert_eq!(err.rollback, RollbackKind::StateDir);
        assert_eq!(state_dirs(&env)?, 0);
        Ok(())
    }

    #[test]
    fn test_rollback_mounts_failure() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = request("web");
        let missing = env.tmp.path().join("missing");
        req.volumes = vec![format!("{}:/data", missing.display())];
        let err = create_container(&backend, &env.stores, &req).unwrap_err();
        assert_eq!(err.stage, Stage::Mounts);
        assert_eq!(err.rollback, RollbackKind::OrphanedDirs);
        assert!(!env.state_dir(err.id.as_deref().unwrap()).exists());
        assert_eq!(env.stores.names.lookup("web")?, None);
        // The lock was released.
        drop(env.stores.volumes.lock()?);
        Ok(())
    }

    #[test]
    fn test_rollback_network_verify_failure() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider {
            fail_verify: true,
            ..Default::default()
        };
        let backend = env.backend(&runtime, &images, &networks);

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        assert_eq!(err.stage, Stage::Network);
        assert_eq!(err.rollback, RollbackKind::OrphanedDirs);
        assert!(!env.state_dir(err.id.as_deref().unwrap()).exists());
        assert!(env.stores.hosts.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_rollback_create_object_failure() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default().fail_create();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        assert_eq!(err.stage, Stage::CreateObject);
        assert_eq!(err.rollback, RollbackKind::FullGc);
        let id = err.id.unwrap();
        assert!(!env.state_dir(&id).exists());
        assert_eq!(env.stores.names.lookup("web")?, None);
        assert!(env.stores.hosts.load(&id)?.is_none());
        // The object never existed, so networking had nothing to tear down.
        assert!(!networks.events().iter().any(|e| e.starts_with("cleanup")));
        Ok(())
    }

    #[test]
    fn test_rollback_setup_networking_failure() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider {
            fail_setup: true,
            ..Default::default()
        };
        let backend = env.backend(&runtime, &images, &networks);

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        assert_eq!(err.stage, Stage::SetupNetworking);
        assert_eq!(err.rollback, RollbackKind::FullGc);
        let id = err.id.unwrap();
        assert!(!env.state_dir(&id).exists());
        assert!(runtime.ids().is_empty());
        assert_eq!(env.stores.names.lookup("web")?, None);
        assert!(env.stores.hosts.load(&id)?.is_none());
        assert!(networks.events().contains(&format!("cleanup:{id}")));
        Ok(())
    }

    #[test]
    fn test_rollback_tolerates_released_name() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default().fail_create();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let err = create_container(&backend, &env.stores, &request("web")).unwrap_err();
        let id = err.id.unwrap();
        // A second release of the same reservation is not an error.
        env.stores.names.release("web", &id)?;
        Ok(())
    }

    #[test]
    fn test_volume_lock_serializes_creates() -> Result<()> {
        let env = TestEnv::new()?;
        let events = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|tag| {
                    let env = &env;
                    let events = events.clone();
                    s.spawn(move || {
                        let runtime = FakeRuntime::default();
                        let images = images();
                        let networks = FakeNetworkProvider {
                            verify_delay: Some(Duration::from_millis(200)),
                            events,
                            tag: tag.to_owned(),
                            ..Default::default()
                        };
                        let stores = env.stores.clone();
                        let backend = env.backend(&runtime, &images, &networks);
                        let mut req =
                            ContainerCreateRequest::new(ImageSource::Image("alpine".to_owned()));
                        req.volumes = vec!["/data".to_owned()];
                        create_container(&backend, &stores, &req)
                            .map(|c| c.id)
                            .map_err(|err| err.to_string())
                    })
                })
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_ok());
            }
        });

        let verify: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.contains("verify"))
            .cloned()
            .collect();
        assert_eq!(verify.len(), 4);
        for pair in verify.chunks(2) {
            let (tag, event) = pair[0].split_once(':').unwrap();
            assert_eq!(event, "verify-start");
            assert_eq!(pair[1], format!("{tag}:verify-end"));
        }
        // Two image volumes and two /data volumes, none shared.
        assert_eq!(env.stores.volumes.list()?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_systemd_privileged_conflict() -> Result<()> {
        let env = TestEnv::new()?;
        let runtime = FakeRuntime::default();
        let images = images();
        let networks = FakeNetworkProvider::default();
        let backend = env.backend(&runtime, &images, &networks);

        let mut req = request("sys");
        req.args = vec!["/sbin/init".to_owned()];
        req.systemd = crate::ocispec::process::SystemdMode::True;
        req.privileged = true;
        let err = create_container(&backend, &env.stores, &req).unwrap_err();
        assert!(matches!(
            err.source,
            LibstevedoreError::Spec(SpecError::SystemdPrivileged)
        ));
        assert_eq!(err.rollback, RollbackKind::StateDir);

        req.security_opt = vec!["privileged-without-host-devices".to_owned()];
        let container = create_container(&backend, &env.stores, &req)?;
        let internal = InternalLabels::from_labels(&container.labels)?;
        assert_eq!(internal.stop_signal, "SIGRTMIN+3");
        assert!(runtime.container(&container.id).is_ok());
        Ok(())
    }
}
