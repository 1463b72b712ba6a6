//! In-memory collaborators with failure injection, for tests of this crate
//! and of the command line.
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use oci_spec::runtime::Spec;

use crate::config::{CgroupManager, GlobalConfig};
use crate::container::Backend;
use crate::error::LibstevedoreError;
use crate::image::reference::Reference;
use crate::image::{EnsuredImage, ImageConfig, ImageError, ImageService, PullOptions};
use crate::labels;
use crate::network::{
    ContainerOpt, DefaultNetworkProvider, NetworkContext, NetworkError, NetworkOptions,
    NetworkOptionsManager, NetworkProvider, NetworkingLabels,
};
use crate::ocispec::SpecOpt;
use crate::runtime::{ContainerRecord, NewContainer, Runtime, RuntimeError, TaskInfo, TaskStatus};
use crate::Stores;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, ContainerRecord>>,
    tasks: Mutex<HashMap<String, TaskInfo>>,
    killed: Mutex<Vec<(String, String)>>,
    fail_create: AtomicBool,
    fail_set_labels: AtomicBool,
}

impl FakeRuntime {
    pub fn with_container(self, id: &str, name: &str) -> Self {
        self.add_container(id, name);
        self
    }

    /// Inserts a container object named `name`; an empty name makes it
    /// anonymous.
    pub fn add_container(&self, id: &str, name: &str) {
        let mut labels = HashMap::new();
        if !name.is_empty() {
            labels.insert(labels::NAME.to_owned(), name.to_owned());
        }
        lock(&self.containers).insert(
            id.to_owned(),
            ContainerRecord {
                id: id.to_owned(),
                labels,
                image: None,
                snapshotter: "overlayfs".to_owned(),
                snapshot_key: None,
                runtime: "io.containerd.runc.v2".to_owned(),
                spec: Spec::default(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn set_task(&self, id: &str, task: TaskInfo) {
        lock(&self.tasks).insert(id.to_owned(), task);
    }

    pub fn fail_create(self) -> Self {
        self.fail_create.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_set_labels(&self, fail: bool) {
        self.fail_set_labels.store(fail, Ordering::SeqCst);
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.containers).keys().cloned().collect()
    }

    /// Signals sent with `kill_task`, as (id, signal).
    pub fn killed(&self) -> Vec<(String, String)> {
        lock(&self.killed).clone()
    }
}

impl Runtime for FakeRuntime {
    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord, RuntimeError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("injected create failure".to_owned()));
        }
        let mut containers = lock(&self.containers);
        if containers.contains_key(&new.id) {
            return Err(RuntimeError::AlreadyExists(new.id));
        }
        let record = ContainerRecord::from_new(new);
        containers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        Ok(lock(&self.containers).values().cloned().collect())
    }

    fn container(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        lock(&self.containers)
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))
    }

    fn set_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<HashMap<String, String>, RuntimeError> {
        if self.fail_set_labels.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("injected label failure".to_owned()));
        }
        let mut containers = lock(&self.containers);
        let record = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        record.labels.extend(labels);
        Ok(record.labels.clone())
    }

    fn delete_container(&self, id: &str) -> Result<(), RuntimeError> {
        lock(&self.tasks).remove(id);
        lock(&self.containers)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))
    }

    fn task(&self, id: &str) -> Result<Option<TaskInfo>, RuntimeError> {
        Ok(lock(&self.tasks).get(id).cloned())
    }

    fn kill_task(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        task.status = TaskStatus::Stopped;
        lock(&self.killed).push((id.to_owned(), signal.to_owned()));
        Ok(())
    }

    fn delete_task(&self, id: &str) -> Result<(), RuntimeError> {
        lock(&self.tasks).remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImageService {
    images: HashMap<String, ImageConfig>,
}

impl FakeImageService {
    pub fn with_image(mut self, reference: &str, config: ImageConfig) -> Self {
        let key = Reference::parse(reference)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| reference.to_owned());
        self.images.insert(key, config);
        self
    }
}

impl ImageService for FakeImageService {
    fn ensure_image(
        &self,
        reference: &str,
        opts: &PullOptions,
    ) -> Result<EnsuredImage, ImageError> {
        let normalized = Reference::parse(reference)?.to_string();
        let config = self
            .images
            .get(&normalized)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(normalized.clone()))?;
        Ok(EnsuredImage {
            reference: normalized,
            digest: format!("sha256:{:064x}", self.images.len()),
            config,
            snapshotter: "overlayfs".to_owned(),
            platform: opts
                .platform
                .clone()
                .unwrap_or_else(crate::image::host_platform),
        })
    }
}

/// Wraps the built-in managers, failing or pausing where asked and
/// recording every call in `events`.
#[derive(Default, Clone)]
pub struct FakeNetworkProvider {
    pub fail_verify: bool,
    pub fail_setup: bool,
    /// Sleep inside `verify_network_options`, which runs while the volume
    /// lock is held.
    pub verify_delay: Option<Duration>,
    pub events: Arc<Mutex<Vec<String>>>,
    /// Prefix of the recorded events, to tell concurrent callers apart.
    pub tag: String,
}

impl FakeNetworkProvider {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

impl NetworkProvider for FakeNetworkProvider {
    fn manager<'a>(
        &self,
        options: NetworkOptions,
        ctx: NetworkContext<'a>,
    ) -> Result<Box<dyn NetworkOptionsManager + 'a>, NetworkError> {
        let inner = DefaultNetworkProvider::new("none").manager(options, ctx)?;
        Ok(Box::new(FakeNetworkManager {
            inner,
            provider: self.clone(),
        }))
    }
}

pub struct FakeNetworkManager<'a> {
    inner: Box<dyn NetworkOptionsManager + 'a>,
    provider: FakeNetworkProvider,
}

impl FakeNetworkManager<'_> {
    fn record(&self, event: String) {
        let event = if self.provider.tag.is_empty() {
            event
        } else {
            format!("{}:{}", self.provider.tag, event)
        };
        lock(&self.provider.events).push(event);
    }
}

impl NetworkOptionsManager for FakeNetworkManager<'_> {
    fn network_options(&self) -> &NetworkOptions {
        self.inner.network_options()
    }

    fn verify_network_options(&self) -> Result<(), NetworkError> {
        self.record("verify-start".to_owned());
        if let Some(delay) = self.provider.verify_delay {
            std::thread::sleep(delay);
        }
        self.record("verify-end".to_owned());
        if self.provider.fail_verify {
            return Err(NetworkError::Setup("injected verify failure".to_owned()));
        }
        self.inner.verify_network_options()
    }

    fn container_networking_opts(
        &mut self,
        id: &str,
    ) -> Result<(Vec<SpecOpt>, Vec<ContainerOpt>), NetworkError> {
        self.record(format!("opts:{id}"));
        self.inner.container_networking_opts(id)
    }

    fn internal_networking_option_labels(&self) -> Result<NetworkingLabels, NetworkError> {
        self.inner.internal_networking_option_labels()
    }

    fn setup_networking(&self, id: &str) -> Result<(), NetworkError> {
        self.record(format!("setup:{id}"));
        if self.provider.fail_setup {
            return Err(NetworkError::Setup("injected setup failure".to_owned()));
        }
        self.inner.setup_networking(id)
    }

    fn cleanup_networking(&self, container: &ContainerRecord) -> Result<(), NetworkError> {
        self.record(format!("cleanup:{}", container.id));
        self.inner.cleanup_networking(container)
    }
}

/// An isolated data root with its stores and a matching configuration.
pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub config: GlobalConfig,
    pub stores: Stores,
}

impl TestEnv {
    pub fn new() -> std::io::Result<Self> {
        let tmp = tempfile::tempdir()?;
        Self::in_dir(tmp).map_err(std::io::Error::other)
    }

    pub fn in_dir(tmp: tempfile::TempDir) -> Result<Self, LibstevedoreError> {
        let config = GlobalConfig {
            data_root: tmp.path().join("data"),
            cgroup_manager: CgroupManager::None,
            ..Default::default()
        };
        let stores = Stores::open(&config.data_root, &config.namespace)?;
        Ok(Self { tmp, config, stores })
    }

    pub fn state_dir(&self, id: &str) -> PathBuf {
        self.config.containers_dir().join(id)
    }

    pub fn backend<'a>(
        &'a self,
        runtime: &'a dyn Runtime,
        images: &'a dyn ImageService,
        networks: &'a dyn NetworkProvider,
    ) -> Backend<'a> {
        Backend {
            config: &self.config,
            runtime,
            images,
            networks,
        }
    }
}
