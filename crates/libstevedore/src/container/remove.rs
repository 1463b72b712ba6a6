use super::Backend;
use crate::error::LibstevedoreError;
use crate::ipc;
use crate::labels::InternalLabels;
use crate::network::NetworkOptions;
use crate::runtime::ContainerRecord;
use crate::utils;
use crate::Stores;

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Kill a running task instead of refusing.
    pub force: bool,
    /// Also remove the anonymous volumes created for the container.
    pub volumes: bool,
}

/// Removes `container` and every piece of side state its creation left
/// behind. Only the runtime calls are fatal; side state cleanup failures
/// are logged so that a half-broken container can always be removed.
#[tracing::instrument(level = "debug", skip_all, fields(id = %container.id))]
pub fn remove_container(
    backend: &Backend<'_>,
    stores: &Stores,
    container: &ContainerRecord,
    opts: RemoveOptions,
) -> Result<(), LibstevedoreError> {
    let id = container.id.as_str();
    let internal = InternalLabels::from_labels(&container.labels)?;

    if let Some(task) = backend.runtime.task(id)? {
        if task.status.is_running() {
            if !opts.force {
                return Err(LibstevedoreError::TaskRunning {
                    id: id.to_owned(),
                    status: task.status.to_string(),
                });
            }
            backend.runtime.kill_task(id, "SIGKILL")?;
        }
        backend.runtime.delete_task(id)?;
    }

    let state_dir = if internal.state_dir.as_os_str().is_empty() {
        backend.config.containers_dir().join(id)
    } else {
        internal.state_dir.clone()
    };

    let ctx = backend.network_context(&stores.hosts, state_dir.clone());
    match backend
        .networks
        .manager(NetworkOptions::from_labels(&internal), ctx)
        .and_then(|manager| manager.cleanup_networking(container))
    {
        Ok(()) => {}
        Err(err) => tracing::warn!(%err, "failed to clean up networking"),
    }

    backend.runtime.delete_container(id)?;

    if let Err(err) = stores.hosts.dealloc(id) {
        tracing::warn!(%err, "failed to deallocate hosts entry");
    }
    if let Err(err) = ipc::cleanup(&state_dir) {
        tracing::warn!(%err, "failed to clean up IPC resources");
    }
    if let Err(err) = utils::remove_dir_all_if_exists(&state_dir) {
        tracing::warn!(?state_dir, %err, "failed to remove state directory");
    }
    if let Err(err) = stores.names.release(&internal.name, id) {
        tracing::warn!(name = %internal.name, %err, "failed to release name");
    }

    if opts.volumes && !internal.anonymous_volumes.is_empty() {
        let guard = stores.volumes.lock()?;
        for name in &internal.anonymous_volumes {
            if let Err(err) = guard.remove(name) {
                tracing::warn!(volume = %name, %err, "failed to remove anonymous volume");
            }
        }
    }

    tracing::debug!("container removed");
    Ok(())
}
