use std::collections::HashMap;

use super::Backend;
use crate::error::LibstevedoreError;
use crate::labels;
use crate::runtime::ContainerRecord;
use crate::utils;
use crate::Stores;

/// Renames `container` to `new_name`.
///
/// The name store, the hosts store and the container's labels are updated
/// in that order; a failure at any step restores the steps before it.
#[tracing::instrument(level = "debug", skip_all, fields(id = %container.id))]
pub fn rename_container(
    backend: &Backend<'_>,
    stores: &Stores,
    container: &ContainerRecord,
    new_name: &str,
) -> Result<(), LibstevedoreError> {
    utils::validate_name(new_name)?;
    let id = container.id.as_str();
    let old_name = container.name();
    if old_name == new_name {
        return Err(LibstevedoreError::SameName {
            id: id.to_owned(),
            name: new_name.to_owned(),
        });
    }

    stores.names.rename(old_name, id, new_name)?;

    if let Err(err) = stores.hosts.update(id, new_name) {
        restore_name(stores, id, old_name, new_name);
        return Err(err.into());
    }

    let update = HashMap::from([(labels::NAME.to_owned(), new_name.to_owned())]);
    if let Err(err) = backend.runtime.set_labels(id, update) {
        restore_name(stores, id, old_name, new_name);
        if let Err(err) = stores.hosts.update(id, old_name) {
            tracing::warn!(%err, "failed to restore hosts entry");
        }
        return Err(err.into());
    }

    tracing::debug!(old_name, new_name, "container renamed");
    Ok(())
}

fn restore_name(stores: &Stores, id: &str, old_name: &str, new_name: &str) {
    let restored = if old_name.is_empty() {
        stores.names.release(new_name, id)
    } else {
        stores.names.rename(new_name, id, old_name)
    };
    if let Err(err) = restored {
        tracing::warn!(old_name, %err, "failed to restore name");
    }
}
