use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use libstevedore::config::GlobalConfig;
use libstevedore::container::Backend;
use libstevedore::image::LayoutImageStore;
use libstevedore::network::DefaultNetworkProvider;
use libstevedore::runtime::LocalRuntime;
use libstevedore::Stores;

pub mod create;
pub mod inspect;
pub mod ps;
pub mod rename;
pub mod rm;
pub mod volume;

/// Everything a command needs, built once from the resolved configuration.
pub struct CommandContext {
    pub config: GlobalConfig,
    pub runtime: LocalRuntime,
    pub images: LayoutImageStore,
    pub networks: DefaultNetworkProvider,
    pub stores: Stores,
}

impl CommandContext {
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let runtime = LocalRuntime::new(&config.data_root, &config.namespace)
            .context("failed to open the runtime metadata store")?;
        let images = LayoutImageStore::new(config.images_dir(), &config.snapshotter);
        let networks = DefaultNetworkProvider::new(config.default_network.clone());
        let stores = Stores::open(&config.data_root, &config.namespace)
            .with_context(|| {
                format!("failed to open the stores of namespace {}", config.namespace)
            })?;
        Ok(Self {
            config,
            runtime,
            images,
            networks,
            stores,
        })
    }

    pub fn backend(&self) -> Backend<'_> {
        Backend {
            config: &self.config,
            runtime: &self.runtime,
            images: &self.images,
            networks: &self.networks,
        }
    }
}

/// Parses repeated `key=value` flags. A bare `key` maps to an empty value
/// unless `require_value` is set.
fn parse_key_values(
    flag: &str,
    values: &[String],
    require_value: bool,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for value in values {
        match value.split_once('=') {
            Some((key, _)) if key.is_empty() => bail!("invalid {flag} {value:?}: empty key"),
            Some((key, val)) => {
                map.insert(key.to_owned(), val.to_owned());
            }
            None if require_value => bail!("invalid {flag} {value:?}: expected key=value"),
            None => {
                map.insert(value.to_owned(), String::new());
            }
        }
    }
    Ok(map)
}
