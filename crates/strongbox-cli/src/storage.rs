use std::{path::PathBuf, sync::Arc};

use crate::config::{Config, KeyBackend};
use color_eyre::Result;
use dirs::data_dir;
use strongbox_core::storage::KeyPairProvider;
use strongbox_storage::{
    json_file_store::JsonFileKvStore,
    key_provider::{FileKeyPairProvider, KeyringKeyPairProvider},
    ClassifiedStore,
};
use tracing::debug;

/// Keyring service every key pair is filed under.
const KEYRING_SERVICE: &str = "strongbox";
/// Container bound to a store that has none recorded and no config override.
pub const DEFAULT_CONTAINER: &str = "strongbox.v1";

/// Resolve the default data directory for Strongbox.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("strongbox"))
}

/// Settings file path, honouring the config override.
pub fn store_path(config: &Config) -> Result<PathBuf> {
    match &config.store_path {
        Some(path) => Ok(path.clone()),
        None => Ok(default_data_dir()?.join("settings.json")),
    }
}

/// Build the key-pair provider selected by `key_backend`.
pub fn key_provider(config: &Config) -> Result<Arc<dyn KeyPairProvider>> {
    match config.key_backend {
        KeyBackend::File => {
            let root = match &config.key_dir {
                Some(dir) => dir.clone(),
                None => default_data_dir()?.join("keys"),
            };
            debug!(?root, "using file key-pair provider");
            Ok(Arc::new(FileKeyPairProvider::new(root)))
        }
        KeyBackend::Keyring => {
            debug!(service = KEYRING_SERVICE, "using keyring key-pair provider");
            Ok(Arc::new(KeyringKeyPairProvider::new(KEYRING_SERVICE)))
        }
    }
}

/// Open the configured settings store.
pub fn open_store(config: &Config) -> Result<ClassifiedStore<JsonFileKvStore>> {
    let path = store_path(config)?;
    debug!(?path, "opening settings store");
    let kv = JsonFileKvStore::open(path)?;
    let container = config
        .key_container
        .as_deref()
        .unwrap_or(DEFAULT_CONTAINER);
    Ok(ClassifiedStore::open(kv, key_provider(config)?, container)?)
}

/// Helper for tests: a store in `root` whose key pairs live in memory.
#[cfg(test)]
pub fn test_store(root: impl Into<PathBuf>) -> ClassifiedStore<JsonFileKvStore> {
    use strongbox_storage::key_provider::InMemoryKeyPairProvider;

    let kv = JsonFileKvStore::open(root.into().join("settings.json")).expect("open kv");
    let provider = Arc::new(InMemoryKeyPairProvider::with_modulus_bits(1024));
    ClassifiedStore::open(kv, provider, DEFAULT_CONTAINER).expect("open store")
}
