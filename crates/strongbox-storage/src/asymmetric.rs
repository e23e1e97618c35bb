use std::{fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use strongbox_core::{
    storage::{KeyDeletion, KeyPairHandle, KeyPairProvider},
    StoreError,
};
use tracing::{debug, instrument};

/// Access to one named key pair. Only ever used to wrap small blobs such as
/// the data key; bulk values go through [`crate::symmetric::SymmetricCipher`].
#[derive(Clone)]
pub struct AsymmetricKeyAccess {
    provider: Arc<dyn KeyPairProvider>,
    handle: KeyPairHandle,
    created: bool,
}

impl AsymmetricKeyAccess {
    /// Bind to `container`, generating a key pair there if none exists.
    ///
    /// Check-then-create is not atomic across processes.
    #[instrument(skip_all, fields(container = %container))]
    pub fn open_or_create(
        provider: Arc<dyn KeyPairProvider>,
        container: &str,
    ) -> Result<Self, StoreError> {
        if container.trim().is_empty() {
            return Err(StoreError::key_store("key container name is empty"));
        }

        let (handle, created) = if provider.exists(container)? {
            (KeyPairHandle::new(container), false)
        } else {
            debug!("no key pair in container, generating one");
            (provider.create(container)?, true)
        };

        Ok(Self {
            provider,
            handle,
            created,
        })
    }

    pub fn container(&self) -> &str {
        self.handle.container()
    }

    /// Whether opening this access generated the key pair.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.provider.encrypt(&self.handle, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.provider.decrypt(&self.handle, ciphertext)
    }

    /// Stored form of an asymmetrically protected value: `base64(ciphertext)`.
    pub fn encrypt_to_string(&self, value: &[u8]) -> Result<String, StoreError> {
        Ok(STANDARD.encode(self.encrypt(value)?))
    }

    pub fn decrypt_from_string(&self, stored: &str) -> Result<Vec<u8>, StoreError> {
        let ciphertext = STANDARD
            .decode(stored)
            .map_err(|e| StoreError::crypto(format!("ciphertext decode failed: {e}")))?;
        self.decrypt(&ciphertext)
    }

    #[instrument(skip_all, fields(container = %self.container()))]
    pub fn delete(&self) -> Result<KeyDeletion, StoreError> {
        self.provider.delete(self.container())
    }
}

impl fmt::Debug for AsymmetricKeyAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsymmetricKeyAccess")
            .field("container", &self.container())
            .field("created", &self.created)
            .finish()
    }
}
