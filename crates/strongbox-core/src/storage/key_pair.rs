use std::fmt;

use crate::error::StoreError;

/// Opaque reference to an asymmetric key pair held by a [`KeyPairProvider`],
/// identified by its container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPairHandle {
    container: String,
}

impl KeyPairHandle {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }
}

impl fmt::Display for KeyPairHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.container)
    }
}

/// Outcome of a successful key-pair deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDeletion {
    Deleted,
    AlreadyAbsent,
}

/// Keystore for named asymmetric key pairs (OS keyring, key files, or memory in tests).
///
/// Implementations on a platform without a usable backing store must return
/// [`StoreError::UnsupportedPlatform`] rather than panic.
pub trait KeyPairProvider: Send + Sync {
    /// Whether a key pair exists under `container`.
    fn exists(&self, container: &str) -> Result<bool, StoreError>;

    /// Generate and persist a new key pair under `container`.
    fn create(&self, container: &str) -> Result<KeyPairHandle, StoreError>;

    /// Remove the key pair; succeeds with [`KeyDeletion::AlreadyAbsent`] if there is none.
    fn delete(&self, container: &str) -> Result<KeyDeletion, StoreError>;

    /// Encrypt a short blob (a wrapped key, not bulk data) with the public key.
    fn encrypt(&self, handle: &KeyPairHandle, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Decrypt with the private key; fails with [`StoreError::Crypto`] if the
    /// ciphertext was not produced by the matching public key.
    fn decrypt(&self, handle: &KeyPairHandle, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError>;
}
