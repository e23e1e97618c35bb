use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    io::{ErrorKind, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use strongbox_core::{
    storage::{KeyDeletion, KeyPairHandle, KeyPairProvider},
    StoreError,
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

/// Modulus size for every generated key pair outside of tests.
pub const DEFAULT_MODULUS_BITS: usize = 4096;

/// OS keyring-backed provider. Each container is one keyring entry holding a
/// PKCS#8 PEM private key, keyed by `(service, container)`.
pub struct KeyringKeyPairProvider {
    service: String,
    modulus_bits: usize,
}

impl KeyringKeyPairProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }

    fn entry(&self, container: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, container).map_err(map_keyring_err)
    }

    fn load(&self, handle: &KeyPairHandle) -> Result<RsaPrivateKey, StoreError> {
        let pem = self
            .entry(handle.container())?
            .get_password()
            .map_err(map_keyring_err)?;
        decode_key(&pem)
    }
}

impl KeyPairProvider for KeyringKeyPairProvider {
    fn exists(&self, container: &str) -> Result<bool, StoreError> {
        match self.entry(container)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(err) => Err(map_keyring_err(err)),
        }
    }

    #[instrument(skip_all, fields(container = %container))]
    fn create(&self, container: &str) -> Result<KeyPairHandle, StoreError> {
        // The keyring has no create-if-absent, so this check and the write below can race.
        if self.exists(container)? {
            return Err(key_pair_exists(container));
        }
        let key = generate_key(self.modulus_bits)?;
        let pem = encode_key(&key)?;
        self.entry(container)?
            .set_password(&pem)
            .map_err(map_keyring_err)?;
        debug!("stored new key pair in keyring");
        Ok(KeyPairHandle::new(container))
    }

    #[instrument(skip_all, fields(container = %container))]
    fn delete(&self, container: &str) -> Result<KeyDeletion, StoreError> {
        match self.entry(container)?.delete_credential() {
            Ok(()) => Ok(KeyDeletion::Deleted),
            Err(keyring::Error::NoEntry) => Ok(KeyDeletion::AlreadyAbsent),
            Err(err) => Err(map_keyring_err(err)),
        }
    }

    fn encrypt(&self, handle: &KeyPairHandle, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_encrypt(&self.load(handle)?, plaintext)
    }

    fn decrypt(&self, handle: &KeyPairHandle, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_decrypt(&self.load(handle)?, ciphertext)
    }
}

/// Key-file provider for hosts without a usable OS keyring: one PEM file per
/// container inside `root`.
pub struct FileKeyPairProvider {
    root: PathBuf,
    modulus_bits: usize,
}

impl FileKeyPairProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }

    fn path_for(&self, container: &str) -> PathBuf {
        self.root.join(format!("{}.pem", URL_SAFE_NO_PAD.encode(container)))
    }

    fn load(&self, handle: &KeyPairHandle) -> Result<RsaPrivateKey, StoreError> {
        let path = self.path_for(handle.container());
        let pem = fs::read_to_string(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                missing_key_pair(handle.container())
            } else {
                StoreError::key_store(err)
            }
        })?;
        decode_key(&pem)
    }
}

impl KeyPairProvider for FileKeyPairProvider {
    fn exists(&self, container: &str) -> Result<bool, StoreError> {
        self.path_for(container)
            .try_exists()
            .map_err(StoreError::key_store)
    }

    #[instrument(skip_all, fields(container = %container))]
    fn create(&self, container: &str) -> Result<KeyPairHandle, StoreError> {
        if self.exists(container)? {
            return Err(key_pair_exists(container));
        }
        fs::create_dir_all(&self.root).map_err(StoreError::key_store)?;
        let key = generate_key(self.modulus_bits)?;
        let pem = encode_key(&key)?;

        // Temp files are created owner-only, and persist keeps that mode.
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(StoreError::key_store)?;
        tmp.write_all(pem.as_bytes()).map_err(StoreError::key_store)?;
        tmp.flush().map_err(StoreError::key_store)?;
        tmp.persist_noclobber(self.path_for(container))
            .map_err(|e| match e.error.kind() {
                ErrorKind::AlreadyExists => key_pair_exists(container),
                _ => StoreError::key_store(e.error),
            })?;
        debug!("wrote new key pair file");
        Ok(KeyPairHandle::new(container))
    }

    #[instrument(skip_all, fields(container = %container))]
    fn delete(&self, container: &str) -> Result<KeyDeletion, StoreError> {
        match fs::remove_file(self.path_for(container)) {
            Ok(()) => Ok(KeyDeletion::Deleted),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(KeyDeletion::AlreadyAbsent),
            Err(err) => Err(StoreError::key_store(err)),
        }
    }

    fn encrypt(&self, handle: &KeyPairHandle, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_encrypt(&self.load(handle)?, plaintext)
    }

    fn decrypt(&self, handle: &KeyPairHandle, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_decrypt(&self.load(handle)?, ciphertext)
    }
}

/// In-memory key-pair provider for tests and ephemeral sessions. Clones share
/// the same key pairs.
#[derive(Clone)]
pub struct InMemoryKeyPairProvider {
    inner: Arc<Mutex<HashMap<String, RsaPrivateKey>>>,
    modulus_bits: usize,
}

impl Default for InMemoryKeyPairProvider {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }
}

impl InMemoryKeyPairProvider {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RsaPrivateKey>>, StoreError> {
        self.inner
            .lock()
            .map_err(|err| StoreError::key_store(format!("lock poisoned: {err}")))
    }

    fn load(&self, handle: &KeyPairHandle) -> Result<RsaPrivateKey, StoreError> {
        self.lock()?
            .get(handle.container())
            .cloned()
            .ok_or_else(|| missing_key_pair(handle.container()))
    }
}

impl KeyPairProvider for InMemoryKeyPairProvider {
    fn exists(&self, container: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(container))
    }

    fn create(&self, container: &str) -> Result<KeyPairHandle, StoreError> {
        if self.exists(container)? {
            return Err(key_pair_exists(container));
        }
        let key = generate_key(self.modulus_bits)?;
        match self.lock()?.entry(container.to_string()) {
            Entry::Occupied(_) => return Err(key_pair_exists(container)),
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        Ok(KeyPairHandle::new(container))
    }

    fn delete(&self, container: &str) -> Result<KeyDeletion, StoreError> {
        Ok(match self.lock()?.remove(container) {
            Some(_) => KeyDeletion::Deleted,
            None => KeyDeletion::AlreadyAbsent,
        })
    }

    fn encrypt(&self, handle: &KeyPairHandle, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_encrypt(&self.load(handle)?, plaintext)
    }

    fn decrypt(&self, handle: &KeyPairHandle, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        oaep_decrypt(&self.load(handle)?, ciphertext)
    }
}

#[cfg(any(test, feature = "test-util"))]
mod weak_keys {
    use super::*;

    impl InMemoryKeyPairProvider {
        /// Test-only: generate keys below the production modulus size.
        pub fn with_modulus_bits(modulus_bits: usize) -> Self {
            Self {
                inner: Arc::default(),
                modulus_bits,
            }
        }
    }

    impl FileKeyPairProvider {
        /// Test-only: generate keys below the production modulus size.
        pub fn with_modulus_bits(root: impl Into<PathBuf>, modulus_bits: usize) -> Self {
            Self {
                root: root.into(),
                modulus_bits,
            }
        }
    }
}

fn generate_key(modulus_bits: usize) -> Result<RsaPrivateKey, StoreError> {
    RsaPrivateKey::new(&mut OsRng, modulus_bits)
        .map_err(|e| StoreError::key_store(format!("key generation failed: {e}")))
}

fn encode_key(key: &RsaPrivateKey) -> Result<Zeroizing<String>, StoreError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| StoreError::key_store(format!("encode error: {e}")))
}

fn decode_key(pem: &str) -> Result<RsaPrivateKey, StoreError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| StoreError::key_store(format!("decode error: {e}")))
}

fn oaep_encrypt(key: &RsaPrivateKey, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    RsaPublicKey::from(key)
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| StoreError::crypto(format!("encrypt failed: {e}")))
}

fn oaep_decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| StoreError::crypto(format!("decrypt failed: {e}")))
}

fn missing_key_pair(container: &str) -> StoreError {
    StoreError::key_store(format!("no key pair in container {container}"))
}

fn key_pair_exists(container: &str) -> StoreError {
    StoreError::key_store(format!("key pair already exists in container {container}"))
}

fn map_keyring_err(err: keyring::Error) -> StoreError {
    match err {
        keyring::Error::PlatformFailure(inner) => StoreError::UnsupportedPlatform {
            reason: inner.to_string(),
        },
        keyring::Error::NoStorageAccess(inner) => StoreError::UnsupportedPlatform {
            reason: inner.to_string(),
        },
        keyring::Error::NoEntry => StoreError::key_store("no key pair in keyring"),
        other => StoreError::key_store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 1024;

    #[test]
    fn memory_provider_round_trips_and_shares_keys() {
        let provider = InMemoryKeyPairProvider::with_modulus_bits(TEST_BITS);
        let handle = provider.create("primary").expect("create");

        let clone = provider.clone();
        assert!(clone.exists("primary").expect("exists"));

        let ciphertext = provider.encrypt(&handle, b"wrapped key").expect("encrypt");
        assert_ne!(ciphertext, b"wrapped key");
        assert_eq!(clone.decrypt(&handle, &ciphertext).expect("decrypt"), b"wrapped key");
    }

    #[test]
    fn decrypt_with_other_key_pair_fails() {
        let provider = InMemoryKeyPairProvider::with_modulus_bits(TEST_BITS);
        let first = provider.create("first").expect("create");
        let second = provider.create("second").expect("create");

        let ciphertext = provider.encrypt(&first, b"payload").expect("encrypt");
        let err = provider.decrypt(&second, &ciphertext).expect_err("wrong key");
        assert!(matches!(err, StoreError::Crypto { .. }));
    }

    #[test]
    fn memory_delete_is_idempotent() {
        let provider = InMemoryKeyPairProvider::with_modulus_bits(TEST_BITS);
        let handle = provider.create("gone").expect("create");

        assert_eq!(provider.delete("gone").expect("delete"), KeyDeletion::Deleted);
        assert_eq!(
            provider.delete("gone").expect("delete again"),
            KeyDeletion::AlreadyAbsent
        );
        let err = provider.encrypt(&handle, b"x").expect_err("key is gone");
        assert!(matches!(err, StoreError::KeyStore { .. }));
    }

    #[test]
    fn file_provider_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FileKeyPairProvider::with_modulus_bits(dir.path(), TEST_BITS);
        let handle = provider.create("app/settings v1").expect("create");
        let ciphertext = provider.encrypt(&handle, b"wrapped").expect("encrypt");

        let reopened = FileKeyPairProvider::new(dir.path());
        assert!(reopened.exists("app/settings v1").expect("exists"));
        assert_eq!(reopened.decrypt(&handle, &ciphertext).expect("decrypt"), b"wrapped");

        // container names never reach the file system verbatim
        let path = reopened.path_for("app/settings v1");
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(!path.to_string_lossy().contains("settings v1"));
    }

    #[test]
    fn file_provider_never_clobbers_existing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FileKeyPairProvider::with_modulus_bits(dir.path(), TEST_BITS);
        let handle = provider.create("only").expect("create");
        let ciphertext = provider.encrypt(&handle, b"kept").expect("encrypt");

        let err = provider.create("only").expect_err("second create must fail");
        assert_eq!(err, key_pair_exists("only"));
        assert_eq!(provider.decrypt(&handle, &ciphertext).expect("decrypt"), b"kept");
    }

    #[test]
    fn memory_provider_never_replaces_existing_key() {
        let provider = InMemoryKeyPairProvider::with_modulus_bits(TEST_BITS);
        let handle = provider.create("only").expect("create");
        let ciphertext = provider.encrypt(&handle, b"kept").expect("encrypt");

        let err = provider.create("only").expect_err("second create must fail");
        assert_eq!(err, key_pair_exists("only"));
        assert_eq!(provider.decrypt(&handle, &ciphertext).expect("decrypt"), b"kept");
    }

    #[test]
    fn file_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FileKeyPairProvider::with_modulus_bits(dir.path(), TEST_BITS);
        provider.create("k").expect("create");

        assert_eq!(provider.delete("k").expect("delete"), KeyDeletion::Deleted);
        assert_eq!(provider.delete("k").expect("delete again"), KeyDeletion::AlreadyAbsent);
        assert!(!provider.exists("k").expect("exists"));
    }

    #[test]
    fn keyring_platform_errors_are_unsupported() {
        let err = map_keyring_err(keyring::Error::PlatformFailure(Box::new(
            std::io::Error::other("no secret service"),
        )));
        assert!(matches!(err, StoreError::UnsupportedPlatform { .. }));

        let err = map_keyring_err(keyring::Error::NoEntry);
        assert!(matches!(err, StoreError::KeyStore { .. }));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_key("not a pem").expect_err("should reject garbage");
        assert!(matches!(err, StoreError::KeyStore { .. }));
    }
}
