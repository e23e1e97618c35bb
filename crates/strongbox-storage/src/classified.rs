use std::{collections::BTreeSet, sync::Arc};

use strongbox_core::{
    storage::{KeyDeletion, KeyPairProvider, PersistableKvStore},
    StoreError,
};
use tracing::{debug, instrument, warn};

use crate::{
    asymmetric::AsymmetricKeyAccess,
    envelope::{EnvelopeKeyManager, DATA_KEY_RECORD, KEY_CONTAINER_RECORD},
    rotation::{RotationCoordinator, RotationOptions, RotationReport},
    symmetric::SymmetricCipher,
};

/// How a stored value is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Stored as given.
    Plaintext,
    /// Wrapped directly by the key pair.
    Asymmetric,
    /// `IV ‖ ciphertext` under the data key. The default for unlisted keys.
    Symmetric,
}

/// Everything the store needs to know about one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyClass {
    pub protection: Protection,
    /// Never returned by reads and never writable by callers.
    pub private: bool,
    /// Settable only while absent.
    pub readonly: bool,
}

/// Static partition of keys. The reserved records are always present:
/// the data key record is private and asymmetric, the key container record is
/// plaintext and read-only once set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyClassification {
    plaintext: BTreeSet<String>,
    asymmetric: BTreeSet<String>,
    private: BTreeSet<String>,
    readonly: BTreeSet<String>,
}

impl Default for KeyClassification {
    fn default() -> Self {
        Self {
            plaintext: BTreeSet::from([KEY_CONTAINER_RECORD.to_string()]),
            asymmetric: BTreeSet::from([DATA_KEY_RECORD.to_string()]),
            private: BTreeSet::from([DATA_KEY_RECORD.to_string()]),
            readonly: BTreeSet::from([KEY_CONTAINER_RECORD.to_string()]),
        }
    }
}

impl KeyClassification {
    /// Store `key` without encryption. Reserved keys keep their class.
    pub fn with_plaintext(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !is_reserved(&key) {
            self.asymmetric.remove(&key);
            self.plaintext.insert(key);
        }
        self
    }

    /// Protect `key` with the key pair directly instead of the data key.
    /// Values must fit in a single RSA-OAEP block.
    pub fn with_asymmetric(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !is_reserved(&key) {
            self.plaintext.remove(&key);
            self.asymmetric.insert(key);
        }
        self
    }

    pub fn with_private(mut self, key: impl Into<String>) -> Self {
        self.private.insert(key.into());
        self
    }

    pub fn with_readonly(mut self, key: impl Into<String>) -> Self {
        self.readonly.insert(key.into());
        self
    }

    pub fn classify(&self, key: &str) -> KeyClass {
        let protection = if self.plaintext.contains(key) {
            Protection::Plaintext
        } else if self.asymmetric.contains(key) {
            Protection::Asymmetric
        } else {
            Protection::Symmetric
        };
        KeyClass {
            protection,
            private: self.private.contains(key),
            readonly: self.readonly.contains(key),
        }
    }
}

/// Records rewritten directly by rotation rather than re-encrypted value by value.
pub fn is_reserved(key: &str) -> bool {
    key == DATA_KEY_RECORD || key == KEY_CONTAINER_RECORD
}

/// Settings map with transparent per-key protection on top of a
/// [`PersistableKvStore`].
///
/// Not synchronized: callers sharing one store across threads must serialize
/// every call themselves.
pub struct ClassifiedStore<S: PersistableKvStore> {
    pub(crate) kv: S,
    pub(crate) provider: Arc<dyn KeyPairProvider>,
    pub(crate) keys: EnvelopeKeyManager,
    pub(crate) classification: KeyClassification,
}

impl<S: PersistableKvStore> ClassifiedStore<S> {
    /// Open a store with the default classification. See [`ClassifiedStore::with_classification`].
    pub fn open(
        kv: S,
        provider: Arc<dyn KeyPairProvider>,
        container: &str,
    ) -> Result<Self, StoreError> {
        Self::with_classification(kv, provider, container, KeyClassification::default())
    }

    /// Open a store. The container name recorded in `kv` wins over `container`;
    /// `container` is recorded (uncommitted) when the map has none yet.
    #[instrument(skip_all, fields(container = %container))]
    pub fn with_classification(
        mut kv: S,
        provider: Arc<dyn KeyPairProvider>,
        container: &str,
        classification: KeyClassification,
    ) -> Result<Self, StoreError> {
        let active = match stored_container(&kv) {
            Some(stored) if stored != container => {
                warn!(stored, "store is bound to a different key container, using it");
                stored.to_string()
            }
            Some(stored) => stored.to_string(),
            None => {
                kv.set(KEY_CONTAINER_RECORD, container.to_string());
                container.to_string()
            }
        };
        let access = AsymmetricKeyAccess::open_or_create(Arc::clone(&provider), &active)?;

        Ok(Self {
            kv,
            provider,
            keys: EnvelopeKeyManager::new(access),
            classification,
        })
    }

    pub fn key_container_name(&self) -> &str {
        self.keys.access().container()
    }

    pub fn classification(&self) -> &KeyClassification {
        &self.classification
    }

    /// Plaintext value of `key`, or `None` if absent or private.
    #[instrument(skip_all, fields(key = %key))]
    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let class = self.classification.classify(key);
        if class.private {
            return Ok(None);
        }
        let Some(stored) = self.kv.get(key).map(str::to_owned) else {
            return Ok(None);
        };

        let value = match class.protection {
            Protection::Plaintext => stored,
            Protection::Asymmetric => {
                let bytes = self.keys.access().decrypt_from_string(&stored)?;
                String::from_utf8(bytes)
                    .map_err(|e| StoreError::crypto(format!("plaintext is not utf-8: {e}")))?
            }
            Protection::Symmetric => {
                let data_key = self
                    .keys
                    .existing_data_key(&self.kv)?
                    .ok_or(StoreError::KeyNotInitialized)?;
                SymmetricCipher::open_str(&stored, &data_key)?
            }
        };
        Ok(Some(value))
    }

    /// Protect and store `value` in memory. The first symmetric write also
    /// creates and commits the data key record; everything else waits for [`commit`].
    ///
    /// [`commit`]: ClassifiedStore::commit
    #[instrument(skip_all, fields(key = %key))]
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let class = self.classification.classify(key);
        if class.private {
            return Err(StoreError::ReservedKey {
                key: key.to_string(),
            });
        }
        if class.readonly && self.kv.contains(key) {
            return Err(StoreError::ReadOnlyViolation {
                key: key.to_string(),
            });
        }

        let stored = match class.protection {
            Protection::Plaintext => value.to_string(),
            Protection::Asymmetric => self.keys.access().encrypt_to_string(value.as_bytes())?,
            Protection::Symmetric => {
                let data_key = self.keys.current_data_key(&mut self.kv)?;
                SymmetricCipher::seal_str(value, &data_key)?
            }
        };
        self.kv.set(key, stored);
        debug!("stored value");
        Ok(())
    }

    /// Remove `key` from memory. Private and already-set read-only keys are refused.
    #[instrument(skip_all, fields(key = %key))]
    pub fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        let class = self.classification.classify(key);
        if class.private {
            return Err(StoreError::ReservedKey {
                key: key.to_string(),
            });
        }
        if class.readonly && self.kv.contains(key) {
            return Err(StoreError::ReadOnlyViolation {
                key: key.to_string(),
            });
        }
        Ok(self.kv.remove(key).is_some())
    }

    /// Whether a caller-visible value exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        !self.classification.classify(key).private && self.kv.contains(key)
    }

    /// Caller-visible keys, in order.
    pub fn keys(&self) -> Vec<String> {
        self.kv
            .keys()
            .into_iter()
            .filter(|key| !self.classification.classify(key).private)
            .collect()
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.kv.commit()
    }

    /// Reread the backing map, following a key container change made elsewhere.
    #[instrument(skip_all)]
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.kv.load()?;
        let current = self.key_container_name().to_string();
        match stored_container(&self.kv) {
            Some(stored) if stored != current => {
                debug!(stored, "key container changed on disk");
                let access = AsymmetricKeyAccess::open_or_create(Arc::clone(&self.provider), stored)?;
                self.keys = EnvelopeKeyManager::new(access);
            }
            Some(_) => {}
            None => self.kv.set(KEY_CONTAINER_RECORD, current),
        }
        Ok(())
    }

    /// Delete the active key pair. Protected values become unreadable.
    pub fn delete_key(&mut self) -> Result<KeyDeletion, StoreError> {
        self.keys.forget();
        self.keys.access().delete()
    }

    /// Re-encrypt everything under a new data key wrapped by the key pair in
    /// `container`. All-or-nothing; see [`RotationCoordinator`].
    pub fn rotate_key(
        &mut self,
        container: &str,
        options: RotationOptions,
    ) -> Result<RotationReport, StoreError> {
        RotationCoordinator::new(self).rotate(container, options)
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }

    pub fn into_inner(self) -> S {
        self.kv
    }
}

fn stored_container<S: PersistableKvStore + ?Sized>(kv: &S) -> Option<&str> {
    kv.get(KEY_CONTAINER_RECORD).filter(|name| !name.is_empty())
}
