use strongbox_core::{storage::PersistableKvStore, StoreError};
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::{asymmetric::AsymmetricKeyAccess, symmetric::DataKey};

/// Reserved key holding the data key wrapped under the active key pair.
pub const DATA_KEY_RECORD: &str = "_store:DataKeyCipher";
/// Reserved key holding the active key container name.
pub const KEY_CONTAINER_RECORD: &str = "_store:KeyContainer";

/// Owns the lifecycle of the store's single data key: generation, wrapping
/// under the active key pair, unwrapping on demand, and rewrapping on rotation.
#[derive(Debug)]
pub struct EnvelopeKeyManager {
    access: AsymmetricKeyAccess,
    cached: Option<CachedKey>,
}

/// Unwrapped key, valid only while the stored record equals `wrapped`.
#[derive(Debug)]
struct CachedKey {
    wrapped: String,
    key: DataKey,
}

impl EnvelopeKeyManager {
    pub fn new(access: AsymmetricKeyAccess) -> Self {
        Self {
            access,
            cached: None,
        }
    }

    pub fn access(&self) -> &AsymmetricKeyAccess {
        &self.access
    }

    /// Whether the store already carries a wrapped data key record.
    pub fn is_initialized<S: PersistableKvStore + ?Sized>(kv: &S) -> bool {
        wrapped_record(kv).is_some()
    }

    /// The active data key, creating and committing it first if the store has none.
    ///
    /// The record is committed before returning so it is durable no later than
    /// the first value encrypted under it.
    #[instrument(skip_all, fields(container = %self.access.container()))]
    pub fn current_data_key<S: PersistableKvStore + ?Sized>(
        &mut self,
        kv: &mut S,
    ) -> Result<DataKey, StoreError> {
        if let Some(wrapped) = wrapped_record(kv).map(str::to_owned) {
            return self.unwrap_record(&wrapped);
        }

        let key = DataKey::generate();
        let wrapped = self.wrap(&key)?;
        kv.set(DATA_KEY_RECORD, wrapped.clone());
        if let Err(err) = kv.commit() {
            kv.remove(DATA_KEY_RECORD);
            return Err(err);
        }
        info!("initialized data key");

        self.cached = Some(CachedKey {
            wrapped,
            key: key.clone(),
        });
        Ok(key)
    }

    /// The active data key if one exists; never creates one.
    pub fn existing_data_key<S: PersistableKvStore + ?Sized>(
        &mut self,
        kv: &S,
    ) -> Result<Option<DataKey>, StoreError> {
        match wrapped_record(kv).map(str::to_owned) {
            Some(wrapped) => self.unwrap_record(&wrapped).map(Some),
            None => Ok(None),
        }
    }

    /// Unwrap a stored record with the active key pair.
    pub fn unwrap_record(&mut self, wrapped: &str) -> Result<DataKey, StoreError> {
        if let Some(cached) = &self.cached {
            if cached.wrapped == wrapped {
                return Ok(cached.key.clone());
            }
        }

        let raw = Zeroizing::new(self.access.decrypt_from_string(wrapped)?);
        let key = DataKey::from_slice(&raw)?;
        debug!("unwrapped data key");
        self.cached = Some(CachedKey {
            wrapped: wrapped.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }

    /// Drop the cached unwrapped key.
    pub fn forget(&mut self) {
        self.cached = None;
    }

    /// Wrap `key` under the active key pair.
    pub fn wrap(&self, key: &DataKey) -> Result<String, StoreError> {
        self.access.encrypt_to_string(key.as_bytes())
    }

    /// A freshly generated data key and its record wrapped under `next`.
    /// Rotation always replaces the data key, not only its wrapping.
    pub fn rewrap(&self, next: &AsymmetricKeyAccess) -> Result<(DataKey, String), StoreError> {
        let key = DataKey::generate();
        let wrapped = next.encrypt_to_string(key.as_bytes())?;
        Ok((key, wrapped))
    }

    /// Switch to `access` once a rotation is durable. Returns the previous access.
    pub fn install(
        &mut self,
        access: AsymmetricKeyAccess,
        key: DataKey,
        wrapped: String,
    ) -> AsymmetricKeyAccess {
        self.cached = Some(CachedKey { wrapped, key });
        std::mem::replace(&mut self.access, access)
    }
}

fn wrapped_record<S: PersistableKvStore + ?Sized>(kv: &S) -> Option<&str> {
    kv.get(DATA_KEY_RECORD).filter(|value| !value.is_empty())
}
