use std::{collections::BTreeMap, sync::Arc};

use strongbox_core::{
    error::RotationPhase,
    storage::{KeyDeletion, PersistableKvStore},
    StoreError,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    asymmetric::AsymmetricKeyAccess,
    classified::{is_reserved, ClassifiedStore, Protection},
    envelope::{EnvelopeKeyManager, DATA_KEY_RECORD, KEY_CONTAINER_RECORD},
    symmetric::{DataKey, SymmetricCipher},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationOptions {
    /// Delete the previous key pair once the rotated store is committed.
    pub delete_previous: bool,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            delete_previous: true,
        }
    }
}

/// The previous key pair survived a successful rotation. Non-fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not delete previous key pair {container}: {reason}")]
pub struct KeyDeletionWarning {
    pub container: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub previous_container: String,
    pub container: String,
    /// Values re-encrypted under the new key material.
    pub reencrypted: usize,
    /// Outcome of deleting the previous key pair, if it was attempted and succeeded.
    pub previous_deletion: Option<KeyDeletion>,
    pub warnings: Vec<KeyDeletionWarning>,
}

/// New key material plus the number of values moved onto it.
struct Migrated {
    access: AsymmetricKeyAccess,
    data_key: DataKey,
    wrapped: String,
    reencrypted: usize,
}

/// All-or-nothing re-encryption of a [`ClassifiedStore`] under a new data key
/// wrapped by a new key pair.
///
/// `Idle → Snapshotting → Rewrapping → Committing → Finalizing → Idle`, with
/// any failure in rewrapping or committing diverted to `RollingBack`, which
/// restores and recommits the snapshot before the error is returned.
/// Never retries.
///
/// The snapshot is the last committed map: a store with uncommitted changes is
/// refused with [`StoreError::UncommittedChanges`] before anything is touched.
pub struct RotationCoordinator<'a, S: PersistableKvStore> {
    store: &'a mut ClassifiedStore<S>,
    phase: RotationPhase,
}

impl<'a, S: PersistableKvStore> RotationCoordinator<'a, S> {
    pub fn new(store: &'a mut ClassifiedStore<S>) -> Self {
        Self {
            store,
            phase: RotationPhase::Idle,
        }
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    #[instrument(skip_all, fields(from = %self.store.key_container_name(), to = %target))]
    pub fn rotate(
        mut self,
        target: &str,
        options: RotationOptions,
    ) -> Result<RotationReport, StoreError> {
        let previous_container = self.store.key_container_name().to_string();
        if target.trim().is_empty() {
            return Err(StoreError::key_store("target key container name is empty"));
        }
        if target == previous_container {
            return Err(StoreError::key_store(format!(
                "{target} is already the active key container"
            )));
        }
        if !EnvelopeKeyManager::is_initialized(&self.store.kv) {
            return Err(StoreError::KeyNotInitialized);
        }

        self.enter(RotationPhase::Snapshotting);
        let backup = match self.committed_snapshot() {
            Ok(backup) => backup,
            Err(err) => {
                self.enter(RotationPhase::Idle);
                return Err(err);
            }
        };

        self.enter(RotationPhase::Rewrapping);
        let mut opened = None;
        let migrated = match self.migrate(target, &mut opened) {
            Ok(migrated) => migrated,
            Err(source) => {
                let phase = self.phase;
                let container = target.to_string();
                let source = Box::new(source);
                return Err(match self.roll_back(backup, opened) {
                    Ok(()) => StoreError::RotationFailure {
                        container,
                        phase,
                        source,
                    },
                    Err(rollback) => StoreError::RollbackFailure {
                        container,
                        phase,
                        rollback: Box::new(rollback),
                        source,
                    },
                });
            }
        };

        self.enter(RotationPhase::Finalizing);
        let reencrypted = migrated.reencrypted;
        let previous =
            self.store
                .keys
                .install(migrated.access, migrated.data_key, migrated.wrapped);

        let mut warnings = Vec::new();
        let mut previous_deletion = None;
        if options.delete_previous {
            match previous.delete() {
                Ok(outcome) => previous_deletion = Some(outcome),
                Err(err) => {
                    warn!(%err, container = %previous_container, "previous key pair was not deleted");
                    warnings.push(KeyDeletionWarning {
                        container: previous_container.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.enter(RotationPhase::Idle);
        info!(reencrypted, "key rotation complete");
        Ok(RotationReport {
            previous_container,
            container: target.to_string(),
            reencrypted,
            previous_deletion,
            warnings,
        })
    }

    /// The live map, provided it matches durable storage.
    fn committed_snapshot(&mut self) -> Result<BTreeMap<String, String>, StoreError> {
        let live = self.store.kv.snapshot();
        self.store.kv.load()?;
        if self.store.kv.snapshot() != live {
            self.store.kv.restore(live);
            return Err(StoreError::UncommittedChanges);
        }
        Ok(live)
    }

    /// Rewrapping and Committing. `opened` receives the target access as soon
    /// as it exists so rollback can discard a key pair this rotation created.
    fn migrate(
        &mut self,
        target: &str,
        opened: &mut Option<AsymmetricKeyAccess>,
    ) -> Result<Migrated, StoreError> {
        let next = AsymmetricKeyAccess::open_or_create(Arc::clone(&self.store.provider), target)?;
        *opened = Some(next.clone());

        let old_key = self
            .store
            .keys
            .existing_data_key(&self.store.kv)?
            .ok_or(StoreError::KeyNotInitialized)?;
        let (data_key, wrapped) = self.store.keys.rewrap(&next)?;

        let mut reencrypted = 0;
        for (key, stored) in self.store.kv.snapshot() {
            let class = self.store.classification.classify(&key);
            // Private values are raw bookkeeping; this store never encrypted them.
            if is_reserved(&key) || class.private {
                continue;
            }
            let rewritten = match class.protection {
                Protection::Plaintext => continue,
                Protection::Symmetric => {
                    let value = Zeroizing::new(SymmetricCipher::open_str(&stored, &old_key)?);
                    SymmetricCipher::seal_str(&value, &data_key)?
                }
                Protection::Asymmetric => {
                    let value =
                        Zeroizing::new(self.store.keys.access().decrypt_from_string(&stored)?);
                    next.encrypt_to_string(&value)?
                }
            };
            debug!(key = %key, "re-encrypted value");
            self.store.kv.set(&key, rewritten);
            reencrypted += 1;
        }

        self.store.kv.set(DATA_KEY_RECORD, wrapped.clone());
        self.store.kv.set(KEY_CONTAINER_RECORD, target.to_string());

        self.enter(RotationPhase::Committing);
        self.store.kv.commit()?;

        Ok(Migrated {
            access: next,
            data_key,
            wrapped,
            reencrypted,
        })
    }

    /// Restores the snapshot in memory and on disk. Only a failed recommit is
    /// returned; a leftover target key pair is logged.
    fn roll_back(
        &mut self,
        backup: BTreeMap<String, String>,
        opened: Option<AsymmetricKeyAccess>,
    ) -> Result<(), StoreError> {
        error!(phase = %self.phase, "key rotation failed, restoring previous state");
        self.enter(RotationPhase::RollingBack);

        self.store.kv.restore(backup);
        let recommitted = self.store.kv.commit();
        if let Err(err) = &recommitted {
            error!(%err, "recommitting previous state failed");
        }

        if let Some(next) = opened.filter(AsymmetricKeyAccess::was_created) {
            if let Err(err) = next.delete() {
                warn!(%err, container = %next.container(), "could not discard new key pair");
            }
        }
        self.enter(RotationPhase::Idle);
        recommitted
    }

    fn enter(&mut self, phase: RotationPhase) {
        debug!(from = %self.phase, to = %phase, "rotation phase");
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use strongbox_core::storage::{InMemoryKvStore, KeyPairHandle, KeyPairProvider};

    use super::*;
    use crate::{
        classified::KeyClassification, json_file_store::JsonFileKvStore,
        key_provider::InMemoryKeyPairProvider,
    };

    fn provider() -> Arc<InMemoryKeyPairProvider> {
        Arc::new(InMemoryKeyPairProvider::with_modulus_bits(1024))
    }

    #[test]
    fn rotated_store_reads_back_under_the_new_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let provider = provider();

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut store = ClassifiedStore::open(kv, provider.clone(), "A").expect("open");
        store
            .set("PROPERTY", "This is a plain-text property.")
            .expect("set");
        store.set("NESTED:LEVEL1", "nested value").expect("set");
        store.commit().expect("commit");

        let report = store
            .rotate_key("B", RotationOptions::default())
            .expect("rotate");
        assert_eq!(report.previous_container, "A");
        assert_eq!(report.container, "B");
        assert_eq!(report.reencrypted, 2);
        assert_eq!(report.previous_deletion, Some(KeyDeletion::Deleted));
        assert!(report.warnings.is_empty());
        assert!(!provider.exists("A").expect("exists"));

        // the rotated in-memory store keeps working
        assert_eq!(store.key_container_name(), "B");
        assert_eq!(
            store.get("NESTED:LEVEL1").expect("get").as_deref(),
            Some("nested value")
        );

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut fresh = ClassifiedStore::open(kv, provider.clone(), "B").expect("open");
        assert_eq!(
            fresh.get("PROPERTY").expect("get").as_deref(),
            Some("This is a plain-text property.")
        );
        assert_eq!(
            fresh.get("NESTED:LEVEL1").expect("get").as_deref(),
            Some("nested value")
        );
    }

    #[test]
    fn rotation_replaces_the_data_key() {
        let provider = provider();
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");
        let before = store.kv().snapshot();

        store
            .rotate_key("B", RotationOptions::default())
            .expect("rotate");
        let after = store.kv().snapshot();

        assert_ne!(before[DATA_KEY_RECORD], after[DATA_KEY_RECORD]);
        assert_ne!(before["PROPERTY"], after["PROPERTY"]);
        assert_eq!(after[KEY_CONTAINER_RECORD], "B");
    }

    #[test]
    fn failure_partway_leaves_backing_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let provider = provider();

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut store = ClassifiedStore::open(kv, provider.clone(), "A").expect("open");
        for (key, value) in [("K1", "one"), ("K2", "two"), ("K3", "three"), ("K4", "four"), ("K5", "five")] {
            store.set(key, value).expect("set");
        }
        store.commit().expect("commit");

        // Third of five entries in key order no longer decrypts.
        let corrupt = "A".repeat(48);
        let mut kv = store.into_inner();
        kv.set("K3", corrupt.clone());
        kv.commit().expect("commit corruption");
        let before = std::fs::read(&path).expect("read");

        let mut store = ClassifiedStore::open(kv, provider.clone(), "A").expect("reopen");
        let err = store
            .rotate_key("B", RotationOptions::default())
            .expect_err("rotation must fail");
        match &err {
            StoreError::RotationFailure {
                container,
                phase,
                source,
            } => {
                assert_eq!(container, "B");
                assert_eq!(*phase, RotationPhase::Rewrapping);
                assert!(matches!(**source, StoreError::Crypto { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(std::fs::read(&path).expect("read"), before);
        assert_eq!(store.key_container_name(), "A");
        assert!(provider.exists("A").expect("exists"));
        assert!(!provider.exists("B").expect("exists"), "new key pair is discarded");

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut fresh = ClassifiedStore::open(kv, provider.clone(), "A").expect("open");
        for (key, value) in [("K1", "one"), ("K2", "two"), ("K4", "four"), ("K5", "five")] {
            assert_eq!(fresh.get(key).expect("get").as_deref(), Some(value));
        }
        assert_eq!(fresh.kv().get("K3"), Some(corrupt.as_str()));
    }

    #[test]
    fn commit_failure_rolls_back_and_keeps_existing_target() {
        let provider = provider();
        provider.create("B").expect("pre-existing target");
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");
        let before = store.kv().durable().expect("durable");

        store.kv().fail_next_commits(1).expect("arm failure");
        let err = store
            .rotate_key("B", RotationOptions::default())
            .expect_err("commit fails");
        assert!(matches!(
            err,
            StoreError::RotationFailure {
                phase: RotationPhase::Committing,
                ..
            }
        ));

        assert_eq!(store.kv().durable().expect("durable"), before);
        assert_eq!(store.kv().snapshot(), before);
        assert!(provider.exists("B").expect("exists"), "pre-existing pair is kept");
        assert_eq!(store.get("PROPERTY").expect("get").as_deref(), Some("value"));
    }

    #[test]
    fn asymmetric_settings_move_to_the_new_key_pair() {
        let provider = provider();
        let classification = KeyClassification::default()
            .with_asymmetric("App:Master")
            .with_plaintext("App:Name");
        let mut store = ClassifiedStore::with_classification(
            InMemoryKvStore::new(),
            provider.clone(),
            "A",
            classification.clone(),
        )
        .expect("open");
        store.set("App:Master", "pa55word").expect("set");
        store.set("App:Name", "strongbox").expect("set");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");

        let report = store
            .rotate_key("B", RotationOptions::default())
            .expect("rotate");
        assert_eq!(report.reencrypted, 2);

        let kv = store.kv().reopen().expect("reopen");
        let mut fresh =
            ClassifiedStore::with_classification(kv, provider.clone(), "B", classification)
                .expect("open");
        assert_eq!(fresh.get("App:Master").expect("get").as_deref(), Some("pa55word"));
        assert_eq!(fresh.kv().get("App:Name"), Some("strongbox"));
    }

    #[test]
    fn keep_previous_leaves_old_key_pair() {
        let provider = provider();
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");

        let report = store
            .rotate_key(
                "B",
                RotationOptions {
                    delete_previous: false,
                },
            )
            .expect("rotate");
        assert_eq!(report.previous_deletion, None);
        assert!(provider.exists("A").expect("exists"));
    }

    #[test]
    fn refuses_rotation_without_key_material_or_to_same_container() {
        let provider = provider();
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");

        let err = store
            .rotate_key("B", RotationOptions::default())
            .expect_err("nothing to rotate");
        assert_eq!(err, StoreError::KeyNotInitialized);
        assert!(!provider.exists("B").expect("exists"));

        store.set("PROPERTY", "value").expect("set");
        let err = store
            .rotate_key("A", RotationOptions::default())
            .expect_err("same container");
        assert!(matches!(err, StoreError::KeyStore { .. }));
        assert!(provider.exists("A").expect("exists"));
    }

    #[test]
    fn private_bookkeeping_is_carried_over_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let provider = provider();
        let classification = KeyClassification::default().with_private("App:Internal");

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut store =
            ClassifiedStore::with_classification(kv, provider.clone(), "A", classification.clone())
                .expect("open");
        store.set("PROPERTY", "value").expect("set");
        let mut kv = store.into_inner();
        kv.set("App:Internal", "raw bookkeeping".into());
        kv.commit().expect("commit");

        let mut store =
            ClassifiedStore::with_classification(kv, provider.clone(), "A", classification.clone())
                .expect("reopen");
        let report = store
            .rotate_key("B", RotationOptions::default())
            .expect("rotate");
        assert_eq!(report.reencrypted, 1);

        let kv = JsonFileKvStore::open(&path).expect("kv");
        let mut fresh = ClassifiedStore::with_classification(kv, provider, "B", classification)
            .expect("open");
        assert_eq!(fresh.kv().get("App:Internal"), Some("raw bookkeeping"));
        assert_eq!(fresh.get("App:Internal").expect("get"), None);
        assert_eq!(fresh.get("PROPERTY").expect("get").as_deref(), Some("value"));
    }

    #[test]
    fn failed_recommit_is_reported_with_the_original_cause() {
        let provider = provider();
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");

        store.kv().fail_next_commits(2).expect("arm failures");
        let err = store
            .rotate_key("B", RotationOptions::default())
            .expect_err("both commits fail");
        match err {
            StoreError::RollbackFailure {
                container,
                phase,
                rollback,
                source,
            } => {
                assert_eq!(container, "B");
                assert_eq!(phase, RotationPhase::Committing);
                assert!(matches!(*rollback, StoreError::Storage { .. }));
                assert!(matches!(*source, StoreError::Storage { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!provider.exists("B").expect("exists"), "new key pair is discarded");
        assert_eq!(store.key_container_name(), "A");
    }

    #[test]
    fn refuses_rotation_with_uncommitted_changes() {
        let provider = provider();
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider.clone(), "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");
        store.set("PENDING", "not yet durable").expect("set");
        let history = store.kv().commit_history().expect("history").len();

        let err = store
            .rotate_key("B", RotationOptions::default())
            .expect_err("pending edits");
        assert_eq!(err, StoreError::UncommittedChanges);
        assert!(!provider.exists("B").expect("exists"));
        assert_eq!(store.kv().commit_history().expect("history").len(), history);
        assert_eq!(
            store.get("PENDING").expect("get").as_deref(),
            Some("not yet durable"),
            "pending edits stay in memory"
        );

        store.commit().expect("commit");
        store
            .rotate_key("B", RotationOptions::default())
            .expect("rotate after commit");
    }

    /// Delegates to an in-memory provider but refuses to delete anything.
    struct UndeletableProvider(InMemoryKeyPairProvider);

    impl KeyPairProvider for UndeletableProvider {
        fn exists(&self, container: &str) -> Result<bool, StoreError> {
            self.0.exists(container)
        }

        fn create(&self, container: &str) -> Result<KeyPairHandle, StoreError> {
            self.0.create(container)
        }

        fn delete(&self, _container: &str) -> Result<KeyDeletion, StoreError> {
            Err(StoreError::key_store("access denied"))
        }

        fn encrypt(&self, handle: &KeyPairHandle, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
            self.0.encrypt(handle, plaintext)
        }

        fn decrypt(&self, handle: &KeyPairHandle, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
            self.0.decrypt(handle, ciphertext)
        }
    }

    #[test]
    fn failed_cleanup_is_a_warning_not_a_rollback() {
        let inner = InMemoryKeyPairProvider::with_modulus_bits(1024);
        let provider = Arc::new(UndeletableProvider(inner.clone()));
        let mut store =
            ClassifiedStore::open(InMemoryKvStore::new(), provider, "A").expect("open");
        store.set("PROPERTY", "value").expect("set");
        store.commit().expect("commit");

        let report = store
            .rotate_key("B", RotationOptions::default())
            .expect("rotation still succeeds");
        assert_eq!(report.previous_deletion, None);
        assert_eq!(
            report.warnings,
            vec![KeyDeletionWarning {
                container: "A".into(),
                reason: "key store failure: access denied".into(),
            }]
        );
        assert!(inner.exists("A").expect("exists"));
        assert_eq!(
            store.kv().durable().expect("durable")[KEY_CONTAINER_RECORD],
            "B"
        );
    }
}
