use std::fmt;

use thiserror::Error;

/// Errors produced by the settings store, its ciphers, and its key-pair providers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The hosting platform has no compatible key store.
    #[error("key store unsupported on this platform: {reason}")]
    UnsupportedPlatform { reason: String },
    /// Decrypt/unwrap failure: wrong key, corrupted ciphertext, or bad padding.
    #[error("cryptographic failure: {reason}")]
    Crypto { reason: String },
    /// A protected value needs the data key but no wrapped data key record exists.
    #[error("data key has not been initialized")]
    KeyNotInitialized,
    /// The key is immutable once set and already holds a value.
    #[error("setting is read-only once set: {key}")]
    ReadOnlyViolation { key: String },
    /// The key is reserved for internal bookkeeping and cannot be written by callers.
    #[error("setting is reserved: {key}")]
    ReservedKey { key: String },
    /// Key-pair provider failure other than an unsupported platform.
    #[error("key store failure: {reason}")]
    KeyStore { reason: String },
    /// Underlying persistence failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
    /// Rotation failed; the store was rolled back before this was returned.
    #[error("key rotation to {container} failed during {phase}: {source}")]
    RotationFailure {
        container: String,
        phase: RotationPhase,
        #[source]
        source: Box<StoreError>,
    },
    /// Rotation failed and recommitting the previous state failed too. Durable
    /// storage may hold a partially rotated map.
    #[error(
        "key rotation to {container} failed during {phase} and the previous state \
         could not be recommitted ({rollback}): {source}"
    )]
    RollbackFailure {
        container: String,
        phase: RotationPhase,
        rollback: Box<StoreError>,
        #[source]
        source: Box<StoreError>,
    },
    /// The in-memory map differs from what was last committed.
    #[error("store has uncommitted changes")]
    UncommittedChanges,
}

impl StoreError {
    pub fn crypto<R: fmt::Display>(reason: R) -> Self {
        StoreError::Crypto {
            reason: reason.to_string(),
        }
    }

    pub fn key_store<R: fmt::Display>(reason: R) -> Self {
        StoreError::KeyStore {
            reason: reason.to_string(),
        }
    }

    pub fn storage<R: fmt::Display>(reason: R) -> Self {
        StoreError::Storage {
            reason: reason.to_string(),
        }
    }
}

/// States of a key rotation, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationPhase {
    Idle,
    Snapshotting,
    Rewrapping,
    Committing,
    Finalizing,
    RollingBack,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RotationPhase::Idle => "idle",
            RotationPhase::Snapshotting => "snapshotting",
            RotationPhase::Rewrapping => "rewrapping",
            RotationPhase::Committing => "committing",
            RotationPhase::Finalizing => "finalizing",
            RotationPhase::RollingBack => "rolling back",
        };
        f.write_str(label)
    }
}
