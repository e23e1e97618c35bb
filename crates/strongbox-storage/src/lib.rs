//! Envelope-encrypted settings storage.
//! An RSA key pair (OS keyring, key files, or memory in tests) wraps one
//! AES-256 data key, which protects individual values at rest and in memory.

pub mod asymmetric;
pub mod classified;
pub mod envelope;
pub mod json_file_store;
pub mod key_provider;
pub mod rotation;
pub mod symmetric;

pub use classified::{ClassifiedStore, KeyClassification};
pub use rotation::{RotationOptions, RotationReport};
