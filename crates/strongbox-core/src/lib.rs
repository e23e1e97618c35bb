//! Core contracts for Strongbox: the persistable settings map, the key-pair
//! provider capability, and the shared error type.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod error;
pub mod storage;

pub use error::StoreError;
