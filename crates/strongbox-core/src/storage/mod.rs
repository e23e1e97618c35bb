pub mod key_pair;
pub mod kv_store;

pub use key_pair::{KeyDeletion, KeyPairHandle, KeyPairProvider};
pub use kv_store::{InMemoryKvStore, PersistableKvStore};
