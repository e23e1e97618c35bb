use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::error::StoreError;

/// Flat ordered `string -> string` map that can be written to and reloaded
/// from durable storage.
///
/// `commit` must write the full map such that a later `load` from the same
/// location reproduces it exactly.
pub trait PersistableKvStore {
    /// Raw stored value for a key.
    fn get(&self, key: &str) -> Option<&str>;

    /// Insert or overwrite a raw value in memory. Nothing is durable until `commit`.
    fn set(&mut self, key: &str, value: String);

    /// Remove a key from memory, returning the previous raw value.
    fn remove(&mut self, key: &str) -> Option<String>;

    /// Owned copy of every entry.
    fn snapshot(&self) -> BTreeMap<String, String>;

    /// Replace the in-memory map wholesale.
    fn restore(&mut self, snapshot: BTreeMap<String, String>);

    /// Write the in-memory map to durable storage.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the in-memory map and reread it from durable storage.
    fn load(&mut self) -> Result<(), StoreError>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }
}

/// In-memory store for tests and smoke runs.
///
/// Clones share one "durable" backing, so a clone obtained via [`InMemoryKvStore::reopen`]
/// behaves like a second process opening the same file. Every commit is recorded.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    live: BTreeMap<String, String>,
    backing: Arc<Mutex<Backing>>,
}

#[derive(Debug, Default)]
struct Backing {
    durable: BTreeMap<String, String>,
    history: Vec<BTreeMap<String, String>>,
    failures_pending: usize,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh instance loaded from the same durable backing.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        let mut other = Self {
            live: BTreeMap::new(),
            backing: Arc::clone(&self.backing),
        };
        other.load()?;
        Ok(other)
    }

    /// What the last successful commit wrote.
    pub fn durable(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.lock()?.durable.clone())
    }

    /// Every successfully committed map, oldest first.
    pub fn commit_history(&self) -> Result<Vec<BTreeMap<String, String>>, StoreError> {
        Ok(self.lock()?.history.clone())
    }

    /// Make the next `count` commits fail with a storage error.
    pub fn fail_next_commits(&self, count: usize) -> Result<(), StoreError> {
        self.lock()?.failures_pending = count;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Backing>, StoreError> {
        self.backing
            .lock()
            .map_err(|err| StoreError::storage(format!("lock poisoned: {err}")))
    }
}

impl PersistableKvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Option<&str> {
        self.live.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: String) {
        self.live.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        self.live.remove(key)
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.live.clone()
    }

    fn restore(&mut self, snapshot: BTreeMap<String, String>) {
        self.live = snapshot;
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut backing = self.lock()?;
        if backing.failures_pending > 0 {
            backing.failures_pending -= 1;
            return Err(StoreError::storage("simulated commit failure"));
        }
        backing.durable = self.live.clone();
        backing.history.push(self.live.clone());
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let durable = self.lock()?.durable.clone();
        self.live = durable;
        Ok(())
    }
}
