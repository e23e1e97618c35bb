use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use strongbox_core::{storage::PersistableKvStore, StoreError};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Settings map persisted as one flat JSON object. Keys are written in sorted
/// order, so the same map always produces the same bytes.
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    data: BTreeMap<String, String>,
}

impl JsonFileKvStore {
    /// Open `path`, treating a missing or empty file as an empty map.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self {
            path: path.into(),
            data: BTreeMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistableKvStore for JsonFileKvStore {
    fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: String) {
        self.data.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    fn restore(&mut self, snapshot: BTreeMap<String, String>) {
        self.data = snapshot;
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn commit(&mut self) -> Result<(), StoreError> {
        write_map(&self.path, &self.data)?;
        debug!(entries = self.data.len(), "committed settings");
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        self.data = read_map(&self.path)?;
        Ok(())
    }
}

fn write_map(path: &Path, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(StoreError::storage)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(StoreError::storage)?;
    let mut json = serde_json::to_vec_pretty(data).map_err(StoreError::storage)?;
    json.push(b'\n');
    tmp.write_all(&json).map_err(StoreError::storage)?;
    tmp.flush().map_err(StoreError::storage)?;
    tmp.persist(path).map_err(|e| StoreError::storage(e.error))?;
    Ok(())
}

fn read_map(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(StoreError::storage(err)),
    };
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&contents)
        .map_err(|e| StoreError::storage(format!("{}: {e}", path.display())))
}
