//! Durable client-side key/value store.
//!
//! Every value carries a revision so concurrent writers sharing one backing
//! file (two client processes, or two tabs in the browser build) can detect
//! that they raced instead of silently overwriting each other.

use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CLIENT_ID_KEY: &str = "taskchat.client_id";
pub const QUEUE_KEY: &str = "taskchat.outbound_queue";
pub const CACHED_USER_KEY: &str = "taskchat.cached_user";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("unable to determine a data directory for the local store")]
    NoDataDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub revision: u64,
    pub value: serde_json::Value,
}

pub trait LocalStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Writes `value` only if the stored revision equals `expected`
    /// (0 means "absent"). Returns the new revision.
    fn store_if(
        &self,
        key: &str,
        expected: u64,
        value: serde_json::Value,
    ) -> Result<u64, StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Decodes a typed value together with its revision.
pub fn read<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<(u64, T)>, StoreError> {
    match store.load(key)? {
        Some(entry) => Ok(Some((entry.revision, serde_json::from_value(entry.value)?))),
        None => Ok(None),
    }
}

/// Last-writer-wins write for keys that are never contended.
pub fn overwrite<T: Serialize>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<u64, StoreError> {
    let current = store.load(key)?.map(|entry| entry.revision).unwrap_or(0);
    store.store_if(key, current, serde_json::to_value(value)?)
}

fn check_revision(
    key: &str,
    entries: &HashMap<String, Versioned>,
    expected: u64,
) -> Result<u64, StoreError> {
    let found = entries.get(key).map(|entry| entry.revision).unwrap_or(0);
    if found != expected {
        return Err(StoreError::Conflict {
            key: key.to_string(),
            expected,
            found,
        });
    }
    Ok(found + 1)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store_if(
        &self,
        key: &str,
        expected: u64,
        value: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        let revision = check_revision(key, &entries, expected)?;
        entries.insert(key.to_string(), Versioned { revision, value });
        Ok(revision)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON file backed store. Each operation re-reads the file so writes from
/// another process sharing the path are observed.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let dirs = ProjectDirs::from("", "", "taskchat").ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_dir().join("sync-store.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, Versioned>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_all(&self, entries: &HashMap<String, Versioned>) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let _guard = self.guard.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn store_if(
        &self,
        key: &str,
        expected: u64,
        value: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let _guard = self.guard.lock();
        let mut entries = self.read_all()?;
        let revision = check_revision(key, &entries, expected)?;
        entries.insert(key.to_string(), Versioned { revision, value });
        self.write_all(&entries)?;
        Ok(revision)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.guard.lock();
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_rejects_stale_revision() {
        let store = MemoryStore::new();
        let first = store.store_if("k", 0, json!(1)).expect("first write");
        assert_eq!(first, 1);
        let second = store.store_if("k", 1, json!(2)).expect("second write");
        assert_eq!(second, 2);

        let err = store.store_if("k", 1, json!(3)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(store.load("k").unwrap().unwrap().value, json!(2));
    }

    #[test]
    fn file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");
        let a = FileStore::open(&path).expect("open a");
        let b = FileStore::open(&path).expect("open b");

        a.store_if(QUEUE_KEY, 0, json!(["x"])).expect("write a");
        let seen = b.load(QUEUE_KEY).expect("load").expect("present");
        assert_eq!(seen.revision, 1);
        assert_eq!(seen.value, json!(["x"]));

        // b races with a stale revision
        a.store_if(QUEUE_KEY, 1, json!(["x", "y"])).expect("write a again");
        assert!(matches!(
            b.store_if(QUEUE_KEY, 1, json!([])),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn overwrite_and_read_round_trip_typed_values() {
        let store = MemoryStore::new();
        overwrite(&store, CACHED_USER_KEY, &json!({"id": 1})).expect("write");
        overwrite(&store, CACHED_USER_KEY, &json!({"id": 2})).expect("rewrite");
        let (revision, value): (u64, serde_json::Value) =
            read(&store, CACHED_USER_KEY).unwrap().unwrap();
        assert_eq!(revision, 2);
        assert_eq!(value["id"], 2);

        store.remove(CACHED_USER_KEY).expect("remove");
        assert!(store.load(CACHED_USER_KEY).unwrap().is_none());
    }
}
