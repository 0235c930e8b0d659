//! Key/value store trait for abstracting persistence.
//!
//! This trait allows the storage layer to work with different backends:
//! - In-memory (for testing and ephemeral sessions)
//! - A directory of files (one file per key)
//! - Any embedded database the host application already ships
//!
//! # Security Notes
//!
//! - The store itself has no security logic: every value handed to it is
//!   already a sealed envelope (see `crypto`)
//! - Keys are not secret; they only carry user/conversation identifiers

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Errors from the raw backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Abstract byte store
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, `None` if absent
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or overwrite the value under `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`; removing an absent key is not an error
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key starting with `prefix`, returning how many went
    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

// ============================================================
// IN-MEMORY STORE
// ============================================================

/// In-memory store
/// Clones share the same underlying map
#[derive(Default, Clone)]
pub struct InMemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    /// Write counters per key (for testing write amplification)
    write_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All keys with the given prefix, in order (for testing)
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Write count for a key (for testing)
    #[must_use]
    pub fn write_count(&self, key: &str) -> usize {
        self.write_counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Reset all write counters (for testing)
    pub fn reset_write_counts(&self) {
        self.write_counts.lock().clear();
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        *self.write_counts.lock().entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

// ============================================================
// DIRECTORY STORE
// ============================================================

/// One file per key under a root directory
///
/// File names are the hex encoding of the key, so arbitrary key bytes are
/// safe on every filesystem. Writes land in a temp file first and are
/// renamed into place, so a crash never leaves a torn value behind.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

const TMP_SUFFIX: &str = ".tmp";

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let bytes = hex::decode(file_name).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl KeyValueStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".into()));
        }
        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(value)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = Self::key_for(name) else { continue };
            if key.starts_with(prefix) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
