//! Sealed record access for one keyspace.
//!
//! Binds a raw store, the key provider and a `KeyPurpose` so callers read
//! and write typed records without handling keys or envelopes.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{open_record, seal_record, KeyProvider, KeyPurpose, SecretKey};
use crate::error::Result;
use crate::kv::KeyValueStore;

#[derive(Clone)]
pub struct EncryptedDb {
    store: Arc<dyn KeyValueStore>,
    keys: Arc<dyn KeyProvider>,
    purpose: KeyPurpose,
}

impl EncryptedDb {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<dyn KeyProvider>, purpose: KeyPurpose) -> Self {
        Self { store, keys, purpose }
    }

    fn key(&self) -> Result<SecretKey> {
        let root = self.keys.secret_key()?;
        Ok(root.derive_subkey(self.purpose)?)
    }

    /// Read the record at `key`
    ///
    /// Absent and stale-format records both read as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, version: u32) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        Ok(open_record(&self.key()?, version, &bytes)?)
    }

    pub fn put<T: Serialize>(&self, key: &str, version: u32, value: &T) -> Result<()> {
        let bytes = seal_record(&self.key()?, version, value)?;
        self.store.put(key, &bytes)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyError, StaticKeyProvider};
    use crate::error::StorageError;
    use crate::kv::InMemoryStore;

    struct NoKey;

    impl KeyProvider for NoKey {
        fn secret_key(&self) -> std::result::Result<SecretKey, KeyError> {
            Err(KeyError::Unavailable("locked".into()))
        }
    }

    fn db(store: &InMemoryStore, key: &SecretKey, purpose: KeyPurpose) -> EncryptedDb {
        EncryptedDb::new(
            Arc::new(store.clone()),
            Arc::new(StaticKeyProvider::new(key.clone())),
            purpose,
        )
    }

    #[test]
    fn test_put_get_delete() {
        let store = InMemoryStore::new();
        let db = db(&store, &SecretKey::generate(), KeyPurpose::Trackers);
        db.put("k", 1, &42u64).unwrap();
        assert_eq!(db.get::<u64>("k", 1).unwrap(), Some(42));
        db.delete("k").unwrap();
        assert_eq!(db.get::<u64>("k", 1).unwrap(), None);
    }

    #[test]
    fn test_stale_version_reads_absent() {
        let store = InMemoryStore::new();
        let db = db(&store, &SecretKey::generate(), KeyPurpose::Trackers);
        db.put("k", 1, &42u64).unwrap();
        assert_eq!(db.get::<u64>("k", 2).unwrap(), None);
    }

    #[test]
    fn test_purposes_do_not_mix() {
        let store = InMemoryStore::new();
        let key = SecretKey::generate();
        db(&store, &key, KeyPurpose::Inbox).put("k", 1, &1u64).unwrap();
        let err = db(&store, &key, KeyPurpose::Outbox).get::<u64>("k", 1).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_key_failure_is_misc() {
        let db = EncryptedDb::new(Arc::new(InMemoryStore::new()), Arc::new(NoKey), KeyPurpose::Inbox);
        let err = db.put("k", 1, &1u64).unwrap_err();
        assert!(matches!(err, StorageError::Misc(_)));
        assert!(!err.should_clear());
    }
}
