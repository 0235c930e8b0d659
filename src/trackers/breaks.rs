use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::encrypted_db::EncryptedDb;
use crate::error::Result;
use crate::types::{TlfId, Uid};

const BREAK_TRACKER_VERSION: u32 = 1;

/// Identify result for one member of a folder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyFailure {
    pub user: Uid,
    /// Proofs that failed; empty means the identify passed
    pub breaks: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BreakRecord {
    failures: Vec<IdentifyFailure>,
}

fn break_key(tlf_id: &TlfId) -> String {
    format!("tb:{tlf_id}")
}

/// Identify failures per top-level folder
pub struct BreakTracker {
    db: EncryptedDb,
    lock: Mutex<()>,
}

impl BreakTracker {
    pub fn new(db: EncryptedDb) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    pub fn update_tlf(&self, tlf_id: &TlfId, failures: Vec<IdentifyFailure>) -> Result<()> {
        let _guard = self.lock.lock();
        self.db
            .put(&break_key(tlf_id), BREAK_TRACKER_VERSION, &BreakRecord { failures })
    }

    pub fn clear(&self, tlf_id: &TlfId) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.delete(&break_key(tlf_id))
    }

    /// Whether any member of the folder has a failed proof
    pub fn is_tlf_broken(&self, tlf_id: &TlfId) -> Result<bool> {
        let _guard = self.lock.lock();
        let record: Option<BreakRecord> = self.db.get(&break_key(tlf_id), BREAK_TRACKER_VERSION)?;
        Ok(record.is_some_and(|r| r.failures.iter().any(|f| !f.breaks.is_empty())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::{KeyPurpose, SecretKey, StaticKeyProvider};
    use crate::kv::InMemoryStore;

    #[test]
    fn test_broken_only_with_failed_proofs() {
        let t = BreakTracker::new(EncryptedDb::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticKeyProvider::new(SecretKey::generate())),
            KeyPurpose::Trackers,
        ));
        let tlf = TlfId::new(vec![7]);
        assert!(!t.is_tlf_broken(&tlf).unwrap());

        let ok = IdentifyFailure {
            user: Uid::new(vec![1]),
            breaks: Vec::new(),
        };
        t.update_tlf(&tlf, vec![ok.clone()]).unwrap();
        assert!(!t.is_tlf_broken(&tlf).unwrap());

        let bad = IdentifyFailure {
            user: Uid::new(vec![2]),
            breaks: vec!["twitter".into()],
        };
        t.update_tlf(&tlf, vec![ok, bad]).unwrap();
        assert!(t.is_tlf_broken(&tlf).unwrap());

        t.update_tlf(&tlf, Vec::new()).unwrap();
        assert!(!t.is_tlf_broken(&tlf).unwrap());
    }
}
