use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::types::{ConversationId, MessageId, Timestamp, Uid};

const EPHEMERAL_TRACKER_VERSION: u32 = 1;

/// Purge schedule for one conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPurgeInfo {
    pub conv_id: ConversationId,
    /// Smallest id of an ephemeral message that has not exploded yet
    pub min_unexploded_id: MessageId,
    /// Earliest pending expiry
    pub next_purge_time: Timestamp,
    pub is_active: bool,
}

impl EphemeralPurgeInfo {
    /// Nothing to purge
    #[must_use]
    pub fn inactive(conv_id: ConversationId, min_unexploded_id: MessageId) -> Self {
        Self {
            conv_id,
            min_unexploded_id,
            next_purge_time: 0,
            is_active: false,
        }
    }

    /// Combine with `other`, keeping the tighter bound on each field
    #[must_use]
    pub fn tightened(&self, other: &Self) -> Self {
        match (self.is_active, other.is_active) {
            (false, _) => other.clone(),
            (true, false) => self.clone(),
            (true, true) => Self {
                conv_id: self.conv_id.clone(),
                min_unexploded_id: self.min_unexploded_id.min(other.min_unexploded_id),
                next_purge_time: self.next_purge_time.min(other.next_purge_time),
                is_active: true,
            },
        }
    }
}

type PurgeMap = BTreeMap<ConversationId, EphemeralPurgeInfo>;

fn ephemeral_key(uid: &Uid) -> String {
    format!("ep:{uid}")
}

/// Per-user map of conversation purge schedules
pub struct EphemeralTracker {
    db: EncryptedDb,
    lock: Mutex<()>,
}

impl EphemeralTracker {
    pub fn new(db: EncryptedDb) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    pub fn get_purge_info(&self, conv_id: &ConversationId, uid: &Uid) -> Result<EphemeralPurgeInfo> {
        let _guard = self.lock.lock();
        self.read(uid)?
            .remove(conv_id)
            .ok_or_else(|| StorageError::miss(format!("no purge info for {conv_id}")))
    }

    pub fn get_all_purge_info(&self, uid: &Uid) -> Result<Vec<EphemeralPurgeInfo>> {
        let _guard = self.lock.lock();
        Ok(self.read(uid)?.into_values().collect())
    }

    /// Merge `info` into the stored schedule, never relaxing it
    pub fn maybe_update_purge_info(&self, uid: &Uid, info: &EphemeralPurgeInfo) -> Result<()> {
        if !info.is_active {
            return Ok(());
        }
        let _guard = self.lock.lock();
        let mut all = self.read(uid)?;
        let merged = match all.get(&info.conv_id) {
            Some(current) => current.tightened(info),
            None => info.clone(),
        };
        if all.get(&info.conv_id) == Some(&merged) {
            return Ok(());
        }
        debug!(
            conv = %info.conv_id,
            min_unexploded_id = merged.min_unexploded_id,
            next_purge_time = merged.next_purge_time,
            "updating purge info"
        );
        all.insert(info.conv_id.clone(), merged);
        self.write(uid, &all)
    }

    /// Replace the stored schedule with `info`
    pub fn set_purge_info(&self, uid: &Uid, info: &EphemeralPurgeInfo) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read(uid)?;
        all.insert(info.conv_id.clone(), info.clone());
        self.write(uid, &all)
    }

    /// Stop scheduling purges for `conv_id`
    pub fn inactivate(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read(uid)?;
        let min_unexploded_id = all.get(conv_id).map_or(0, |i| i.min_unexploded_id);
        all.insert(
            conv_id.clone(),
            EphemeralPurgeInfo::inactive(conv_id.clone(), min_unexploded_id),
        );
        self.write(uid, &all)
    }

    pub fn clear(&self, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.delete(&ephemeral_key(uid))
    }

    fn read(&self, uid: &Uid) -> Result<PurgeMap> {
        Ok(self
            .db
            .get(&ephemeral_key(uid), EPHEMERAL_TRACKER_VERSION)?
            .unwrap_or_default())
    }

    fn write(&self, uid: &Uid, all: &PurgeMap) -> Result<()> {
        self.db.put(&ephemeral_key(uid), EPHEMERAL_TRACKER_VERSION, all)
    }
}
