use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::types::{ConversationId, MessageId, Uid};

const DELH_TRACKER_VERSION: u32 = 1;

/// Delete-history progress for one conversation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelhTrackerEntry {
    /// Highest delete-history `upto` seen; never decreases
    pub max_delete_history_upto: MessageId,
    /// Oldest local message a delete-history could still remove
    pub min_deletable_message: MessageId,
}

fn delh_key(uid: &Uid, conv_id: &ConversationId) -> String {
    format!("dh:{uid}:{conv_id}")
}

pub struct DelhTracker {
    db: EncryptedDb,
    lock: Mutex<()>,
}

impl DelhTracker {
    pub fn new(db: EncryptedDb) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    pub fn get_entry(&self, conv_id: &ConversationId, uid: &Uid) -> Result<DelhTrackerEntry> {
        let _guard = self.lock.lock();
        self.read(conv_id, uid)?
            .ok_or_else(|| StorageError::miss(format!("no delete-history entry for {conv_id}")))
    }

    pub fn set_min_deletable_message(&self, conv_id: &ConversationId, uid: &Uid, msg_id: MessageId) -> Result<()> {
        self.update(conv_id, uid, |entry| entry.min_deletable_message = msg_id)
    }

    /// Record a delete-history without it having been applied locally
    pub fn set_max_delete_history_upto(&self, conv_id: &ConversationId, uid: &Uid, upto: MessageId) -> Result<()> {
        self.update(conv_id, uid, |entry| {
            entry.max_delete_history_upto = entry.max_delete_history_upto.max(upto);
        })
    }

    /// Record a delete-history that has been applied locally
    ///
    /// Nothing below `upto` is deletable any more. This is the one writer
    /// that may raise `min_deletable_message`; the batch bookkeeping pass
    /// only ever lowers it.
    pub fn set_deleted_upto(&self, conv_id: &ConversationId, uid: &Uid, upto: MessageId) -> Result<()> {
        self.update(conv_id, uid, |entry| {
            entry.max_delete_history_upto = entry.max_delete_history_upto.max(upto);
            entry.min_deletable_message = upto;
        })
    }

    pub fn clear(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.delete(&delh_key(uid, conv_id))
    }

    fn update(&self, conv_id: &ConversationId, uid: &Uid, f: impl FnOnce(&mut DelhTrackerEntry)) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entry = self.read(conv_id, uid)?.unwrap_or_default();
        f(&mut entry);
        self.db.put(&delh_key(uid, conv_id), DELH_TRACKER_VERSION, &entry)
    }

    fn read(&self, conv_id: &ConversationId, uid: &Uid) -> Result<Option<DelhTrackerEntry>> {
        self.db.get(&delh_key(uid, conv_id), DELH_TRACKER_VERSION)
    }
}
