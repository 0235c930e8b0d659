use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::types::{ConversationId, MessageId, Uid};

const MSGID_TRACKER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MaxMsgId {
    max_msg_id: MessageId,
}

fn msgid_key(uid: &Uid, conv_id: &ConversationId) -> String {
    format!("mi:{uid}:{conv_id}")
}

/// Highest message id stored per conversation
pub struct MsgIdTracker {
    db: EncryptedDb,
    lock: Mutex<()>,
}

impl MsgIdTracker {
    pub fn new(db: EncryptedDb) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    /// Stored maximum, or a miss if nothing has been recorded
    pub fn get(&self, conv_id: &ConversationId, uid: &Uid) -> Result<MessageId> {
        let _guard = self.lock.lock();
        self.read(conv_id, uid)?
            .ok_or_else(|| StorageError::miss(format!("no max msgid for {conv_id}")))
    }

    /// Raise the stored maximum to `msg_id`; lower values are ignored
    pub fn bump(&self, conv_id: &ConversationId, uid: &Uid, msg_id: MessageId) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(current) = self.read(conv_id, uid)? {
            if current >= msg_id {
                return Ok(());
            }
        }
        debug!(conv = %conv_id, msg_id, "bumping max msgid");
        self.db.put(
            &msgid_key(uid, conv_id),
            MSGID_TRACKER_VERSION,
            &MaxMsgId { max_msg_id: msg_id },
        )
    }

    pub fn clear(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.delete(&msgid_key(uid, conv_id))
    }

    fn read(&self, conv_id: &ConversationId, uid: &Uid) -> Result<Option<MessageId>> {
        let record: Option<MaxMsgId> = self.db.get(&msgid_key(uid, conv_id), MSGID_TRACKER_VERSION)?;
        Ok(record.map(|r| r.max_msg_id))
    }
}
