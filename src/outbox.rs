//! Offline-send queue.
//!
//! Outgoing messages wait here, sealed under the outbox subkey, until the
//! sender confirms them. Each record is either still being sent (with an
//! attempt counter) or parked in an error state until the user retries or
//! the purge sweep drops it.
//!
//! ```text
//! push ──► Sending{0} ──record_failed_attempt──► Sending{n+1}
//!              │                                     │
//!              └──────────mark_as_error──────────────┤
//!                                                    ▼
//!           Sending{0} ◄──retry_message── Error{kind, message} ──outbox_purge──► dropped
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::crypto::{KeyProvider, KeyPurpose};
use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::kv::KeyValueStore;
use crate::message::{MessageBody, MessageType};
use crate::types::{ConversationId, OutboxId, Timestamp, Uid};

const OUTBOX_VERSION: u32 = 1;
const OUTBOX_ID_SIZE: usize = 8;

fn outbox_key(uid: &Uid) -> String {
    format!("ob:{uid}")
}

impl OutboxId {
    /// Fresh random id
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; OUTBOX_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes.to_vec())
    }
}

// ============================================================
// RECORDS
// ============================================================

/// Why a send failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxErrorKind {
    Misc,
    Offline,
    Identify,
    TooLong,
    Duplicate,
    Expired,
    AlreadyDeleted,
    UploadFailed,
    RestrictedBot,
    MinWriter,
}

impl OutboxErrorKind {
    /// Failures decided before any send attempt; retrying the same message
    /// will fail the same way
    #[must_use]
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            Self::TooLong | Self::Duplicate | Self::AlreadyDeleted | Self::RestrictedBot | Self::MinWriter
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxError {
    pub kind: OutboxErrorKind,
    pub message: String,
}

impl OutboxError {
    pub fn new(kind: OutboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxState {
    Sending { attempts: u32 },
    Error(OutboxError),
}

impl OutboxState {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// A message the user has sent but the server has not confirmed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: MessageBody,
    /// Set for exploding messages
    pub ephemeral_lifetime_ms: Option<u64>,
}

impl OutgoingMessage {
    #[must_use]
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            ephemeral_lifetime_ms: None,
        }
    }

    #[must_use]
    pub fn ephemeral(body: MessageBody, lifetime_ms: u64) -> Self {
        Self {
            body,
            ephemeral_lifetime_ms: Some(lifetime_ms),
        }
    }

    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.body.message_type()
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_lifetime_ms.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub outbox_id: OutboxId,
    pub conv_id: ConversationId,
    /// Position among the user's queued messages
    pub ordinal: u64,
    pub ctime: Timestamp,
    pub msg: OutgoingMessage,
    pub state: OutboxState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct DiskOutbox {
    records: Vec<OutboxRecord>,
}

impl DiskOutbox {
    fn find_mut(&mut self, outbox_id: &OutboxId) -> Option<&mut OutboxRecord> {
        self.records.iter_mut().find(|r| r.outbox_id == *outbox_id)
    }

    fn next_ordinal(&self) -> u64 {
        self.records.iter().map(|r| r.ordinal).max().map_or(1, |max| max + 1)
    }

    /// Insert a record not yet present, keeping creation order
    fn insert_sorted(&mut self, rec: OutboxRecord) {
        let at = self.records.partition_point(|r| r.ctime <= rec.ctime);
        self.records.insert(at, rec);
    }
}

// ============================================================
// OUTBOX
// ============================================================

/// Per-user send queue
pub struct Outbox {
    db: EncryptedDb,
    uid: Uid,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl Outbox {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<dyn KeyProvider>, uid: Uid, config: StorageConfig) -> Self {
        Self {
            db: EncryptedDb::new(store, keys, KeyPurpose::Outbox),
            uid,
            config,
            clock: Arc::new(SystemClock),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Queue `msg` for sending in `conv_id`
    pub fn push_message(
        &self,
        conv_id: &ConversationId,
        msg: OutgoingMessage,
        outbox_id: Option<OutboxId>,
    ) -> Result<OutboxRecord> {
        self.with_outbox(|obox| {
            let rec = OutboxRecord {
                outbox_id: outbox_id.unwrap_or_else(OutboxId::generate),
                conv_id: conv_id.clone(),
                ordinal: obox.next_ordinal(),
                ctime: self.clock.now_ms(),
                msg,
                state: OutboxState::Sending { attempts: 0 },
            };
            debug!(outbox_id = %rec.outbox_id, conv = %conv_id, ordinal = rec.ordinal, "pushing message");
            obox.records.push(rec.clone());
            Ok((rec, true))
        })
    }

    /// Count a failed send; an unknown record is added
    pub fn record_failed_attempt(&self, rec: &OutboxRecord) -> Result<()> {
        self.with_outbox(|obox| {
            match obox.find_mut(&rec.outbox_id) {
                Some(existing) => bump_attempts(&mut existing.state),
                None => {
                    let mut rec = rec.clone();
                    bump_attempts(&mut rec.state);
                    obox.insert_sorted(rec);
                }
            }
            Ok(((), true))
        })
    }

    /// Park `rec` in the error state; an unknown record is added
    pub fn mark_as_error(&self, rec: &OutboxRecord, err: OutboxError) -> Result<OutboxRecord> {
        debug!(
            outbox_id = %rec.outbox_id,
            kind = ?err.kind,
            immediate = err.kind.is_immediate(),
            "marking as error"
        );
        self.with_outbox(|obox| {
            let marked = match obox.find_mut(&rec.outbox_id) {
                Some(existing) => {
                    existing.state = OutboxState::Error(err);
                    existing.clone()
                }
                None => {
                    let mut rec = rec.clone();
                    rec.state = OutboxState::Error(err);
                    obox.insert_sorted(rec.clone());
                    rec
                }
            };
            Ok((marked, true))
        })
    }

    /// Park every pending record of `conv_id`, returning the ones changed
    pub fn mark_conv_as_error(&self, conv_id: &ConversationId, err: OutboxError) -> Result<Vec<OutboxRecord>> {
        self.with_outbox(|obox| {
            let mut marked = Vec::new();
            for rec in obox.records.iter_mut() {
                if rec.conv_id == *conv_id && !rec.state.is_error() {
                    rec.state = OutboxState::Error(err.clone());
                    marked.push(rec.clone());
                }
            }
            let changed = !marked.is_empty();
            Ok((marked, changed))
        })
    }

    /// Put a record back into the sending state as if newly pushed
    pub fn retry_message(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>> {
        let now = self.clock.now_ms();
        self.with_outbox(|obox| {
            let Some(rec) = obox.find_mut(outbox_id) else {
                return Ok((None, false));
            };
            debug!(%outbox_id, "resetting send state");
            rec.state = OutboxState::Sending { attempts: 0 };
            rec.ctime = now;
            Ok((Some(rec.clone()), true))
        })
    }

    pub fn get_record(&self, outbox_id: &OutboxId) -> Result<OutboxRecord> {
        self.with_outbox(|obox| {
            let rec = obox
                .records
                .iter()
                .find(|r| r.outbox_id == *outbox_id)
                .cloned()
                .ok_or_else(|| StorageError::miss(format!("no outbox record {outbox_id}")))?;
            Ok((rec, false))
        })
    }

    /// Replace the stored record with the same id, reporting whether there was one
    pub fn update_message(&self, rec: &OutboxRecord) -> Result<bool> {
        self.with_outbox(|obox| match obox.find_mut(&rec.outbox_id) {
            Some(existing) => {
                *existing = rec.clone();
                Ok((true, true))
            }
            None => Ok((false, false)),
        })
    }

    /// Drop every record `should_cancel` selects and return how many went
    pub fn cancel_messages_with_predicate<F>(&self, should_cancel: F) -> Result<usize>
    where
        F: Fn(&OutboxRecord) -> bool,
    {
        self.with_outbox(|obox| {
            let before = obox.records.len();
            obox.records.retain(|r| !should_cancel(r));
            let cancelled = before - obox.records.len();
            Ok((cancelled, cancelled > 0))
        })
    }

    pub fn remove_message(&self, outbox_id: &OutboxId) -> Result<Option<OutboxRecord>> {
        self.with_outbox(|obox| {
            let Some(index) = obox.records.iter().position(|r| r.outbox_id == *outbox_id) else {
                return Ok((None, false));
            };
            Ok((Some(obox.records.remove(index)), true))
        })
    }

    /// Every queued record in creation order
    ///
    /// With `remove`, the returned records leave the outbox; errored records
    /// that were filtered out stay behind.
    pub fn pull_all_conversations(&self, include_errors: bool, remove: bool) -> Result<Vec<OutboxRecord>> {
        self.with_outbox(|obox| {
            let wanted = |r: &OutboxRecord| include_errors || !r.state.is_error();
            let mut pulled: Vec<OutboxRecord> = obox.records.iter().filter(|r| wanted(*r)).cloned().collect();
            pulled.sort_by_key(|r| r.ctime);
            if remove {
                obox.records.retain(|r| !wanted(r));
            }
            Ok((pulled, remove))
        })
    }

    pub fn pull_for_conversation(&self, conv_id: &ConversationId) -> Result<Vec<OutboxRecord>> {
        self.with_outbox(|obox| {
            let recs = obox.records.iter().filter(|r| r.conv_id == *conv_id).cloned().collect();
            Ok((recs, false))
        })
    }

    /// Drop errored records that have lingered past their cutoff
    ///
    /// Returns the purged ephemeral records so the caller can tell the user
    /// those messages were never sent.
    pub fn outbox_purge(&self) -> Result<Vec<OutboxRecord>> {
        let now = self.clock.now_ms();
        let limits = *self.config.limits();
        self.with_outbox(|obox| {
            let mut ephemeral_purged = Vec::new();
            let before = obox.records.len();
            obox.records.retain(|rec| {
                if !rec.state.is_error() {
                    return true;
                }
                let age = now.saturating_sub(rec.ctime);
                if rec.msg.is_ephemeral() {
                    if age > limits.outbox_ephemeral_purge_cutoff_ms {
                        debug!(outbox_id = %rec.outbox_id, age, "purging ephemeral errored message");
                        ephemeral_purged.push(rec.clone());
                        return false;
                    }
                } else if age > limits.outbox_error_purge_cutoff_ms {
                    debug!(outbox_id = %rec.outbox_id, age, "purging errored message");
                    return false;
                }
                true
            });
            let changed = obox.records.len() != before;
            Ok((ephemeral_purged, changed))
        })
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.delete(&outbox_key(&self.uid))
    }

    /// Run `op` over the stored outbox under the lock
    ///
    /// `op` returns its result and whether the outbox must be written back.
    /// A missing outbox reads as empty.
    fn with_outbox<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut DiskOutbox) -> Result<(T, bool)>,
    {
        let _guard = self.lock.lock();
        self.with_outbox_locked(op).map_err(|err| self.maybe_nuke(err))
    }

    fn with_outbox_locked<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut DiskOutbox) -> Result<(T, bool)>,
    {
        let key = outbox_key(&self.uid);
        let mut obox: DiskOutbox = self.db.get(&key, OUTBOX_VERSION)?.unwrap_or_default();
        let (res, dirty) = op(&mut obox)?;
        if dirty {
            self.db.put(&key, OUTBOX_VERSION, &obox)?;
        }
        Ok(res)
    }

    fn maybe_nuke(&self, err: StorageError) -> StorageError {
        if err.should_clear() {
            warn!(uid = %self.uid, error = %err, "outbox unusable: clearing");
            if let Err(del) = self.db.delete(&outbox_key(&self.uid)) {
                warn!(uid = %self.uid, error = %del, "failed to clear outbox");
            }
        }
        err
    }
}

fn bump_attempts(state: &mut OutboxState) {
    if let OutboxState::Sending { attempts } = state {
        *attempts += 1;
    }
}
