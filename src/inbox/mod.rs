//! Versioned conversation-list cache.
//!
//! One sealed record per user holds every cached conversation, the inbox
//! version and the hashes of the queries that populated it. Updates from
//! the server carry a version and are applied only if they are the direct
//! successor of the stored one; a gap clears the record so the caller
//! refetches from the server.
//!
//! ```text
//! server update (vers)
//!     ↓ handle_version
//!     ├── 0            → self update, apply as stored + 1
//!     ├── <= stored    → stale, ignore
//!     ├── stored + 1   → apply, touched conversation moves to the front
//!     └── otherwise    → VersionMismatch, record deleted
//! ```

mod query;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use query::{apply_query, InboxQuery};
use query::hash_query;

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::conversation::{Conversation, ConversationStatus, Expunge, MessageSummary, RemoteConversation};
use crate::crypto::{KeyProvider, KeyPurpose};
use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::kv::KeyValueStore;
use crate::message::MessageType;
use crate::types::{ConversationId, InboxVersion, MessageId, Uid};

const INBOX_VERSION: u32 = 1;

fn inbox_key(uid: &Uid) -> String {
    format!("ib:{uid}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct InboxDiskData {
    inbox_version: InboxVersion,
    conversations: Vec<RemoteConversation>,
    /// Hashes of merged queries; the empty hash is the unfiltered query
    queries: Vec<Vec<u8>>,
}

impl InboxDiskData {
    fn position(&self, conv_id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|rc| rc.id() == conv_id)
    }

    /// Move the conversation at `index` to the front and return it
    fn promote(&mut self, index: usize) -> &mut RemoteConversation {
        let rc = self.conversations.remove(index);
        self.conversations.insert(0, rc);
        &mut self.conversations[0]
    }
}

/// Expunge observed while syncing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncExpunge {
    pub conv_id: ConversationId,
    pub expunge: Expunge,
}

/// What changed underneath the client during a sync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboxSyncResult {
    pub members_type_changed: Vec<ConversationId>,
    pub expunges: Vec<SyncExpunge>,
    pub topic_name_changed: Vec<ConversationId>,
    /// The synced conversations, in the order given
    pub filtered_convs: Vec<RemoteConversation>,
}

/// Per-user conversation list cache
pub struct Inbox {
    db: EncryptedDb,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl Inbox {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            db: EncryptedDb::new(store, keys, KeyPurpose::Inbox),
            clock: Arc::new(SystemClock),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ============================================================
    // READS
    // ============================================================

    /// Conversations matching `query`, if that query has been cached
    pub fn read(
        &self,
        cancel: &CancelToken,
        uid: &Uid,
        query: Option<&InboxQuery>,
    ) -> Result<(InboxVersion, Vec<RemoteConversation>)> {
        cancel.check()?;
        let _guard = self.lock.lock();
        self.read_locked(uid, query).map_err(|err| self.maybe_nuke(err, uid))
    }

    fn read_locked(&self, uid: &Uid, query: Option<&InboxQuery>) -> Result<(InboxVersion, Vec<RemoteConversation>)> {
        let ibox = self.read_disk(uid)?;
        if !self.query_exists(&ibox, query)? {
            debug!(%uid, "inbox read: query unknown");
            return Err(StorageError::miss("inbox query not cached"));
        }
        debug!(%uid, version = ibox.inbox_version, "inbox read: hit");
        Ok((ibox.inbox_version, apply_query(query, &ibox.conversations)))
    }

    /// Every cached conversation, unfiltered
    pub fn read_all(&self, cancel: &CancelToken, uid: &Uid) -> Result<(InboxVersion, Vec<RemoteConversation>)> {
        cancel.check()?;
        let _guard = self.lock.lock();
        let ibox = self.read_disk(uid).map_err(|err| self.maybe_nuke(err, uid))?;
        Ok((ibox.inbox_version, ibox.conversations))
    }

    pub fn get_conversation(
        &self,
        cancel: &CancelToken,
        uid: &Uid,
        conv_id: &ConversationId,
    ) -> Result<RemoteConversation> {
        let query = InboxQuery::by_conv_ids([conv_id.clone()]);
        let (_, mut convs) = self.read(cancel, uid, Some(&query))?;
        if convs.len() != 1 {
            return Err(StorageError::miss(format!("conversation {conv_id} not cached")));
        }
        Ok(convs.remove(0))
    }

    /// Stored inbox version, or 0 if nothing is cached
    pub fn version(&self, uid: &Uid) -> Result<InboxVersion> {
        let _guard = self.lock.lock();
        match self.read_disk(uid) {
            Ok(ibox) => Ok(ibox.inbox_version),
            Err(err) if err.is_miss() => Ok(0),
            Err(err) => Err(self.maybe_nuke(err, uid)),
        }
    }

    fn query_exists(&self, ibox: &InboxDiskData, query: Option<&InboxQuery>) -> Result<bool> {
        if let Some(q) = query {
            if !q.conv_ids.is_empty() {
                let known: HashSet<&ConversationId> = ibox.conversations.iter().map(RemoteConversation::id).collect();
                return Ok(q.conv_ids.iter().all(|id| known.contains(id)));
            }
            if q.is_single_name_query() && ibox.conversations.iter().any(|rc| q.matches(rc)) {
                debug!("inbox read: single name query hit");
                return Ok(true);
            }
            if q.allow_unseen {
                return Ok(true);
            }
        }
        let hash = hash_query(query)?;
        Ok(ibox.queries.contains(&hash))
    }

    // ============================================================
    // WHOLESALE WRITES
    // ============================================================

    /// Merge a server snapshot into the cache and remember `query`
    ///
    /// A cached conversation is replaced only by a newer version of itself.
    pub fn merge(
        &self,
        uid: &Uid,
        vers: InboxVersion,
        convs: &[Conversation],
        query: Option<&InboxQuery>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        debug!(%uid, vers, num_convs = convs.len(), "inbox merge");
        self.merge_locked(uid, vers, convs, query)
            .map_err(|err| self.maybe_nuke(err, uid))
    }

    fn merge_locked(
        &self,
        uid: &Uid,
        vers: InboxVersion,
        convs: &[Conversation],
        query: Option<&InboxQuery>,
    ) -> Result<()> {
        let mut ibox = match self.read_disk(uid) {
            Ok(ibox) => ibox,
            Err(err) if err.is_miss() => InboxDiskData::default(),
            Err(err) => return Err(err),
        };
        let hash = hash_query(query)?;

        if ibox.inbox_version == 0 {
            debug!(%uid, vers, "inbox merge: using given version");
            ibox.inbox_version = vers;
        }
        for conv in convs {
            match ibox.position(conv.id()) {
                Some(index) => {
                    let cached = &mut ibox.conversations[index];
                    if cached.version() < conv.version() {
                        cached.conv = conv.clone();
                    }
                }
                None => ibox.conversations.push(conv.clone().into()),
            }
        }
        if !ibox.queries.contains(&hash) {
            ibox.queries.push(hash);
        }
        self.write_disk(uid, &ibox)
    }

    /// Replace the cached copies of `convs` and report what changed
    pub fn sync(&self, uid: &Uid, vers: InboxVersion, convs: &[Conversation]) -> Result<InboxSyncResult> {
        let _guard = self.lock.lock();
        self.sync_locked(uid, vers, convs)
            .map_err(|err| self.maybe_nuke(err, uid))
    }

    fn sync_locked(&self, uid: &Uid, vers: InboxVersion, convs: &[Conversation]) -> Result<InboxSyncResult> {
        let mut ibox = self.read_disk(uid)?;
        let old_vers = ibox.inbox_version;
        ibox.inbox_version = vers;

        let mut res = InboxSyncResult::default();
        let mut added = Vec::new();
        for conv in convs {
            let Some(index) = ibox.position(conv.id()) else {
                added.push(RemoteConversation::from(conv.clone()));
                continue;
            };
            let cached = &mut ibox.conversations[index];
            let old = &cached.conv;
            if old.metadata.members_type != conv.metadata.members_type {
                res.members_type_changed.push(conv.id().clone());
            }
            if old.expunge != conv.expunge {
                res.expunges.push(SyncExpunge {
                    conv_id: conv.id().clone(),
                    expunge: conv.expunge,
                });
            }
            if topic_name_changed(old, conv) {
                res.topic_name_changed.push(conv.id().clone());
            }
            cached.conv = conv.clone();
        }
        debug!(%uid, old_vers, vers, added = added.len(), "inbox sync");
        ibox.conversations.extend(added);
        self.write_disk(uid, &ibox)?;

        let synced: Vec<RemoteConversation> = convs.iter().cloned().map(RemoteConversation::from).collect();
        let query = InboxQuery::by_conv_ids(convs.iter().map(|c| c.id().clone()));
        res.filtered_convs = apply_query(Some(&query), &synced);
        Ok(res)
    }

    pub fn clear(&self, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        debug!(%uid, "clearing inbox");
        self.db.delete(&inbox_key(uid))
    }

    // ============================================================
    // VERSIONED UPDATES
    // ============================================================

    pub fn update_inbox_version(&self, uid: &Uid, vers: InboxVersion) -> Result<()> {
        self.update(uid, vers, "update inbox version", |_, _| Ok(()))
    }

    /// Record a newly created conversation
    pub fn new_conversation(&self, uid: &Uid, vers: InboxVersion, conv: &Conversation) -> Result<()> {
        self.update(uid, vers, "new conversation", |ibox, vers| {
            if ibox.position(conv.id()).is_some() {
                debug!(conv = %conv.id(), "new conversation: already known");
                return Ok(());
            }
            for rc in &mut ibox.conversations {
                let meta = &mut rc.conv.metadata;
                if meta.finalized && conv.metadata.supersedes.contains(&meta.conv_id) {
                    debug!(target = %meta.conv_id, superseder = %conv.id(), "setting superseded by");
                    meta.superseded_by.push(conv.id().clone());
                    meta.version = vers;
                }
            }
            ibox.conversations.insert(0, conv.clone().into());
            Ok(())
        })
    }

    /// Record a new message in `conv_id`
    ///
    /// `max_msgs` are the per-type summaries from the server, if it sent any.
    pub fn new_message(
        &self,
        uid: &Uid,
        vers: InboxVersion,
        conv_id: &ConversationId,
        msg: &MessageSummary,
        max_msgs: &[MessageSummary],
    ) -> Result<()> {
        let now = self.clock.now_ms();
        self.update(uid, vers, "new message", |ibox, new_vers| {
            let Some(index) = ibox.position(conv_id) else {
                debug!(conv = %conv_id, "new message: conversation not cached");
                return Ok(());
            };
            let current = ibox.inbox_version;
            let conv = &mut ibox.promote(index).conv;

            if max_msgs.is_empty() {
                // Summaries after a remote delete are not derivable locally
                if vers > 0 && matches!(msg.msg_type, MessageType::Delete | MessageType::DeleteHistory) {
                    debug!(conv = %conv_id, vers, "new message: delete without summaries");
                    return Err(StorageError::VersionMismatch { current, update: new_vers });
                }
                match conv.max_msg_summaries.iter_mut().find(|s| s.msg_type == msg.msg_type) {
                    Some(summary) => *summary = msg.clone(),
                    None => conv.max_msg_summaries.push(msg.clone()),
                }
            } else {
                conv.max_msg_summaries = max_msgs.to_vec();
            }

            let from_us = msg.sender == *uid;
            let reader = &mut conv.reader_info;
            if from_us && reader.read_msg_id == reader.max_msg_id {
                reader.read_msg_id = msg.msg_id;
                reader.last_send_time = msg.ctime;
            }
            reader.max_msg_id = msg.msg_id;
            reader.mtime = now;

            let meta = &mut conv.metadata;
            promote_writer(&mut meta.active_list, &msg.sender);
            if from_us && meta.status.sending_removes_status() {
                meta.status = ConversationStatus::Unfiled;
            }
            if meta.status.activity_removes_status() {
                meta.status = ConversationStatus::Unfiled;
            }
            meta.version = new_vers;
            Ok(())
        })
    }

    /// Advance the read marker of `conv_id` to `msg_id`
    pub fn read_message(&self, uid: &Uid, vers: InboxVersion, conv_id: &ConversationId, msg_id: MessageId) -> Result<()> {
        let now = self.clock.now_ms();
        self.update(uid, vers, "read message", |ibox, vers| {
            let Some(index) = ibox.position(conv_id) else {
                debug!(conv = %conv_id, "read message: conversation not cached");
                return Ok(());
            };
            let conv = &mut ibox.promote(index).conv;
            if conv.reader_info.read_msg_id < msg_id {
                debug!(conv = %conv_id, read_msg_id = conv.reader_info.read_msg_id, msg_id, "advancing read marker");
                conv.reader_info.read_msg_id = msg_id;
                conv.reader_info.mtime = now;
            }
            conv.metadata.version = vers;
            Ok(())
        })
    }

    pub fn set_status(
        &self,
        uid: &Uid,
        vers: InboxVersion,
        conv_id: &ConversationId,
        status: ConversationStatus,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        self.update(uid, vers, "set status", |ibox, vers| {
            let Some(index) = ibox.position(conv_id) else {
                debug!(conv = %conv_id, "set status: conversation not cached");
                return Ok(());
            };
            let conv = &mut ibox.promote(index).conv;
            conv.reader_info.mtime = now;
            conv.metadata.status = status;
            conv.metadata.version = vers;
            Ok(())
        })
    }

    /// Record an expunge; the server must send fresh summaries along with it
    pub fn expunge(
        &self,
        uid: &Uid,
        vers: InboxVersion,
        conv_id: &ConversationId,
        expunge: Expunge,
        max_msgs: &[MessageSummary],
    ) -> Result<()> {
        self.update(uid, vers, "expunge", |ibox, new_vers| {
            let current = ibox.inbox_version;
            let Some(index) = ibox.position(conv_id) else {
                debug!(conv = %conv_id, "expunge: conversation not cached");
                return Ok(());
            };
            let conv = &mut ibox.conversations[index].conv;
            conv.expunge = expunge;
            conv.metadata.version = new_vers;
            if max_msgs.is_empty() {
                debug!(conv = %conv_id, "expunge: missing summaries");
                return Err(StorageError::VersionMismatch { current, update: new_vers });
            }
            conv.max_msg_summaries = max_msgs.to_vec();
            Ok(())
        })
    }

    /// Read, version-check, mutate and write back the inbox
    ///
    /// A missing inbox makes the update a no-op.
    fn update<F>(&self, uid: &Uid, vers: InboxVersion, op: &'static str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut InboxDiskData, InboxVersion) -> Result<()>,
    {
        let _guard = self.lock.lock();
        debug!(%uid, vers, op, "inbox update");
        self.update_locked(uid, vers, apply)
            .map_err(|err| self.maybe_nuke(err, uid))
    }

    fn update_locked<F>(&self, uid: &Uid, vers: InboxVersion, apply: F) -> Result<()>
    where
        F: FnOnce(&mut InboxDiskData, InboxVersion) -> Result<()>,
    {
        let mut ibox = match self.read_disk(uid) {
            Ok(ibox) => ibox,
            Err(err) if err.is_miss() => return Ok(()),
            Err(err) => return Err(err),
        };
        let Some(vers) = handle_version(ibox.inbox_version, vers)? else {
            return Ok(());
        };
        apply(&mut ibox, vers)?;
        ibox.inbox_version = vers;
        self.write_disk(uid, &ibox)
    }

    // ============================================================
    // LOCAL-ONLY UPDATES
    // ============================================================

    /// Bump the local version of `conv_id` after an unconfirmed local change
    pub fn increment_local_conv_version(&self, uid: &Uid, conv_id: &ConversationId) -> Result<()> {
        self.update_local(uid, conv_id, |rc| {
            rc.conv.metadata.local_version += 1;
            true
        })
        .map(|_| ())
    }

    pub fn mark_local_read(&self, uid: &Uid, conv_id: &ConversationId, msg_id: MessageId) -> Result<()> {
        self.update_local(uid, conv_id, |rc| {
            rc.local_read_msg_id = msg_id;
            true
        })
        .map(|_| ())
    }

    /// Set or clear the draft of `conv_id`, returning whether anything changed
    pub fn draft(&self, uid: &Uid, conv_id: &ConversationId, text: Option<String>) -> Result<bool> {
        self.update_local(uid, conv_id, |rc| {
            if text.is_none() && rc.local_draft.is_none() {
                return false;
            }
            rc.local_draft = text;
            rc.conv.metadata.local_version += 1;
            true
        })
    }

    fn update_local<F>(&self, uid: &Uid, conv_id: &ConversationId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut RemoteConversation) -> bool,
    {
        let _guard = self.lock.lock();
        self.update_local_locked(uid, conv_id, apply)
            .map_err(|err| self.maybe_nuke(err, uid))
    }

    fn update_local_locked<F>(&self, uid: &Uid, conv_id: &ConversationId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut RemoteConversation) -> bool,
    {
        let mut ibox = match self.read_disk(uid) {
            Ok(ibox) => ibox,
            Err(err) if err.is_miss() => return Ok(false),
            Err(err) => return Err(err),
        };
        let Some(index) = ibox.position(conv_id) else {
            debug!(conv = %conv_id, "local update: conversation not cached");
            return Ok(false);
        };
        if !apply(&mut ibox.conversations[index]) {
            return Ok(false);
        }
        self.write_disk(uid, &ibox)?;
        Ok(true)
    }

    // ============================================================
    // DISK
    // ============================================================

    fn read_disk(&self, uid: &Uid) -> Result<InboxDiskData> {
        self.db
            .get(&inbox_key(uid), INBOX_VERSION)?
            .ok_or_else(|| StorageError::miss("no inbox cached"))
    }

    fn write_disk(&self, uid: &Uid, ibox: &InboxDiskData) -> Result<()> {
        self.db.put(&inbox_key(uid), INBOX_VERSION, ibox)
    }

    fn maybe_nuke(&self, err: StorageError, uid: &Uid) -> StorageError {
        if err.should_clear() {
            warn!(%uid, error = %err, "inbox unusable: clearing");
            if let Err(del) = self.db.delete(&inbox_key(uid)) {
                warn!(%uid, error = %del, "failed to clear inbox");
            }
        }
        err
    }
}

/// Decide how an update tagged `update` applies to an inbox at `ours`
///
/// Returns the version to store, or `None` for a stale update.
fn handle_version(ours: InboxVersion, update: InboxVersion) -> Result<Option<InboxVersion>> {
    if update == 0 {
        debug!(ours, "self update");
        return Ok(Some(ours + 1));
    }
    if ours >= update {
        debug!(ours, update, "stale update");
        return Ok(None);
    }
    if update == ours + 1 {
        return Ok(Some(update));
    }
    debug!(ours, update, "non-incremental update");
    Err(StorageError::VersionMismatch { current: ours, update })
}

/// Move `sender` to the front of the active writer list
fn promote_writer(writers: &mut Vec<Uid>, sender: &Uid) {
    writers.retain(|w| w != sender);
    writers.insert(0, sender.clone());
}

/// Whether the newest metadata message differs between `old` and `new`
fn topic_name_changed(old: &Conversation, new: &Conversation) -> bool {
    match (old.max_message(MessageType::Metadata), new.max_message(MessageType::Metadata)) {
        (None, None) => false,
        (Some(a), Some(b)) => a.msg_id != b.msg_id,
        _ => true,
    }
}
