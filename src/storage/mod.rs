//! Storage orchestrator: the single entry point for message history.
//!
//! Sequences the block engine and the trackers under one lock and keeps
//! the cross-cutting invariants no single component can:
//! - supersede pointers (edits, deletes, reactions)
//! - delete-history application
//! - ephemeral explosion
//!
//! # Failure handling
//!
//! Every internal error is classified before it leaves this module. If the
//! error says the cache cannot be trusted (`should_clear`), the
//! conversation's block index, its max-msgid and delete-history entries and
//! the user's ephemeral schedule are dropped so the next call starts from
//! empty state. The ephemeral and identify-break lookups clear their own
//! record the same way.

mod delete_history;
mod ephemeral;
mod supersede;

pub use ephemeral::EphemeralPurgeResult;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::block_engine::{BlockEngine, BlockSession};
use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::collector::ResultCollector;
use crate::config::StorageConfig;
use crate::conversation::{Conversation, Expunge};
use crate::crypto::{KeyProvider, KeyPurpose, SecretKey};
use crate::encrypted_db::EncryptedDb;
use crate::error::{Result, StorageError};
use crate::kv::KeyValueStore;
use crate::message::{MessageRecord, MessageType};
use crate::pager::{decode_index, make_page, Pagination};
use crate::trackers::{
    BreakTracker, DelhTracker, EphemeralPurgeInfo, EphemeralTracker, IdentifyFailure, MsgIdTracker,
};
use crate::types::{ConversationId, MessageId, TlfId, Uid};

// ============================================================
// RESULT TYPES
// ============================================================

/// Thread query options that affect the scan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadQuery {
    /// Count only these types towards the page size
    pub message_types: Vec<MessageType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// Delete-history applied by this merge
    pub expunged: Option<Expunge>,
    /// Ephemeral messages whose bodies were blanked
    pub exploded: Vec<MessageRecord>,
    /// Messages whose reaction lists changed
    pub reaction_targets: Vec<MessageRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadView {
    pub messages: Vec<MessageRecord>,
    pub pagination: Pagination,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub thread: ThreadView,
    pub exploded: Vec<MessageRecord>,
}

/// Optional knobs for a fetch
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Overrides the collector derived from `query` and `pagination`
    pub collector: Option<ResultCollector>,
    pub query: Option<ThreadQuery>,
    pub pagination: Option<Pagination>,
}

// ============================================================
// STORAGE
// ============================================================

pub struct Storage {
    engine: BlockEngine,
    keys: Arc<dyn KeyProvider>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    msgid: MsgIdTracker,
    delh: DelhTracker,
    ephemeral: EphemeralTracker,
    breaks: BreakTracker,
    lock: Mutex<()>,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<dyn KeyProvider>, config: StorageConfig) -> Self {
        let trackers = EncryptedDb::new(store.clone(), keys.clone(), KeyPurpose::Trackers);
        Self {
            engine: BlockEngine::new(store),
            keys,
            config,
            clock: Arc::new(SystemClock),
            msgid: MsgIdTracker::new(trackers.clone()),
            delh: DelhTracker::new(trackers.clone()),
            ephemeral: EphemeralTracker::new(trackers.clone()),
            breaks: BreakTracker::new(trackers),
            lock: Mutex::new(()),
        }
    }

    /// Replace the clock used for ephemeral expiry
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // ============================================================
    // MERGE
    // ============================================================

    /// Merge `msgs`, sorted by descending id, into the cache
    pub fn merge(&self, conv_id: &ConversationId, uid: &Uid, msgs: &[MessageRecord]) -> Result<MergeResult> {
        self.merge_helper(conv_id, uid, msgs, None)
    }

    /// Apply an expunge with no new messages
    pub fn expunge(&self, conv_id: &ConversationId, uid: &Uid, expunge: Expunge) -> Result<MergeResult> {
        self.merge_helper(conv_id, uid, &[], Some(expunge))
    }

    fn merge_helper(
        &self,
        conv_id: &ConversationId,
        uid: &Uid,
        msgs: &[MessageRecord],
        expunge: Option<Expunge>,
    ) -> Result<MergeResult> {
        let _guard = self.lock.lock();
        debug!(conv = %conv_id, num_msgs = msgs.len(), "merge");

        let key = self.secret_key()?;
        let session = self
            .engine
            .init(&key, conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;
        self.merge_locked(&session, msgs, expunge)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))
    }

    fn merge_locked(
        &self,
        session: &BlockSession,
        msgs: &[MessageRecord],
        expunge: Option<Expunge>,
    ) -> Result<MergeResult> {
        let (conv_id, uid) = (session.conv_id(), session.uid());
        let mut res = MergeResult::default();

        self.engine.write_messages(session, msgs)?;
        res.reaction_targets = self.update_all_superseded_by(session, msgs)?;
        self.update_min_deletable_message(conv_id, uid, msgs)?;
        res.expunged = self.handle_delete_history(session, msgs, expunge)?;

        let mut batch = msgs.to_vec();
        let (exploded, purge_info) = self.explode_expired(session, &mut batch)?;
        self.ephemeral.maybe_update_purge_info(uid, &purge_info)?;
        res.exploded = exploded;

        if let Some(first) = msgs.first() {
            self.msgid.bump(conv_id, uid, first.id())?;
        }
        Ok(res)
    }

    // ============================================================
    // FETCH
    // ============================================================

    /// Page backward through `conv` starting at its known max id
    pub fn fetch(
        &self,
        cancel: &CancelToken,
        conv: &Conversation,
        uid: &Uid,
        opts: FetchOptions,
    ) -> Result<FetchResult> {
        let _guard = self.lock.lock();
        self.fetch_up_to_msg_id_locked(cancel, conv.id(), uid, conv.max_msg_id(), opts)
    }

    /// Like `fetch`, starting from the larger of the local max and `inbox_max_msg_id`
    pub fn fetch_up_to_local_max_msg_id(
        &self,
        cancel: &CancelToken,
        conv_id: &ConversationId,
        uid: &Uid,
        inbox_max_msg_id: MessageId,
        opts: FetchOptions,
    ) -> Result<FetchResult> {
        let _guard = self.lock.lock();
        cancel.check()?;
        let mut max_msg_id = self.msgid.get(conv_id, uid)?;
        if inbox_max_msg_id > max_msg_id {
            debug!(conv = %conv_id, inbox_max_msg_id, "overriding local max msgid with inbox");
            max_msg_id = inbox_max_msg_id;
        }
        self.fetch_up_to_msg_id_locked(cancel, conv_id, uid, max_msg_id, opts)
    }

    fn fetch_up_to_msg_id_locked(
        &self,
        cancel: &CancelToken,
        conv_id: &ConversationId,
        uid: &Uid,
        msg_id: MessageId,
        opts: FetchOptions,
    ) -> Result<FetchResult> {
        cancel.check()?;
        let key = self.secret_key()?;
        let session = self
            .engine
            .init(&key, conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;
        self.fetch_locked(&session, msg_id, opts)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))
    }

    fn fetch_locked(&self, session: &BlockSession, msg_id: MessageId, opts: FetchOptions) -> Result<FetchResult> {
        let (conv_id, uid) = (session.conv_id(), session.uid());
        let pagination = opts.pagination.as_ref();

        // Seek bounds; min_id is exclusive
        let (max_id, min_id, num) = match pagination {
            None => (msg_id, 0, self.config.max_fetch_num()),
            Some(p) => {
                let num = p.num;
                if let Some(next) = p.next.as_deref().filter(|c| !c.is_empty()) {
                    let pid = decode_index(next)?;
                    debug!(conv = %conv_id, pid, "fetch: next page");
                    (pid.saturating_sub(1), 0, num)
                } else if let Some(previous) = p.previous.as_deref().filter(|c| !c.is_empty()) {
                    let pid = decode_index(previous)?;
                    debug!(conv = %conv_id, pid, "fetch: previous page");
                    let max_id = pid.saturating_add(num as MessageId).min(msg_id.max(pid));
                    (max_id, pid, num)
                } else {
                    (msg_id, 0, num)
                }
            }
        };

        let mut rc = opts
            .collector
            .unwrap_or_else(|| self.result_collector_from_query(opts.query.as_ref(), pagination));
        debug!(conv = %conv_id, max_id, min_id, num, collector = %rc, "fetch: seeking");
        self.engine.read_messages(session, &mut rc, max_id, min_id)?;
        let mut msgs = rc.into_results();

        // Blank anything that exploded since it was stored
        let (exploded, purge_info) = self.explode_expired(session, &mut msgs)?;
        self.ephemeral.maybe_update_purge_info(uid, &purge_info)?;

        let max_deleted_upto = match self.delh.get_entry(conv_id, uid) {
            Ok(entry) => entry.max_delete_history_upto,
            Err(err) if err.is_miss() => 0,
            Err(err) => return Err(err),
        };
        let pagination = make_page(&msgs, num, max_deleted_upto)?;
        debug!(conv = %conv_id, num = msgs.len(), max_deleted_upto, "fetch: cache hit");

        Ok(FetchResult {
            thread: ThreadView {
                messages: msgs,
                pagination,
            },
            exploded,
        })
    }

    /// Fetch each of `ids`; ids not cached come back as `None`
    pub fn fetch_messages(
        &self,
        cancel: &CancelToken,
        conv_id: &ConversationId,
        uid: &Uid,
        ids: &[MessageId],
    ) -> Result<Vec<Option<MessageRecord>>> {
        let _guard = self.lock.lock();
        cancel.check()?;
        let key = self.secret_key()?;
        let session = self
            .engine
            .init(&key, conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;

        let mut res = Vec::with_capacity(ids.len());
        for &id in ids {
            let msg = self
                .get_message(&session, id)
                .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;
            // An error record this client can now parse is as good as missing
            let msg = msg.filter(|m| !matches!(m, MessageRecord::Error { parseable: true, .. }));
            res.push(msg);
        }
        Ok(res)
    }

    /// First visible, non-deleted message after `read_msg_id`
    pub fn fetch_unreadline_id(
        &self,
        cancel: &CancelToken,
        conv_id: &ConversationId,
        uid: &Uid,
        read_msg_id: MessageId,
    ) -> Result<Option<MessageId>> {
        let _guard = self.lock.lock();
        cancel.check()?;
        let key = self.secret_key()?;
        let session = self
            .engine
            .init(&key, conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;

        let limit = self.config.limits().unreadline_scan_limit;
        for id in read_msg_id + 1..read_msg_id + 1 + limit {
            let msg = self
                .get_message(&session, id)
                .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;
            let Some(msg) = msg else {
                return Ok(None);
            };
            if msg.is_valid_full() && msg.msg_type().is_visible() {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Build the collector a fetch uses when the caller supplies none
    pub fn result_collector_from_query(
        &self,
        query: Option<&ThreadQuery>,
        pagination: Option<&Pagination>,
    ) -> ResultCollector {
        let num = pagination.map_or(self.config.max_fetch_num(), |p| p.num);
        let rc = match query.filter(|q| !q.message_types.is_empty()) {
            Some(q) => ResultCollector::typed(num, q.message_types.iter().copied()),
            None => ResultCollector::simple(num),
        };
        rc.with_max_scan(self.config.max_fetch_num())
    }

    // ============================================================
    // MAX MSGID / CLEARING
    // ============================================================

    pub fn set_max_msg_id(&self, conv_id: &ConversationId, uid: &Uid, msg_id: MessageId) -> Result<()> {
        let _guard = self.lock.lock();
        self.msgid.bump(conv_id, uid, msg_id)
    }

    pub fn get_max_msg_id(&self, conv_id: &ConversationId, uid: &Uid) -> Result<MessageId> {
        let _guard = self.lock.lock();
        self.msgid
            .get(conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))
    }

    /// Drop everything cached for the conversation
    pub fn nuke(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        self.nuke_locked(conv_id, uid);
        Ok(())
    }

    /// Empty the slots of every message before `upto`
    pub fn clear_before(&self, conv_id: &ConversationId, uid: &Uid, upto: MessageId) -> Result<()> {
        let _guard = self.lock.lock();
        if upto == 0 {
            return Ok(());
        }
        self.clear_upthrough(conv_id, uid, upto - 1)
    }

    /// Empty the slots of every message up to the known max
    pub fn clear_all(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        let _guard = self.lock.lock();
        let max_msg_id = self.msgid.get(conv_id, uid)?;
        self.clear_upthrough(conv_id, uid, max_msg_id)
    }

    fn clear_upthrough(&self, conv_id: &ConversationId, uid: &Uid, upthrough: MessageId) -> Result<()> {
        debug!(conv = %conv_id, upthrough, "clearing messages");
        let key = self.secret_key()?;
        let session = self.engine.init(&key, conv_id, uid)?;
        let ids: Vec<MessageId> = (1..=upthrough).rev().collect();
        self.engine.clear_messages(&session, &ids)
    }

    // ============================================================
    // IDENTIFY BREAKS
    // ============================================================

    pub fn update_tlf_identify_break(&self, tlf_id: &TlfId, failures: Vec<IdentifyFailure>) -> Result<()> {
        self.breaks.update_tlf(tlf_id, failures)
    }

    /// Whether the folder has identify failures; unreadable state counts as broken
    pub fn is_tlf_identify_broken(&self, tlf_id: &TlfId) -> bool {
        match self.breaks.is_tlf_broken(tlf_id) {
            Ok(broken) => broken,
            Err(err) => {
                debug!(tlf = %tlf_id, error = %err, "identify break lookup failed, reporting broken");
                if err.should_clear() {
                    if let Err(err) = self.breaks.clear(tlf_id) {
                        warn!(tlf = %tlf_id, error = %err, "failed to clear identify break");
                    }
                }
                true
            }
        }
    }

    // ============================================================
    // EPHEMERAL SCHEDULE
    // ============================================================

    pub fn get_ephemeral_purge_info(&self, conv_id: &ConversationId, uid: &Uid) -> Result<EphemeralPurgeInfo> {
        self.ephemeral
            .get_purge_info(conv_id, uid)
            .map_err(|err| self.maybe_clear_ephemeral(err, uid))
    }

    pub fn get_all_ephemeral_purge_info(&self, uid: &Uid) -> Result<Vec<EphemeralPurgeInfo>> {
        self.ephemeral
            .get_all_purge_info(uid)
            .map_err(|err| self.maybe_clear_ephemeral(err, uid))
    }

    fn maybe_clear_ephemeral(&self, err: StorageError, uid: &Uid) -> StorageError {
        if err.should_clear() {
            warn!(error = %err, "ephemeral tracker corrupted: clearing");
            if let Err(err) = self.ephemeral.clear(uid) {
                warn!(error = %err, "failed to clear ephemeral tracker");
            }
        }
        err
    }

    // ============================================================
    // HELPERS
    // ============================================================

    fn secret_key(&self) -> Result<SecretKey> {
        Ok(self.keys.secret_key()?)
    }

    /// Single-message read; a miss is `None`
    fn get_message(&self, session: &BlockSession, id: MessageId) -> Result<Option<MessageRecord>> {
        let mut rc = ResultCollector::simple(1);
        match self.engine.read_messages(session, &mut rc, id, 0) {
            Ok(()) => Ok(rc.into_results().into_iter().next()),
            Err(err) if err.is_miss() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Clear the conversation if `err` says the cache is untrustworthy
    fn maybe_nuke(&self, err: StorageError, conv_id: &ConversationId, uid: &Uid) -> StorageError {
        if err.should_clear() {
            warn!(conv = %conv_id, error = %err, "local storage corrupted: clearing");
            self.nuke_locked(conv_id, uid);
        }
        err
    }

    fn nuke_locked(&self, conv_id: &ConversationId, uid: &Uid) {
        if let Err(err) = self.engine.clear_conversation(conv_id, uid) {
            warn!(conv = %conv_id, error = %err, "failed to delete block index");
        }
        if let Err(err) = self.msgid.clear(conv_id, uid) {
            warn!(conv = %conv_id, error = %err, "failed to clear max msgid");
        }
        if let Err(err) = self.delh.clear(conv_id, uid) {
            warn!(conv = %conv_id, error = %err, "failed to clear delete-history tracker");
        }
        if let Err(err) = self.ephemeral.clear(uid) {
            warn!(error = %err, "failed to clear ephemeral tracker");
        }
    }
}
