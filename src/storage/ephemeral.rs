use tracing::debug;

use super::Storage;
use crate::block_engine::BlockSession;
use crate::collector::ResultCollector;
use crate::error::Result;
use crate::message::MessageRecord;
use crate::trackers::EphemeralPurgeInfo;
use crate::types::{ConversationId, Uid};

/// Outcome of an ephemeral purge pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EphemeralPurgeResult {
    /// Schedule after the pass; `None` if no pass was requested
    pub purge_info: Option<EphemeralPurgeInfo>,
    pub exploded: Vec<MessageRecord>,
}

impl Storage {
    /// Blank the bodies of expired ephemeral messages in `msgs`
    ///
    /// Writes the exploded messages back and returns them along with the
    /// schedule implied by the survivors.
    pub(super) fn explode_expired(
        &self,
        session: &BlockSession,
        msgs: &mut [MessageRecord],
    ) -> Result<(Vec<MessageRecord>, EphemeralPurgeInfo)> {
        let now = self.clock.now_ms();
        let mut info = EphemeralPurgeInfo::inactive(session.conv_id().clone(), 0);
        let mut exploded = Vec::new();

        for msg in msgs.iter_mut() {
            let Some(valid) = msg.valid_mut() else {
                continue;
            };
            let Some(etime) = valid.etime else {
                continue;
            };
            if etime <= now {
                if valid.has_body() {
                    valid.purge();
                    exploded.push(msg.clone());
                }
                continue;
            }
            if !info.is_active || valid.id < info.min_unexploded_id {
                info.min_unexploded_id = valid.id;
            }
            if !info.is_active || etime < info.next_purge_time {
                info.next_purge_time = etime;
            }
            info.is_active = true;
        }

        if !exploded.is_empty() {
            debug!(conv = %session.conv_id(), count = exploded.len(), "exploding messages");
            exploded.sort_by_key(|m| std::cmp::Reverse(m.id()));
            self.engine.write_messages(session, &exploded)?;
        }
        Ok((exploded, info))
    }

    /// Explode whatever has expired since `purge_info` was computed
    pub fn ephemeral_purge(
        &self,
        conv_id: &ConversationId,
        uid: &Uid,
        purge_info: Option<&EphemeralPurgeInfo>,
    ) -> Result<EphemeralPurgeResult> {
        let Some(purge_info) = purge_info else {
            return Ok(EphemeralPurgeResult::default());
        };
        let _guard = self.lock.lock();
        debug!(conv = %conv_id, min_unexploded_id = purge_info.min_unexploded_id, "ephemeral purge");

        let key = self.secret_key()?;
        let session = self
            .engine
            .init(&key, conv_id, uid)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))?;
        self.ephemeral_purge_locked(&session, purge_info)
            .map_err(|err| self.maybe_nuke(err, conv_id, uid))
    }

    fn ephemeral_purge_locked(
        &self,
        session: &BlockSession,
        purge_info: &EphemeralPurgeInfo,
    ) -> Result<EphemeralPurgeResult> {
        let (conv_id, uid) = (session.conv_id(), session.uid());

        let max_msg_id = match self.msgid.get(conv_id, uid) {
            Ok(0) => return self.inactivate(conv_id, uid, purge_info),
            Ok(id) => id,
            Err(err) if err.is_miss() => return self.inactivate(conv_id, uid, purge_info),
            Err(err) => return Err(err),
        };
        let min_id = purge_info.min_unexploded_id.clamp(1, max_msg_id);

        // Any of the slots between the bounds may be a hole
        let num = (max_msg_id.saturating_sub(min_id) + 1) as usize;
        let mut rc = ResultCollector::holey(num, ResultCollector::simple(num))
            .with_max_scan(num.max(self.config.max_fetch_num()));
        match self.engine.read_messages(session, &mut rc, max_msg_id, min_id - 1) {
            Ok(()) => {}
            Err(err) if err.is_miss() => return self.inactivate(conv_id, uid, purge_info),
            Err(err) => return Err(err),
        }
        let mut msgs = rc.into_results();
        if msgs.iter().all(MessageRecord::is_placeholder) {
            debug!(conv = %conv_id, "no local messages, deactivating purge");
            return self.inactivate(conv_id, uid, purge_info);
        }

        let (exploded, mut info) = self.explode_expired(session, &mut msgs)?;
        if !info.is_active {
            info = EphemeralPurgeInfo::inactive(
                conv_id.clone(),
                purge_info.min_unexploded_id.max(max_msg_id),
            );
        }
        self.ephemeral.set_purge_info(uid, &info)?;
        Ok(EphemeralPurgeResult {
            purge_info: Some(info),
            exploded,
        })
    }

    fn inactivate(
        &self,
        conv_id: &ConversationId,
        uid: &Uid,
        purge_info: &EphemeralPurgeInfo,
    ) -> Result<EphemeralPurgeResult> {
        self.ephemeral.inactivate(conv_id, uid)?;
        Ok(EphemeralPurgeResult {
            purge_info: Some(EphemeralPurgeInfo::inactive(
                conv_id.clone(),
                purge_info.min_unexploded_id,
            )),
            exploded: Vec::new(),
        })
    }
}
