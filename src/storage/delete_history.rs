use tracing::{debug, warn};

use super::Storage;
use crate::block_engine::BlockSession;
use crate::collector::ResultCollector;
use crate::conversation::Expunge;
use crate::error::Result;
use crate::message::{MessageRecord, MessageType};
use crate::types::{ConversationId, Uid};

impl Storage {
    /// Lower the tracker's oldest deletable message to the batch's, if older
    pub(super) fn update_min_deletable_message(
        &self,
        conv_id: &ConversationId,
        uid: &Uid,
        msgs: &[MessageRecord],
    ) -> Result<()> {
        let batch_min = msgs
            .iter()
            .filter(|m| m.is_valid_full() && m.msg_type().is_deletable_by_delete_history())
            .map(MessageRecord::id)
            .min();
        let Some(batch_min) = batch_min else {
            return Ok(());
        };

        match self.delh.get_entry(conv_id, uid) {
            Ok(entry) if entry.min_deletable_message > 0 && batch_min >= entry.min_deletable_message => {
                return Ok(());
            }
            Ok(_) => {}
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err),
        }
        if let Err(err) = self.delh.set_min_deletable_message(conv_id, uid, batch_min) {
            warn!(conv = %conv_id, error = %err, "failed to store delete-history tracker");
        }
        Ok(())
    }

    /// Apply the newest delete-history among `msgs` and `explicit`
    ///
    /// Returns the expunge if messages were deleted locally.
    pub(super) fn handle_delete_history(
        &self,
        session: &BlockSession,
        msgs: &[MessageRecord],
        explicit: Option<Expunge>,
    ) -> Result<Option<Expunge>> {
        let (conv_id, uid) = (session.conv_id(), session.uid());

        let mut active = explicit;
        for msg in msgs.iter().filter_map(MessageRecord::valid) {
            if msg.msg_type != MessageType::DeleteHistory {
                continue;
            }
            let Some(upto) = msg.delete_history_upto() else {
                debug!(msg_id = msg.id, "skipping delete-history with wrong body");
                continue;
            };
            debug!(msg_id = msg.id, upto, "found delete-history");
            if upto == 0 {
                continue;
            }
            if active.map_or(true, |a| upto > a.upto) {
                active = Some(Expunge { upto, basis: msg.id });
            }
        }
        let Some(active) = active.filter(|a| a.upto > 0) else {
            return Ok(None);
        };

        match self.delh.get_entry(conv_id, uid) {
            Ok(entry) => {
                if entry.max_delete_history_upto >= active.upto {
                    debug!(
                        local = entry.max_delete_history_upto,
                        upto = active.upto,
                        "delete-history already applied"
                    );
                    return Ok(None);
                }
                if active.upto < entry.min_deletable_message {
                    debug!(
                        upto = active.upto,
                        min_deletable = entry.min_deletable_message,
                        "record-only delete-history"
                    );
                    self.record_delete_history(conv_id, uid, active);
                    return Ok(None);
                }
            }
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err),
        }
        self.apply_expunge(session, active)
    }

    /// Delete every deletable message below `expunge.upto`
    fn apply_expunge(&self, session: &BlockSession, expunge: Expunge) -> Result<Option<Expunge>> {
        let (conv_id, uid) = (session.conv_id(), session.uid());
        debug!(conv = %conv_id, upto = expunge.upto, "applying expunge");

        let mut rc = ResultCollector::insatiable();
        match self.engine.read_messages(session, &mut rc, expunge.upto - 1, 0) {
            Ok(()) => {}
            Err(err) if err.is_miss() => {
                debug!(conv = %conv_id, "record-only delete-history: no local messages");
                self.record_delete_history(conv_id, uid, expunge);
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let mut writeback = Vec::new();
        for mut msg in rc.into_results() {
            if !msg.msg_type().is_deletable_by_delete_history() {
                continue;
            }
            let Some(valid) = msg.valid_mut() else {
                continue;
            };
            if !valid.has_body() {
                continue;
            }
            valid.superseded_by = Some(expunge.basis);
            valid.purge();
            writeback.push(msg);
        }

        debug!(conv = %conv_id, count = writeback.len(), "deleting messages");
        self.engine.write_messages(session, &writeback)?;
        if let Err(err) = self.delh.set_deleted_upto(conv_id, uid, expunge.upto) {
            warn!(conv = %conv_id, error = %err, "failed to store delete-history tracker");
        }
        Ok(Some(expunge))
    }

    fn record_delete_history(&self, conv_id: &ConversationId, uid: &Uid, expunge: Expunge) {
        if let Err(err) = self.delh.set_max_delete_history_upto(conv_id, uid, expunge.upto) {
            warn!(conv = %conv_id, error = %err, "failed to store delete-history tracker");
        }
    }
}
