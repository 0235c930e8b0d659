use std::collections::BTreeMap;

use tracing::debug;

use super::Storage;
use crate::block_engine::BlockSession;
use crate::error::Result;
use crate::message::{MessageBody, MessageRecord, MessageType, ValidMessage};
use crate::types::MessageId;

impl Storage {
    /// Point every target of a superseding message in `msgs` at its superseder
    ///
    /// Messages are replayed oldest first, the order they were sent in.
    /// Returns the messages whose reaction lists changed.
    pub(super) fn update_all_superseded_by(
        &self,
        session: &BlockSession,
        msgs: &[MessageRecord],
    ) -> Result<Vec<MessageRecord>> {
        let mut superseders: Vec<&ValidMessage> = msgs.iter().filter_map(MessageRecord::valid).collect();
        superseders.sort_by_key(|m| m.id);

        let mut reaction_targets: BTreeMap<MessageId, MessageRecord> = BTreeMap::new();
        for msg in superseders {
            for target_id in msg.supersedes() {
                if target_id == 0 {
                    debug!(msg_id = msg.id, "skipping invalid supersede target");
                    continue;
                }
                let Some(mut target) = self.get_message(session, target_id)? else {
                    continue;
                };
                let Some(target_valid) = target.valid_mut() else {
                    debug!(target_id, "skipping supersede target stored as an error");
                    continue;
                };
                debug!(msg_id = msg.id, target_id, "updating superseded by");

                let mut writes = Vec::new();
                match msg.msg_type {
                    MessageType::Reaction => {
                        // Reactions are tracked on the target, not via superseded_by
                        if target_valid.add_reaction(msg.id) {
                            reaction_targets.insert(target_id, target.clone());
                        }
                        writes.push(target);
                    }
                    MessageType::Delete => {
                        target_valid.superseded_by = Some(msg.id);
                        if let Some(reacted) = self.reaction_target_on_delete(session, target_valid)? {
                            reaction_targets.insert(reacted.id(), reacted.clone());
                            writes.push(reacted);
                        }
                        target_valid.purge();
                        writes.push(target);
                    }
                    _ => {
                        target_valid.superseded_by = Some(msg.id);
                        writes.push(target);
                    }
                }
                writes.sort_by_key(|m| std::cmp::Reverse(m.id()));
                self.engine.write_messages(session, &writes)?;
            }
        }
        Ok(reaction_targets.into_values().collect())
    }

    /// When a reaction is deleted, drop it from the message it reacted to
    fn reaction_target_on_delete(
        &self,
        session: &BlockSession,
        reaction: &ValidMessage,
    ) -> Result<Option<MessageRecord>> {
        let Some(MessageBody::Reaction { target, .. }) = reaction.body.as_ref() else {
            return Ok(None);
        };
        let Some(mut reacted) = self.get_message(session, *target)? else {
            return Ok(None);
        };
        let removed = match reacted.valid_mut() {
            Some(valid) => valid.remove_reaction(reaction.id),
            None => false,
        };
        Ok(removed.then_some(reacted))
    }
}
