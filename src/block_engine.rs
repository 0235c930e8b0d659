//! Block engine for the message store.
//!
//! Groups messages into fixed-size encrypted blocks so a whole range is
//! sealed and written as one record, while a single message is still found
//! by arithmetic on its id.
//!
//! # Architecture
//!
//! - `init` loads (or lazily creates) the conversation's `BlockIndex` and
//!   binds the blocks subkey into a `BlockSession`
//! - Writes take descending batches, allocate every block up to the highest
//!   one needed (never skipping), then fill one block per step so each
//!   touched block is written once
//! - Reads walk backward slot by slot, feeding a `ResultCollector`, and
//!   cross into older blocks until the collector is done or the origin
//!   (block 0, slot 0) is reached
//!
//! # Security Properties
//!
//! - Every block and the index are sealed with the blocks subkey
//! - A block that fails to open or breaks slot addressing is corruption;
//!   the orchestrator decides whether to clear the conversation

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::block::{
    block_index_key, block_key, block_number, block_position, block_prefix, Block, BlockId,
    BlockIndex, BLOCK_INDEX_VERSION, BLOCK_VERSION,
};
use crate::collector::ResultCollector;
use crate::crypto::{open_record, seal_record, KeyPurpose, SecretKey};
use crate::error::{Result, StorageError};
use crate::kv::KeyValueStore;
use crate::message::MessageRecord;
use crate::types::{ConversationId, MessageId, Uid};

/// Handle bound to one (user, conversation) for the duration of a call
pub struct BlockSession {
    key: SecretKey,
    uid: Uid,
    conv_id: ConversationId,
}

impl BlockSession {
    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    #[must_use]
    pub fn conv_id(&self) -> &ConversationId {
        &self.conv_id
    }
}

/// Encrypted block storage
#[derive(Clone)]
pub struct BlockEngine {
    store: Arc<dyn KeyValueStore>,
}

impl BlockEngine {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Bind the key and make sure the conversation has an index
    ///
    /// A missing index (or one in an old format) is created together with
    /// an empty block 0.
    pub fn init(&self, root_key: &SecretKey, conv_id: &ConversationId, uid: &Uid) -> Result<BlockSession> {
        let session = BlockSession {
            key: root_key.derive_subkey(KeyPurpose::Blocks)?,
            uid: uid.clone(),
            conv_id: conv_id.clone(),
        };
        if self.read_index(&session)?.is_none() {
            debug!(conv = %conv_id, "init: creating block index");
            let index = BlockIndex::new(conv_id.clone(), uid.clone());
            self.write_block(&session, &Block::new(0))?;
            self.write_index(&session, &index)?;
        }
        Ok(session)
    }

    /// Drop the index and every block of the conversation
    pub fn clear_conversation(&self, conv_id: &ConversationId, uid: &Uid) -> Result<()> {
        self.store.delete(&block_index_key(uid, conv_id))?;
        let removed = self.store.delete_prefix(&block_prefix(uid, conv_id))?;
        debug!(conv = %conv_id, removed, "cleared conversation blocks");
        Ok(())
    }

    /// Current index, if the session's conversation has one
    pub fn index(&self, session: &BlockSession) -> Result<BlockIndex> {
        self.read_index(session)?
            .ok_or_else(|| StorageError::miss("no block index"))
    }

    // ============================================================
    // WRITE PATH
    // ============================================================

    /// Write a batch sorted by descending id
    pub fn write_messages(&self, session: &BlockSession, msgs: &[MessageRecord]) -> Result<()> {
        let msgs: Vec<&MessageRecord> = msgs.iter().filter(|m| m.id() > 0).collect();
        let touched: BTreeSet<BlockId> = msgs.iter().map(|m| block_number(m.id())).collect();
        let fresh = self.allocate_blocks(session, &touched)?;

        let mut rest = msgs.as_slice();
        while let Some(first) = rest.first() {
            let target = block_number(first.id());
            let mut block = if fresh.contains(&target) {
                Block::new(target)
            } else {
                self.read_block(session, target)?
            };

            // Fill this block until the batch crosses into an older one
            let mut written = 0;
            for msg in rest {
                if block_number(msg.id()) != target {
                    break;
                }
                block.put((*msg).clone());
                written += 1;
            }
            self.write_block(session, &block)?;
            rest = &rest[written..];
        }
        Ok(())
    }

    /// Empty the slots of `ids`
    pub fn clear_messages(&self, session: &BlockSession, ids: &[MessageId]) -> Result<()> {
        let index = self.index(session)?;
        let mut current: Option<Block> = None;
        for &id in ids {
            let number = block_number(id);
            if number > index.max_block {
                continue;
            }
            if current.as_ref().map(|b| b.block_id) != Some(number) {
                if let Some(done) = current.take() {
                    self.write_block(session, &done)?;
                }
                current = Some(self.read_block(session, number)?);
            }
            if let Some(block) = current.as_mut() {
                block.clear(id);
            }
        }
        if let Some(done) = current {
            self.write_block(session, &done)?;
        }
        Ok(())
    }

    /// Grow the index to cover every block in `touched`
    ///
    /// Skipped blocks the batch does not touch are written empty here. Returns
    /// the new blocks the batch does touch, which the caller writes itself.
    fn allocate_blocks(
        &self,
        session: &BlockSession,
        touched: &BTreeSet<BlockId>,
    ) -> Result<BTreeSet<BlockId>> {
        let mut index = self.index(session)?;
        let Some(&target) = touched.last() else {
            return Ok(BTreeSet::new());
        };
        if target <= index.max_block {
            return Ok(BTreeSet::new());
        }
        debug!(
            conv = %session.conv_id,
            from = index.max_block + 1,
            to = target,
            "allocating blocks"
        );
        let mut fresh = BTreeSet::new();
        for number in index.max_block + 1..=target {
            if touched.contains(&number) {
                fresh.insert(number);
            } else {
                self.write_block(session, &Block::new(number))?;
            }
        }
        index.max_block = target;
        self.write_index(session, &index)?;
        Ok(fresh)
    }

    // ============================================================
    // READ PATH
    // ============================================================

    /// Scan backward from `max_id`, stopping above the exclusive `min_id`
    ///
    /// Errors go through the collector, which may swallow a miss.
    pub fn read_messages(
        &self,
        session: &BlockSession,
        rc: &mut ResultCollector,
        max_id: MessageId,
        min_id: MessageId,
    ) -> Result<()> {
        match self.scan(session, rc, max_id, min_id) {
            Ok(()) => Ok(()),
            Err(err) => rc.filter_error(err),
        }
    }

    fn scan(
        &self,
        session: &BlockSession,
        rc: &mut ResultCollector,
        max_id: MessageId,
        min_id: MessageId,
    ) -> Result<()> {
        let index = self.index(session)?;
        let mut next = max_id;
        loop {
            let number = block_number(next);
            if number > index.max_block {
                return Err(StorageError::miss(format!(
                    "message {next} is past max block {}",
                    index.max_block
                )));
            }
            let block = self.read_block(session, number)?;

            let mut position = block_position(next);
            loop {
                // Id 0 is never used, so slot 0 of block 0 is the origin
                if block.block_id == 0 && position == 0 {
                    return Ok(());
                }
                let id = block.id_at(position);
                if id <= min_id {
                    return Ok(());
                }
                match block.slot(position) {
                    None => {
                        if !rc.push_placeholder(id) {
                            return Err(StorageError::miss(format!("missing message {id}")));
                        }
                    }
                    Some(msg) => rc.push(msg.clone()),
                }
                if rc.done() {
                    return Ok(());
                }
                if position == 0 {
                    break;
                }
                position -= 1;
            }
            // Exhausted this block; continue with the previous one
            next = block.id_at(0) - 1;
        }
    }

    // ============================================================
    // RECORDS
    // ============================================================

    fn read_index(&self, session: &BlockSession) -> Result<Option<BlockIndex>> {
        let key = block_index_key(&session.uid, &session.conv_id);
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        Ok(open_record(&session.key, BLOCK_INDEX_VERSION, &bytes)?)
    }

    fn write_index(&self, session: &BlockSession, index: &BlockIndex) -> Result<()> {
        let bytes = seal_record(&session.key, BLOCK_INDEX_VERSION, index)?;
        self.store
            .put(&block_index_key(&session.uid, &session.conv_id), &bytes)?;
        Ok(())
    }

    fn read_block(&self, session: &BlockSession, number: BlockId) -> Result<Block> {
        let key = block_key(&session.uid, &session.conv_id, number);
        let bytes = self
            .store
            .get(&key)?
            .ok_or_else(|| StorageError::internal(format!("block {number} not found")))?;
        let block: Block = open_record(&session.key, BLOCK_VERSION, &bytes)?
            .ok_or_else(|| StorageError::internal(format!("block {number} has unknown format")))?;
        block.validate(number)?;
        Ok(block)
    }

    fn write_block(&self, session: &BlockSession, block: &Block) -> Result<()> {
        let bytes = seal_record(&session.key, BLOCK_VERSION, block)?;
        self.store
            .put(&block_key(&session.uid, &session.conv_id, block.block_id), &bytes)?;
        Ok(())
    }
}
