//! Block structures for the message store.
//!
//! Implements the fixed-size message blocks and the per-conversation index:
//! - Block: 100 slots, message `id` lives at slot `id % 100` of block `id / 100`
//! - BlockIndex: highest allocated block for one (user, conversation)
//!
//! # Invariants
//!
//! - **Slot addressing**: a filled slot's message id always equals
//!   `block_id * BLOCK_SIZE + position`; anything else is corruption
//! - **Monotonic index**: `max_block` only ever grows; blocks are allocated
//!   contiguously so every block up to `max_block` exists

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::message::MessageRecord;
use crate::types::{ConversationId, MessageId, Uid};

// ============================================================
// CONSTANTS
// ============================================================

/// Messages per block
pub const BLOCK_SIZE: u64 = 100;

/// Record format of `BlockIndex`
pub const BLOCK_INDEX_VERSION: u32 = 1;

/// Record format of `Block`
pub const BLOCK_VERSION: u32 = 1;

// ============================================================
// ADDRESSING
// ============================================================

/// Block number within a conversation
pub type BlockId = u64;

/// Block holding message `id`
#[must_use]
pub fn block_number(id: MessageId) -> BlockId {
    id / BLOCK_SIZE
}

/// Slot of message `id` within its block
#[must_use]
pub fn block_position(id: MessageId) -> usize {
    (id % BLOCK_SIZE) as usize
}

pub(crate) fn block_index_key(uid: &Uid, conv_id: &ConversationId) -> String {
    format!("bi:{uid}:{conv_id}")
}

pub(crate) fn block_key(uid: &Uid, conv_id: &ConversationId, block_id: BlockId) -> String {
    format!("{}{block_id}", block_prefix(uid, conv_id))
}

pub(crate) fn block_prefix(uid: &Uid, conv_id: &ConversationId) -> String {
    format!("bl:{uid}:{conv_id}:")
}

// ============================================================
// BLOCK INDEX
// ============================================================

/// Per-conversation block index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub conv_id: ConversationId,
    pub uid: Uid,
    /// Highest allocated block
    pub max_block: BlockId,
}

impl BlockIndex {
    #[must_use]
    pub fn new(conv_id: ConversationId, uid: Uid) -> Self {
        Self {
            conv_id,
            uid,
            max_block: 0,
        }
    }
}

// ============================================================
// BLOCK
// ============================================================

/// Fixed array of message slots
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: BlockId,
    slots: Vec<Option<MessageRecord>>,
}

impl Block {
    /// Empty block
    #[must_use]
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            slots: vec![None; BLOCK_SIZE as usize],
        }
    }

    /// Id that belongs at `position`
    #[must_use]
    pub fn id_at(&self, position: usize) -> MessageId {
        self.block_id * BLOCK_SIZE + position as u64
    }

    #[must_use]
    pub fn slot(&self, position: usize) -> Option<&MessageRecord> {
        self.slots.get(position).and_then(Option::as_ref)
    }

    /// Store `msg` in its slot
    ///
    /// The caller guarantees `msg` belongs to this block.
    pub fn put(&mut self, msg: MessageRecord) {
        let position = block_position(msg.id());
        self.slots[position] = Some(msg);
    }

    /// Empty the slot for `id`
    pub fn clear(&mut self, id: MessageId) {
        self.slots[block_position(id)] = None;
    }

    /// Number of filled slots
    #[must_use]
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Check the structural invariants of a decoded block
    pub fn validate(&self, expected_id: BlockId) -> Result<()> {
        if self.block_id != expected_id {
            return Err(StorageError::internal(format!(
                "block id mismatch: stored {} expected {expected_id}",
                self.block_id
            )));
        }
        if self.slots.len() != BLOCK_SIZE as usize {
            return Err(StorageError::internal(format!(
                "block {} has {} slots",
                self.block_id,
                self.slots.len()
            )));
        }
        for (position, slot) in self.slots.iter().enumerate() {
            if let Some(msg) = slot {
                if msg.id() != self.id_at(position) {
                    return Err(StorageError::internal(format!(
                        "block {} slot {position} holds message {}",
                        self.block_id,
                        msg.id()
                    )));
                }
            }
        }
        Ok(())
    }
}
