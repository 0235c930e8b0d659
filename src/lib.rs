//! Chat Storage - Encrypted local cache for a chat client
//!
//! This crate keeps message history, the conversation list and the send
//! queue on device so the client can render instantly and offline, while
//! staying reconcilable with the server's authoritative ordering. It uses:
//! - Fixed-size blocks of 100 message slots, each sealed as one record
//! - XChaCha20-Poly1305 with per-keyspace HKDF subkeys
//! - Versioned records that self-heal: anything unreadable is dropped and
//!   refilled from the server
//! - One lock per component, no global state
//!
//! ## Architecture
//!
//! ```text
//! Storage (merge / fetch / expunge / ephemeral purge)
//!     ├── supersede pass, delete-history pass, explode pass
//!     ├── Trackers (max msgid, delete-history, ephemeral schedule, identify breaks)
//!     ↓ read_messages / write_messages with a ResultCollector
//! BlockEngine
//!     ↓ block id = msg id / 100, slot = msg id % 100
//! EncryptedDb / seal_record ── Inbox (ib:{uid}), Outbox (ob:{uid})
//!     ↓ sealed bytes by key
//! KeyValueStore (InMemoryStore / DirStore)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod block;
pub mod block_engine;
pub mod cancel;
pub mod clock;
pub mod collector;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod encrypted_db;
pub mod error;
pub mod inbox;
pub mod kv;
pub mod message;
pub mod outbox;
pub mod pager;
pub mod storage;
pub mod trackers;
pub mod types;

pub use block::{block_number, block_position, Block, BlockIndex, BLOCK_SIZE};
pub use block_engine::{BlockEngine, BlockSession};
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::ResultCollector;
pub use config::{Limits, StorageConfig};
pub use conversation::{
    Conversation, ConversationMetadata, ConversationStatus, Expunge, MembersType, MessageSummary,
    ReaderInfo, RemoteConversation, TopicType, Visibility,
};
pub use crypto::{
    open, open_record, seal, seal_record, CryptoError, Envelope, KeyError, KeyProvider, KeyPurpose,
    SecretKey, StaticKeyProvider, CRYPTO_VERSION,
};
pub use encrypted_db::EncryptedDb;
pub use error::{Result, StorageError};
pub use inbox::{apply_query, Inbox, InboxQuery, InboxSyncResult, SyncExpunge};
pub use kv::{DirStore, InMemoryStore, KeyValueStore, StoreError};
pub use message::{MessageBody, MessageRecord, MessageType, ValidMessage};
pub use outbox::{
    OutboxError, OutboxErrorKind, OutboxRecord, OutboxState, Outbox, OutgoingMessage,
};
pub use pager::{decode_index, make_index, make_page, Pagination};
pub use storage::{
    EphemeralPurgeResult, FetchOptions, FetchResult, MergeResult, Storage, ThreadQuery, ThreadView,
};
pub use trackers::{DelhTrackerEntry, EphemeralPurgeInfo, IdentifyFailure};
pub use types::{ConversationId, InboxVersion, MessageId, OutboxId, Timestamp, TlfId, Uid};
