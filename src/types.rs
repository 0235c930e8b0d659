//! Identifier types shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned message number within a conversation; 0 is never used.
pub type MessageId = u64;

/// Inbox version as assigned by the server
pub type InboxVersion = u64;

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            #[must_use]
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Lowercase hex rendering used in storage keys
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }
    };
}

byte_id!(
    /// User identifier
    Uid
);
byte_id!(
    /// Conversation identifier
    ConversationId
);
byte_id!(
    /// Top-level folder identifier (the team or user set a conversation belongs to)
    TlfId
);
byte_id!(
    /// Client-chosen identifier of a message waiting in the outbox
    OutboxId
);
