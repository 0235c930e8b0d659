//! Message records as held in the cache.
//!
//! The storage engine only interprets a handful of fields: the id, the type,
//! the supersede targets carried in the body, the ephemeral expiry and
//! whether the body is still present. Everything else rides along opaquely.

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, Timestamp, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    None,
    Text,
    Attachment,
    Edit,
    Delete,
    Metadata,
    TlfName,
    Headline,
    AttachmentUploaded,
    Join,
    Leave,
    System,
    DeleteHistory,
    Reaction,
    SendPayment,
    RequestPayment,
    Unfurl,
    Flip,
}

impl MessageType {
    /// Types whose bodies a delete-history sweep removes
    #[must_use]
    pub fn is_deletable_by_delete_history(self) -> bool {
        matches!(
            self,
            Self::Text
                | Self::Attachment
                | Self::Edit
                | Self::AttachmentUploaded
                | Self::Reaction
                | Self::Unfurl
                | Self::Flip
        )
    }

    /// Types rendered as a line in the thread
    #[must_use]
    pub fn is_visible(self) -> bool {
        matches!(
            self,
            Self::Text
                | Self::Attachment
                | Self::System
                | Self::SendPayment
                | Self::RequestPayment
                | Self::Flip
                | Self::Headline
                | Self::Metadata
                | Self::Join
                | Self::Leave
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text { body: String },
    Attachment { object: Vec<u8> },
    Edit { target: MessageId, body: String },
    /// Deletes the original message plus all its edits
    Delete { targets: Vec<MessageId> },
    DeleteHistory { upto: MessageId },
    Headline { headline: String },
    Metadata { topic_name: String },
    Reaction { target: MessageId, body: String },
    System { body: String },
    /// Payload of a type the cache does not interpret
    Opaque { msg_type: MessageType, payload: Vec<u8> },
}

impl MessageBody {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Attachment { .. } => MessageType::Attachment,
            Self::Edit { .. } => MessageType::Edit,
            Self::Delete { .. } => MessageType::Delete,
            Self::DeleteHistory { .. } => MessageType::DeleteHistory,
            Self::Headline { .. } => MessageType::Headline,
            Self::Metadata { .. } => MessageType::Metadata,
            Self::Reaction { .. } => MessageType::Reaction,
            Self::System { .. } => MessageType::System,
            Self::Opaque { msg_type, .. } => *msg_type,
        }
    }

    /// Ids of the messages this body replaces
    #[must_use]
    pub fn supersedes(&self) -> Vec<MessageId> {
        match self {
            Self::Edit { target, .. } | Self::Reaction { target, .. } => vec![*target],
            Self::Delete { targets } => targets.clone(),
            _ => Vec::new(),
        }
    }
}

/// A successfully unboxed message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidMessage {
    pub id: MessageId,
    pub msg_type: MessageType,
    pub ctime: Timestamp,
    pub sender: Uid,
    /// Id of the message that edited or deleted this one
    pub superseded_by: Option<MessageId>,
    /// Reactions pointing at this message
    pub reaction_ids: Vec<MessageId>,
    /// Ephemeral expiry time, if the message explodes
    pub etime: Option<Timestamp>,
    /// `None` once deleted, expunged or exploded
    pub body: Option<MessageBody>,
}

impl ValidMessage {
    #[must_use]
    pub fn new(id: MessageId, ctime: Timestamp, sender: Uid, body: MessageBody) -> Self {
        Self {
            id,
            msg_type: body.message_type(),
            ctime,
            sender,
            superseded_by: None,
            reaction_ids: Vec::new(),
            etime: None,
            body: Some(body),
        }
    }

    #[must_use]
    pub fn with_etime(mut self, etime: Timestamp) -> Self {
        self.etime = Some(etime);
        self
    }

    #[must_use]
    pub fn supersedes(&self) -> Vec<MessageId> {
        self.body.as_ref().map(MessageBody::supersedes).unwrap_or_default()
    }

    #[must_use]
    pub fn delete_history_upto(&self) -> Option<MessageId> {
        match self.body {
            Some(MessageBody::DeleteHistory { upto }) => Some(upto),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.etime.is_some()
    }

    #[must_use]
    pub fn is_ephemeral_expired(&self, now: Timestamp) -> bool {
        self.etime.is_some_and(|etime| etime <= now)
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Drop the body and reactions in place
    pub fn purge(&mut self) {
        self.body = None;
        self.reaction_ids.clear();
    }

    /// Record reaction `id`, returning whether it was new
    pub fn add_reaction(&mut self, id: MessageId) -> bool {
        if self.reaction_ids.contains(&id) {
            return false;
        }
        self.reaction_ids.push(id);
        true
    }

    /// Forget reaction `id`, returning whether it was present
    pub fn remove_reaction(&mut self, id: MessageId) -> bool {
        let before = self.reaction_ids.len();
        self.reaction_ids.retain(|&r| r != id);
        before != self.reaction_ids.len()
    }
}

/// A single cache slot's content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRecord {
    Valid(ValidMessage),
    /// The message could not be unboxed
    Error {
        id: MessageId,
        msg_type: MessageType,
        message: String,
        /// Failed only because of a version this client has since learned
        parseable: bool,
    },
    /// Stand-in for an id the cache has no content for
    Placeholder { id: MessageId },
}

impl MessageRecord {
    #[must_use]
    pub fn id(&self) -> MessageId {
        match self {
            Self::Valid(m) => m.id,
            Self::Error { id, .. } | Self::Placeholder { id } => *id,
        }
    }

    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Valid(m) => m.msg_type,
            Self::Error { msg_type, .. } => *msg_type,
            Self::Placeholder { .. } => MessageType::None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }

    #[must_use]
    pub fn valid(&self) -> Option<&ValidMessage> {
        match self {
            Self::Valid(m) => Some(m),
            _ => None,
        }
    }

    pub fn valid_mut(&mut self) -> Option<&mut ValidMessage> {
        match self {
            Self::Valid(m) => Some(m),
            _ => None,
        }
    }

    /// Valid but with its body removed
    #[must_use]
    pub fn is_valid_deleted(&self) -> bool {
        self.valid().is_some_and(|m| !m.has_body())
    }

    /// Valid with the body still present
    #[must_use]
    pub fn is_valid_full(&self) -> bool {
        self.valid().is_some_and(ValidMessage::has_body)
    }
}

impl From<ValidMessage> for MessageRecord {
    fn from(msg: ValidMessage) -> Self {
        Self::Valid(msg)
    }
}
