//! Conversation metadata as cached in the inbox.

use serde::{Deserialize, Serialize};

use crate::message::MessageType;
use crate::types::{ConversationId, MessageId, Timestamp, TlfId, Uid};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationStatus {
    #[default]
    Unfiled,
    Favorite,
    Ignored,
    Blocked,
    Muted,
    Reported,
}

impl ConversationStatus {
    /// Whether sending a message returns the conversation to `Unfiled`
    #[must_use]
    pub fn sending_removes_status(self) -> bool {
        matches!(self, Self::Ignored | Self::Muted)
    }

    /// Whether any new message returns the conversation to `Unfiled`
    #[must_use]
    pub fn activity_removes_status(self) -> bool {
        matches!(self, Self::Ignored)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicType {
    #[default]
    Chat,
    Dev,
    Kbfs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembersType {
    #[default]
    Kbfs,
    Team,
    ImpteamNative,
    ImpteamUpgrade,
}

/// History removed up to (not including) `upto`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expunge {
    pub upto: MessageId,
    /// Message that caused the expunge; 0 for retention
    pub basis: MessageId,
}

/// Latest message of one type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub msg_id: MessageId,
    pub msg_type: MessageType,
    pub sender: Uid,
    pub ctime: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub read_msg_id: MessageId,
    pub max_msg_id: MessageId,
    pub mtime: Timestamp,
    pub last_send_time: Timestamp,
}

impl ReaderInfo {
    #[must_use]
    pub fn is_unread(&self) -> bool {
        self.read_msg_id < self.max_msg_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conv_id: ConversationId,
    pub tlf_id: TlfId,
    pub topic_type: TopicType,
    pub visibility: Visibility,
    pub status: ConversationStatus,
    pub members_type: MembersType,
    /// Recent writers, most recent first
    pub active_list: Vec<Uid>,
    pub supersedes: Vec<ConversationId>,
    pub superseded_by: Vec<ConversationId>,
    /// The folder was reset and this conversation is closed
    pub finalized: bool,
    /// Server-side conversation version
    pub version: u64,
    /// Bumped by local edits that the server has not echoed yet
    pub local_version: u64,
}

impl ConversationMetadata {
    #[must_use]
    pub fn new(conv_id: ConversationId, tlf_id: TlfId) -> Self {
        Self {
            conv_id,
            tlf_id,
            topic_type: TopicType::default(),
            visibility: Visibility::default(),
            status: ConversationStatus::default(),
            members_type: MembersType::default(),
            active_list: Vec::new(),
            supersedes: Vec::new(),
            superseded_by: Vec::new(),
            finalized: false,
            version: 0,
            local_version: 0,
        }
    }
}

/// A conversation as the server describes it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub metadata: ConversationMetadata,
    pub reader_info: ReaderInfo,
    pub topic_name: String,
    /// Latest message per type
    pub max_msg_summaries: Vec<MessageSummary>,
    pub expunge: Expunge,
}

impl Conversation {
    #[must_use]
    pub fn new(conv_id: ConversationId, tlf_id: TlfId) -> Self {
        Self {
            metadata: ConversationMetadata::new(conv_id, tlf_id),
            reader_info: ReaderInfo::default(),
            topic_name: String::new(),
            max_msg_summaries: Vec::new(),
            expunge: Expunge::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConversationId {
        &self.metadata.conv_id
    }

    #[must_use]
    pub fn max_msg_id(&self) -> MessageId {
        self.reader_info.max_msg_id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Latest message of `msg_type`, if the server told us about one
    #[must_use]
    pub fn max_message(&self, msg_type: MessageType) -> Option<&MessageSummary> {
        self.max_msg_summaries.iter().find(|s| s.msg_type == msg_type)
    }
}

/// A cached conversation plus purely local state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub conv: Conversation,
    /// Read marker set locally ahead of the server
    pub local_read_msg_id: MessageId,
    pub local_draft: Option<String>,
}

impl RemoteConversation {
    #[must_use]
    pub fn id(&self) -> &ConversationId {
        self.conv.id()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.conv.version()
    }
}

impl From<Conversation> for RemoteConversation {
    fn from(conv: Conversation) -> Self {
        Self {
            conv,
            local_read_msg_id: 0,
            local_draft: None,
        }
    }
}
