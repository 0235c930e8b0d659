use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::conversation::{ConversationStatus, MembersType, RemoteConversation, TopicType, Visibility};
use crate::crypto::encode;
use crate::error::Result;
use crate::types::{ConversationId, Timestamp, TlfId};

/// Filter over the cached conversation list
///
/// Every field left at its default matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxQuery {
    pub conv_ids: Vec<ConversationId>,
    pub tlf_id: Option<TlfId>,
    /// Only conversations modified strictly after this time
    pub after: Option<Timestamp>,
    /// Only conversations modified strictly before this time
    pub before: Option<Timestamp>,
    pub topic_name: Option<String>,
    pub topic_type: Option<TopicType>,
    pub visibility: Option<Visibility>,
    pub members_types: Vec<MembersType>,
    pub statuses: Vec<ConversationStatus>,
    pub unread_only: bool,
    pub read_only: bool,
    /// Serve the query from cache even if it was never merged
    pub allow_unseen: bool,
}

impl InboxQuery {
    #[must_use]
    pub fn by_conv_ids(conv_ids: impl IntoIterator<Item = ConversationId>) -> Self {
        Self {
            conv_ids: conv_ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Whether the query looks up one conversation by folder, name and type
    pub(crate) fn is_single_name_query(&self) -> bool {
        self.tlf_id.is_some()
            && self.topic_name.is_some()
            && self.topic_type.is_some()
            && self.members_types.len() == 1
    }

    pub fn matches(&self, rc: &RemoteConversation) -> bool {
        let conv = &rc.conv;
        let meta = &conv.metadata;

        if !self.conv_ids.is_empty() && !self.conv_ids.contains(&meta.conv_id) {
            return false;
        }
        if self.tlf_id.as_ref().is_some_and(|tlf| *tlf != meta.tlf_id) {
            return false;
        }
        let mtime = conv.reader_info.mtime;
        if self.after.is_some_and(|after| mtime <= after) {
            return false;
        }
        if self.before.is_some_and(|before| mtime >= before) {
            return false;
        }
        if self.topic_name.as_ref().is_some_and(|name| *name != conv.topic_name) {
            return false;
        }
        if self.topic_type.is_some_and(|t| t != meta.topic_type) {
            return false;
        }
        if self.visibility.is_some_and(|v| v != meta.visibility) {
            return false;
        }
        if !self.members_types.is_empty() && !self.members_types.contains(&meta.members_type) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&meta.status) {
            return false;
        }
        let unread = conv.reader_info.is_unread();
        if self.unread_only && !unread {
            return false;
        }
        if self.read_only && unread {
            return false;
        }
        true
    }
}

/// Stable fingerprint of a query; `None` hashes to the empty vector
pub(crate) fn hash_query(query: Option<&InboxQuery>) -> Result<Vec<u8>> {
    let Some(query) = query else {
        return Ok(Vec::new());
    };
    let bytes = encode(query)?;
    Ok(Sha256::digest(&bytes).to_vec())
}

/// Keep the conversations `query` matches, preserving order
pub fn apply_query(query: Option<&InboxQuery>, convs: &[RemoteConversation]) -> Vec<RemoteConversation> {
    match query {
        None => convs.to_vec(),
        Some(q) => convs.iter().filter(|rc| q.matches(rc)).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;

    fn conv(id: u8, mtime: Timestamp) -> RemoteConversation {
        let mut conv = Conversation::new(ConversationId::new(vec![id]), TlfId::new(vec![id]));
        conv.reader_info.mtime = mtime;
        conv.into()
    }

    #[test]
    fn test_hash_is_stable_and_distinct() {
        let a = InboxQuery::by_conv_ids([ConversationId::new(vec![1])]);
        let b = InboxQuery::by_conv_ids([ConversationId::new(vec![2])]);
        assert_eq!(hash_query(Some(&a)).unwrap(), hash_query(Some(&a.clone())).unwrap());
        assert_ne!(hash_query(Some(&a)).unwrap(), hash_query(Some(&b)).unwrap());
        assert!(hash_query(None).unwrap().is_empty());
    }

    #[test]
    fn test_time_window() {
        let convs = vec![conv(1, 10), conv(2, 20), conv(3, 30)];
        let query = InboxQuery {
            after: Some(10),
            before: Some(30),
            ..InboxQuery::default()
        };
        let res = apply_query(Some(&query), &convs);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id(), &ConversationId::new(vec![2]));
    }

    #[test]
    fn test_unread_and_status_filters() {
        let mut unread = conv(1, 0);
        unread.conv.reader_info.max_msg_id = 5;
        let mut muted = conv(2, 0);
        muted.conv.metadata.status = ConversationStatus::Muted;
        let convs = vec![unread, muted];

        let query = InboxQuery {
            unread_only: true,
            ..InboxQuery::default()
        };
        assert_eq!(apply_query(Some(&query), &convs).len(), 1);

        let query = InboxQuery {
            read_only: true,
            statuses: vec![ConversationStatus::Unfiled],
            ..InboxQuery::default()
        };
        assert!(apply_query(Some(&query), &convs).is_empty());
    }

    #[test]
    fn test_topic_and_visibility() {
        let mut public = conv(1, 0);
        public.conv.metadata.visibility = Visibility::Public;
        public.conv.topic_name = "general".into();
        let convs = vec![public, conv(2, 0)];

        let query = InboxQuery {
            visibility: Some(Visibility::Public),
            topic_name: Some("general".into()),
            ..InboxQuery::default()
        };
        assert_eq!(apply_query(Some(&query), &convs).len(), 1);
        assert_eq!(apply_query(None, &convs).len(), 2);
    }
}
