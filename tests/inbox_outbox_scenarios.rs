//! Integration tests for the conversation list and the send queue
//!
//! These follow a client session: an initial inbox load from the server,
//! a stream of versioned updates, and messages flowing through the outbox
//! while the network comes and goes.
//!
//! ```bash
//! cargo test --test inbox_outbox_scenarios
//! ```

use std::sync::Arc;

use chat_storage::clock::{DAY_MS, HOUR_MS};
use chat_storage::{
    CancelToken, Conversation, ConversationId, ConversationStatus, Inbox, InboxQuery,
    InMemoryStore, KeyProvider, ManualClock, MessageBody, MessageSummary, MessageType, Outbox,
    OutboxError, OutboxErrorKind, OutboxState, OutgoingMessage, SecretKey, StaticKeyProvider,
    StorageConfig, StorageError, TlfId, Uid,
};

const START_MS: u64 = 1_700_000_000_000;

fn me() -> Uid {
    Uid::new(vec![0xaa; 16])
}

fn alice() -> Uid {
    Uid::new(vec![0xbb; 16])
}

fn conv_id(n: u8) -> ConversationId {
    ConversationId::new(vec![n; 32])
}

fn conversation(n: u8, max_msg_id: u64) -> Conversation {
    let mut conv = Conversation::new(conv_id(n), TlfId::new(vec![n; 16]));
    conv.reader_info.max_msg_id = max_msg_id;
    conv.reader_info.read_msg_id = max_msg_id;
    conv.metadata.version = 1;
    conv
}

fn summary(msg_id: u64, sender: Uid) -> MessageSummary {
    MessageSummary {
        msg_id,
        msg_type: MessageType::Text,
        sender,
        ctime: START_MS,
    }
}

struct Session {
    inbox: Inbox,
    store: InMemoryStore,
    keys: Arc<dyn KeyProvider>,
    clock: ManualClock,
    cancel: CancelToken,
}

impl Session {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let clock = ManualClock::new(START_MS);
        let keys: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::new(SecretKey::generate()));
        let inbox = Inbox::new(Arc::new(store.clone()), keys.clone()).with_clock(Arc::new(clock.clone()));
        Self {
            inbox,
            store,
            keys,
            clock,
            cancel: CancelToken::new(),
        }
    }

    fn outbox(&self) -> Outbox {
        Outbox::new(Arc::new(self.store.clone()), self.keys.clone(), me(), StorageConfig::default())
            .with_clock(Arc::new(self.clock.clone()))
    }

    fn conv_order(&self) -> Vec<ConversationId> {
        let (_, convs) = self.inbox.read(&self.cancel, &me(), None).unwrap();
        convs.iter().map(|rc| rc.id().clone()).collect()
    }
}

fn text(body: &str) -> OutgoingMessage {
    OutgoingMessage::new(MessageBody::Text { body: body.into() })
}

// ============================================================
// SCENARIO 1: Inbox load and incremental updates
// ============================================================

#[test]
fn scenario_inbox_load_then_live_updates() {
    let s = Session::new();
    let uid = me();

    // Nothing cached yet
    assert!(s.inbox.read(&s.cancel, &uid, None).unwrap_err().is_miss());

    s.inbox
        .merge(&uid, 5, &[conversation(1, 10), conversation(2, 20), conversation(3, 30)], None)
        .unwrap();
    assert_eq!(s.inbox.version(&uid).unwrap(), 5);
    assert_eq!(s.conv_order(), vec![conv_id(1), conv_id(2), conv_id(3)]);

    // Alice writes in conversation 3: it jumps to the top and turns unread
    s.clock.advance(HOUR_MS);
    s.inbox
        .new_message(&uid, 6, &conv_id(3), &summary(31, alice()), &[])
        .unwrap();
    assert_eq!(s.conv_order(), vec![conv_id(3), conv_id(1), conv_id(2)]);
    let three = s.inbox.get_conversation(&s.cancel, &uid, &conv_id(3)).unwrap();
    assert!(three.conv.reader_info.is_unread());
    assert_eq!(three.conv.reader_info.mtime, START_MS + HOUR_MS);
    assert_eq!(three.conv.metadata.active_list, vec![alice()]);

    // Reading it clears the unread state
    s.inbox.read_message(&uid, 7, &conv_id(3), 31).unwrap();
    let three = s.inbox.get_conversation(&s.cancel, &uid, &conv_id(3)).unwrap();
    assert!(!three.conv.reader_info.is_unread());
    assert_eq!(s.inbox.version(&uid).unwrap(), 7);

    // A replay of an old update changes nothing
    s.inbox.set_status(&uid, 6, &conv_id(1), ConversationStatus::Muted).unwrap();
    let one = s.inbox.get_conversation(&s.cancel, &uid, &conv_id(1)).unwrap();
    assert_eq!(one.conv.metadata.status, ConversationStatus::Unfiled);
    assert_eq!(s.conv_order(), vec![conv_id(3), conv_id(1), conv_id(2)]);
}

#[test]
fn scenario_version_gap_drops_inbox() {
    let s = Session::new();
    let uid = me();
    s.inbox.merge(&uid, 5, &[conversation(1, 10)], None).unwrap();

    // Update 6 never arrived
    let err = s.inbox.read_message(&uid, 7, &conv_id(1), 10).unwrap_err();
    assert!(matches!(err, StorageError::VersionMismatch { current: 5, update: 7 }));
    assert!(err.should_clear());

    // The client must reload from the server
    assert!(s.inbox.read(&s.cancel, &uid, None).unwrap_err().is_miss());
    assert_eq!(s.inbox.version(&uid).unwrap(), 0);
    assert!(s.store.keys_with_prefix("ib:").is_empty());
}

#[test]
fn scenario_unseen_queries_miss_until_merged() {
    let s = Session::new();
    let uid = me();
    s.inbox.merge(&uid, 1, &[conversation(1, 10), conversation(2, 20)], None).unwrap();

    let muted = InboxQuery {
        statuses: vec![ConversationStatus::Muted],
        ..InboxQuery::default()
    };
    assert!(s.inbox.read(&s.cancel, &uid, Some(&muted)).unwrap_err().is_miss());

    // Lookups by id are answered from what is cached
    let by_id = InboxQuery::by_conv_ids([conv_id(2)]);
    let (_, convs) = s.inbox.read(&s.cancel, &uid, Some(&by_id)).unwrap();
    assert_eq!(convs.len(), 1);

    s.inbox.merge(&uid, 1, &[], Some(&muted)).unwrap();
    let (vers, convs) = s.inbox.read(&s.cancel, &uid, Some(&muted)).unwrap();
    assert_eq!(vers, 1);
    assert!(convs.is_empty());
}

#[test]
fn scenario_sync_reports_changes() {
    let s = Session::new();
    let uid = me();
    s.inbox.merge(&uid, 1, &[conversation(1, 10), conversation(2, 20)], None).unwrap();
    s.inbox.draft(&uid, &conv_id(2), Some("half a thought".into())).unwrap();

    let mut renamed = conversation(2, 25);
    renamed.metadata.version = 2;
    renamed.topic_name = "random".into();
    renamed.max_msg_summaries = vec![MessageSummary {
        msg_id: 24,
        msg_type: MessageType::Metadata,
        sender: alice(),
        ctime: START_MS,
    }];
    let res = s.inbox.sync(&uid, 9, &[renamed, conversation(4, 1)]).unwrap();

    assert_eq!(res.topic_name_changed, vec![conv_id(2)]);
    assert!(res.members_type_changed.is_empty());
    assert_eq!(res.filtered_convs.len(), 2);
    assert_eq!(s.inbox.version(&uid).unwrap(), 9);

    // The local draft survives the sync
    let two = s.inbox.get_conversation(&s.cancel, &uid, &conv_id(2)).unwrap();
    assert_eq!(two.local_draft.as_deref(), Some("half a thought"));
    assert_eq!(two.conv.reader_info.max_msg_id, 25);
    assert_eq!(s.conv_order(), vec![conv_id(1), conv_id(2), conv_id(4)]);
}

// ============================================================
// SCENARIO 2: Sending while the network flaps
// ============================================================

#[test]
fn scenario_outbox_ordinals_across_failures() {
    let s = Session::new();
    let outbox = s.outbox();
    let conv = conv_id(1);

    let mut pushed = Vec::new();
    for i in 0..5 {
        pushed.push(outbox.push_message(&conv, text(&format!("m{i}")), None).unwrap());
        s.clock.advance(1);
    }
    let ordinals: Vec<u64> = pushed.iter().map(|r| r.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);

    // Two transient failures, then the user gives up on the third message
    outbox.record_failed_attempt(&pushed[2]).unwrap();
    outbox.record_failed_attempt(&pushed[2]).unwrap();
    assert_eq!(
        outbox.get_record(&pushed[2].outbox_id).unwrap().state,
        OutboxState::Sending { attempts: 2 }
    );
    let offline = OutboxError::new(OutboxErrorKind::Offline, "no route to host");
    outbox.mark_as_error(&pushed[2], offline).unwrap();

    // The sender drains everything that is still sendable
    let sendable = outbox.pull_all_conversations(false, true).unwrap();
    let sent: Vec<u64> = sendable.iter().map(|r| r.ordinal).collect();
    assert_eq!(sent, vec![1, 2, 4, 5]);

    // Only the errored record is left; new pushes continue after it
    let next = outbox.push_message(&conv, text("m5"), None).unwrap();
    assert_eq!(next.ordinal, 4);

    // Retrying moves the failed message behind the newest one
    s.clock.advance(1);
    let retried = outbox.retry_message(&pushed[2].outbox_id).unwrap().unwrap();
    assert_eq!(retried.state, OutboxState::Sending { attempts: 0 });
    let queue: Vec<u64> = outbox
        .pull_all_conversations(false, false)
        .unwrap()
        .iter()
        .map(|r| r.ordinal)
        .collect();
    assert_eq!(queue, vec![4, 3]);
}

#[test]
fn scenario_conversation_failure_parks_everything() {
    let s = Session::new();
    let outbox = s.outbox();

    for i in 0..3 {
        outbox.push_message(&conv_id(1), text(&format!("a{i}")), None).unwrap();
        outbox.push_message(&conv_id(2), text(&format!("b{i}")), None).unwrap();
        s.clock.advance(1);
    }
    let err = OutboxError::new(OutboxErrorKind::Identify, "identify failed");
    let marked = outbox.mark_conv_as_error(&conv_id(1), err).unwrap();
    assert_eq!(marked.len(), 3);

    assert_eq!(outbox.pull_all_conversations(false, false).unwrap().len(), 3);
    assert_eq!(outbox.pull_all_conversations(true, false).unwrap().len(), 6);
    assert!(outbox
        .pull_for_conversation(&conv_id(1))
        .unwrap()
        .iter()
        .all(|r| r.state.is_error()));

    // Leaving the conversation drops its queue
    let cancelled = outbox
        .cancel_messages_with_predicate(|r| r.conv_id == conv_id(1))
        .unwrap();
    assert_eq!(cancelled, 3);
    assert!(outbox.pull_for_conversation(&conv_id(1)).unwrap().is_empty());
}

#[test]
fn scenario_stale_errors_are_purged() {
    let s = Session::new();
    let outbox = s.outbox();
    let conv = conv_id(1);

    let boom = OutgoingMessage::ephemeral(MessageBody::Text { body: "boom".into() }, HOUR_MS);
    let ephemeral = outbox.push_message(&conv, boom, None).unwrap();
    let plain = outbox.push_message(&conv, text("hello"), None).unwrap();
    let pending = outbox.push_message(&conv, text("still trying"), None).unwrap();
    for rec in [&ephemeral, &plain] {
        let err = OutboxError::new(OutboxErrorKind::Misc, "server said no");
        outbox.mark_as_error(rec, err).unwrap();
    }

    s.clock.advance(DAY_MS + 1);
    let purged = outbox.outbox_purge().unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].outbox_id, ephemeral.outbox_id);

    s.clock.advance(7 * DAY_MS);
    assert!(outbox.outbox_purge().unwrap().is_empty());
    let left = outbox.pull_all_conversations(true, false).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].outbox_id, pending.outbox_id);
}

// ============================================================
// SCENARIO 3: Inbox and outbox share one store
// ============================================================

#[test]
fn scenario_inbox_reset_leaves_outbox() {
    let s = Session::new();
    let outbox = s.outbox();
    s.inbox.merge(&me(), 3, &[conversation(1, 10)], None).unwrap();
    let rec = outbox.push_message(&conv_id(1), text("queued"), None).unwrap();

    s.inbox.clear(&me()).unwrap();
    assert!(s.inbox.read(&s.cancel, &me(), None).unwrap_err().is_miss());
    assert_eq!(outbox.get_record(&rec.outbox_id).unwrap(), rec);

    // Sending my own message bumps the read marker with the max
    s.inbox.merge(&me(), 3, &[conversation(1, 10)], None).unwrap();
    s.inbox
        .new_message(&me(), 4, &conv_id(1), &summary(11, me()), &[])
        .unwrap();
    let one = s.inbox.get_conversation(&s.cancel, &me(), &conv_id(1)).unwrap();
    assert_eq!(one.conv.reader_info.read_msg_id, 11);
    assert!(!one.conv.reader_info.is_unread());
}
