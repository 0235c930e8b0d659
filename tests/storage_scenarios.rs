//! Integration tests simulating how a chat client drives the message cache
//!
//! Each scenario merges server batches the way the sync loop does and then
//! reads them back the way the thread view does: first page, then paging
//! older or newer with the returned cursors.
//!
//! ```bash
//! cargo test --test storage_scenarios
//! ```

use std::sync::Arc;

use chat_storage::clock::SECOND_MS;
use chat_storage::{
    make_index, CancelToken, Clock, Conversation, ConversationId, Expunge, FetchOptions,
    InMemoryStore, ManualClock, MessageBody, MessageId, MessageRecord, MessageType, Pagination,
    SecretKey, StaticKeyProvider, Storage, StorageConfig, ThreadQuery, TlfId, Uid, ValidMessage,
};

const START_MS: u64 = 1_700_000_000_000;

struct Client {
    storage: Storage,
    store: InMemoryStore,
    clock: ManualClock,
    uid: Uid,
    conv_id: ConversationId,
}

impl Client {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let clock = ManualClock::new(START_MS);
        let storage = Storage::new(
            Arc::new(store.clone()),
            Arc::new(StaticKeyProvider::new(SecretKey::generate())),
            StorageConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));
        Self {
            storage,
            store,
            clock,
            uid: Uid::new(vec![0x11; 16]),
            conv_id: ConversationId::new(vec![0x22; 32]),
        }
    }

    fn conversation(&self, max_msg_id: MessageId) -> Conversation {
        let mut conv = Conversation::new(self.conv_id.clone(), TlfId::new(vec![0x33; 16]));
        conv.reader_info.max_msg_id = max_msg_id;
        conv
    }

    fn merge(&self, msgs: &[MessageRecord]) {
        self.storage.merge(&self.conv_id, &self.uid, msgs).unwrap();
    }

    fn page(&self, max_msg_id: MessageId, pagination: Pagination) -> (Vec<MessageId>, Pagination) {
        let res = self
            .storage
            .fetch(
                &CancelToken::new(),
                &self.conversation(max_msg_id),
                &self.uid,
                FetchOptions {
                    pagination: Some(pagination),
                    ..FetchOptions::default()
                },
            )
            .unwrap();
        (ids(&res.thread.messages), res.thread.pagination)
    }

    fn message(&self, id: MessageId) -> MessageRecord {
        self.storage
            .fetch_messages(&CancelToken::new(), &self.conv_id, &self.uid, &[id])
            .unwrap()
            .remove(0)
            .unwrap()
    }
}

/// Helper to build a message from the test user
fn msg(id: MessageId, body: MessageBody) -> MessageRecord {
    ValidMessage::new(id, START_MS + id, Uid::new(vec![0x11; 16]), body).into()
}

fn text(id: MessageId) -> MessageRecord {
    msg(id, MessageBody::Text { body: format!("message {id}") })
}

/// Descending batch of text messages
fn texts(hi: MessageId, lo: MessageId) -> Vec<MessageRecord> {
    (lo..=hi).rev().map(text).collect()
}

fn ids(msgs: &[MessageRecord]) -> Vec<MessageId> {
    msgs.iter().map(MessageRecord::id).collect()
}

fn desc(hi: MessageId, lo: MessageId) -> Vec<MessageId> {
    (lo..=hi).rev().collect()
}

// ============================================================
// SCENARIO 1: Open a small conversation and page through it
// ============================================================

#[test]
fn scenario_small_thread_first_page_then_older() {
    let client = Client::new();
    client.merge(&texts(10, 1));

    // Whole thread in one fetch
    let res = client
        .storage
        .fetch(&CancelToken::new(), &client.conversation(10), &client.uid, FetchOptions::default())
        .unwrap();
    assert_eq!(ids(&res.thread.messages), desc(10, 1));
    assert!(res.thread.messages.iter().all(|m| m.msg_type() == MessageType::Text));

    // Page of five, then the next page
    let (first, pagination) = client.page(10, Pagination::first(5));
    assert_eq!(first, desc(10, 6));
    assert!(!pagination.last);

    let cursor = pagination.next.unwrap();
    let (second, pagination) = client.page(10, Pagination::older(5, cursor));
    assert_eq!(second, desc(5, 1));
    assert!(pagination.last);
}

// ============================================================
// SCENARIO 2: Long history across several blocks
// ============================================================

#[test]
fn scenario_long_history_paging_both_ways() {
    let client = Client::new();
    client.merge(&texts(300, 1));

    // Older than 120
    let (older, pagination) = client.page(300, Pagination::older(100, make_index(120).unwrap()));
    assert_eq!(older, desc(119, 20));
    assert_eq!(pagination.num, 100);
    assert!(!pagination.last);

    // Newer than 120
    let (newer, _) = client.page(300, Pagination::newer(100, make_index(120).unwrap()));
    assert_eq!(newer, desc(220, 121));

    // Newer than 250 stops at the known max
    let (newest, _) = client.page(300, Pagination::newer(100, make_index(250).unwrap()));
    assert_eq!(newest, desc(300, 251));
}

#[test]
fn scenario_batch_straddling_block_boundary() {
    let client = Client::new();
    client.merge(&texts(105, 95));

    let (page, pagination) = client.page(105, Pagination::first(11));
    assert_eq!(page, desc(105, 95));
    assert!(!pagination.last);

    // Blocks 0 and 1 both exist; nothing below 95 is cached
    assert_eq!(client.store.keys_with_prefix("bl:").len(), 2);
    let res = client.storage.fetch_messages(&CancelToken::new(), &client.conv_id, &client.uid, &[94, 99, 100]);
    let res = res.unwrap();
    assert!(res[0].is_none());
    assert_eq!(res[1].as_ref().map(MessageRecord::id), Some(99));
    assert_eq!(res[2].as_ref().map(MessageRecord::id), Some(100));
}

#[test]
fn scenario_gap_above_cache_is_a_miss() {
    let client = Client::new();
    client.merge(&texts(10, 1));

    // The server knows about 250 but nothing past 10 is cached
    let err = client
        .storage
        .fetch(&CancelToken::new(), &client.conversation(250), &client.uid, FetchOptions::default())
        .unwrap_err();
    assert!(err.is_miss());
    assert!(!err.should_clear());
}

// ============================================================
// SCENARIO 3: Edits, deletes and reactions arriving later
// ============================================================

#[test]
fn scenario_edit_then_delete_old_message() {
    let client = Client::new();
    client.merge(&texts(110, 1));

    client.merge(&[msg(111, MessageBody::Edit { target: 6, body: "fixed typo".into() })]);
    let six = client.message(6);
    assert_eq!(six.valid().unwrap().superseded_by, Some(111));
    assert!(six.is_valid_full());

    client.merge(&[msg(112, MessageBody::Delete { targets: vec![6, 111] })]);
    for id in [6, 111] {
        let deleted = client.message(id);
        assert!(deleted.is_valid_deleted());
        assert_eq!(deleted.valid().unwrap().superseded_by, Some(112));
    }
    assert_eq!(client.storage.get_max_msg_id(&client.conv_id, &client.uid).unwrap(), 112);
}

#[test]
fn scenario_typed_query_skips_other_types() {
    let client = Client::new();
    let mut batch = texts(10, 1);
    batch.insert(0, msg(11, MessageBody::Reaction { target: 3, body: ":tada:".into() }));
    batch.insert(0, msg(12, MessageBody::Headline { headline: "news".into() }));
    client.merge(&batch);

    let res = client
        .storage
        .fetch(
            &CancelToken::new(),
            &client.conversation(12),
            &client.uid,
            FetchOptions {
                query: Some(ThreadQuery {
                    message_types: vec![MessageType::Text],
                }),
                pagination: Some(Pagination::first(3)),
                ..FetchOptions::default()
            },
        )
        .unwrap();
    // Non-matching messages ride along but do not count towards the page
    assert_eq!(ids(&res.thread.messages), vec![12, 11, 10, 9, 8]);
    assert_eq!(client.message(3).valid().unwrap().reaction_ids, vec![11]);
}

// ============================================================
// SCENARIO 4: Delete history
// ============================================================

#[test]
fn scenario_delete_history_is_idempotent() {
    let client = Client::new();
    client.merge(&texts(10, 1));
    let block_key = format!("bl:{}:{}:0", client.uid, client.conv_id);

    let delh = msg(11, MessageBody::DeleteHistory { upto: 6 });
    let res = client.storage.merge(&client.conv_id, &client.uid, &[delh.clone()]).unwrap();
    assert_eq!(res.expunged, Some(Expunge { upto: 6, basis: 11 }));
    let snapshot: Vec<_> = (1..=11).map(|id| client.message(id)).collect();

    // Replaying writes the delete-history message itself and nothing else
    let writes = client.store.write_count(&block_key);
    let res = client.storage.merge(&client.conv_id, &client.uid, &[delh]).unwrap();
    assert!(res.expunged.is_none());
    assert_eq!(client.store.write_count(&block_key), writes + 1);

    let replayed: Vec<_> = (1..=11).map(|id| client.message(id)).collect();
    assert_eq!(snapshot, replayed);
    assert!(replayed[..5].iter().all(MessageRecord::is_valid_deleted));
    assert!(replayed[5..10].iter().all(MessageRecord::is_valid_full));
}

#[test]
fn scenario_retention_expunge_marks_last_page() {
    let client = Client::new();
    client.merge(&texts(20, 1));
    client
        .storage
        .expunge(&client.conv_id, &client.uid, Expunge { upto: 11, basis: 0 })
        .unwrap();

    let (page, pagination) = client.page(20, Pagination::first(5));
    assert_eq!(page, desc(20, 16));
    assert!(!pagination.last);

    // Reaching the expunge watermark ends the thread
    let (page, pagination) = client.page(20, Pagination::older(5, pagination.next.unwrap()));
    assert_eq!(page, desc(15, 11));
    assert!(pagination.last);
}

// ============================================================
// SCENARIO 5: Exploding messages
// ============================================================

#[test]
fn scenario_exploding_messages_purge_in_order() {
    let client = Client::new();
    let now = client.clock.now_ms();
    let mut batch = Vec::new();
    for id in (2..=5).rev() {
        let boom = ValidMessage::new(id, now, client.uid.clone(), MessageBody::Text { body: "boom".into() })
            .with_etime(now + id * SECOND_MS);
        batch.push(boom.into());
    }
    batch.push(text(1));
    client.merge(&batch);

    let mut info = client.storage.get_ephemeral_purge_info(&client.conv_id, &client.uid).unwrap();
    assert!(info.is_active);
    assert_eq!(info.min_unexploded_id, 2);
    assert_eq!(info.next_purge_time, now + 2 * SECOND_MS);

    let mut exploded = Vec::new();
    while info.is_active {
        client.clock.set(info.next_purge_time);
        let res = client
            .storage
            .ephemeral_purge(&client.conv_id, &client.uid, Some(&info))
            .unwrap();
        let next = res.purge_info.unwrap();
        assert!(next.min_unexploded_id >= info.min_unexploded_id);
        exploded.extend(ids(&res.exploded));
        info = next;
    }
    assert_eq!(exploded, vec![2, 3, 4, 5]);
    assert!(client.message(1).is_valid_full());
    assert!(client.message(5).is_valid_deleted());

    let all = client.storage.get_all_ephemeral_purge_info(&client.uid).unwrap();
    assert_eq!(all.len(), 1);
    assert!(!all[0].is_active);
}

// ============================================================
// SCENARIO 6: Unread line and local clears
// ============================================================

#[test]
fn scenario_unreadline_skips_deleted() {
    let client = Client::new();
    let mut batch = texts(10, 1);
    batch.insert(0, msg(11, MessageBody::Delete { targets: vec![6] }));
    client.merge(&batch);
    client.merge(&[msg(12, MessageBody::Edit { target: 7, body: "e".into() })]);

    let unread = client
        .storage
        .fetch_unreadline_id(&CancelToken::new(), &client.conv_id, &client.uid, 5)
        .unwrap();
    assert_eq!(unread, Some(7));

    let none = client
        .storage
        .fetch_unreadline_id(&CancelToken::new(), &client.conv_id, &client.uid, 12)
        .unwrap();
    assert_eq!(none, None);
}

#[test]
fn scenario_clear_before_leaves_newer() {
    let client = Client::new();
    client.merge(&texts(10, 1));
    client.storage.clear_before(&client.conv_id, &client.uid, 4).unwrap();

    let res = client
        .storage
        .fetch_messages(&CancelToken::new(), &client.conv_id, &client.uid, &[1, 3, 4])
        .unwrap();
    assert!(res[0].is_none());
    assert!(res[1].is_none());
    assert!(res[2].is_some());

    client.storage.clear_all(&client.conv_id, &client.uid).unwrap();
    let res = client
        .storage
        .fetch_messages(&CancelToken::new(), &client.conv_id, &client.uid, &[10])
        .unwrap();
    assert!(res[0].is_none());
}
