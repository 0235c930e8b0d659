//! Result collectors used while scanning blocks backward.
//!
//! A collector decides three things for a scan:
//! - whether a missing id may be stood in for by a placeholder
//! - when enough has been collected
//! - whether a cache miss is an error for this caller
//!
//! The four strategies form a closed set:
//!
//! | variant      | done when                                   | placeholders      | miss      |
//! |--------------|---------------------------------------------|-------------------|-----------|
//! | `Simple`     | `target` non-deleted messages, or scan cap  | no                | swallowed without a target |
//! | `Typed`      | `target` non-deleted messages of the types  | no                | swallowed without a target |
//! | `Insatiable` | never                                       | always            | propagated |
//! | `Holey`      | as the inner collector                      | up to `max_holes` | as the inner collector |

use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, StorageError};
use crate::message::{MessageRecord, MessageType};
use crate::types::MessageId;

/// Scan cap for counted collectors
pub const MAX_FETCH_NUM: usize = 1000;

/// Progress of a counted scan
#[derive(Clone, Debug, Default)]
pub struct ScanState {
    results: Vec<MessageRecord>,
    /// Messages counted towards the target
    cur: usize,
    /// Slots visited
    cur_scan: usize,
    /// `None` means never done
    target: Option<usize>,
    max_scan: usize,
}

impl ScanState {
    fn new(target: Option<usize>) -> Self {
        Self {
            target,
            max_scan: MAX_FETCH_NUM,
            ..Self::default()
        }
    }

    fn record(&mut self, msg: MessageRecord, counts: bool) {
        if counts {
            self.cur += 1;
        }
        self.cur_scan += 1;
        self.results.push(msg);
    }

    fn done(&self) -> bool {
        match self.target {
            None => false,
            Some(target) => self.cur >= target || self.cur_scan >= self.max_scan,
        }
    }

    fn filter_error(&self, err: StorageError) -> Result<()> {
        if self.target.is_none() && err.is_miss() {
            return Ok(());
        }
        Err(err)
    }
}

#[derive(Clone, Debug)]
pub enum ResultCollector {
    Simple(ScanState),
    Typed {
        state: ScanState,
        types: HashSet<MessageType>,
    },
    Insatiable(Vec<MessageRecord>),
    Holey {
        max_holes: usize,
        holes: usize,
        inner: Box<ResultCollector>,
    },
}

impl ResultCollector {
    /// Collect `num` non-deleted messages
    #[must_use]
    pub fn simple(num: usize) -> Self {
        Self::Simple(ScanState::new(Some(num)))
    }

    /// Collect everything reachable, treating a miss as the end
    #[must_use]
    pub fn simple_unbounded() -> Self {
        Self::Simple(ScanState::new(None))
    }

    /// Collect until `num` non-deleted messages of `types` are seen
    #[must_use]
    pub fn typed(num: usize, types: impl IntoIterator<Item = MessageType>) -> Self {
        Self::Typed {
            state: ScanState::new(Some(num)),
            types: types.into_iter().collect(),
        }
    }

    /// Collect all the way back to the origin, holes included
    #[must_use]
    pub fn insatiable() -> Self {
        Self::Insatiable(Vec::new())
    }

    /// Wrap `inner`, allowing up to `max_holes` placeholders
    #[must_use]
    pub fn holey(max_holes: usize, inner: ResultCollector) -> Self {
        Self::Holey {
            max_holes,
            holes: 0,
            inner: Box::new(inner),
        }
    }

    /// Override the scan cap of a counted collector
    #[must_use]
    pub fn with_max_scan(mut self, max_scan: usize) -> Self {
        match &mut self {
            Self::Simple(state) | Self::Typed { state, .. } => state.max_scan = max_scan,
            Self::Insatiable(_) => {}
            Self::Holey { inner, .. } => {
                let taken = std::mem::replace(inner.as_mut(), Self::insatiable());
                **inner = taken.with_max_scan(max_scan);
            }
        }
        self
    }

    pub fn push(&mut self, msg: MessageRecord) {
        match self {
            Self::Simple(state) => {
                let counts = !msg.is_valid_deleted();
                state.record(msg, counts);
            }
            Self::Typed { state, types } => {
                let counts = !msg.is_valid_deleted() && types.contains(&msg.msg_type());
                state.record(msg, counts);
            }
            Self::Insatiable(results) => results.push(msg),
            Self::Holey { inner, .. } => inner.push(msg),
        }
    }

    /// Offer a placeholder for a missing `id`
    ///
    /// Returns false when the collector refuses, which ends the scan with a miss.
    pub fn push_placeholder(&mut self, id: MessageId) -> bool {
        match self {
            Self::Simple(_) | Self::Typed { .. } => false,
            Self::Insatiable(results) => {
                results.push(MessageRecord::Placeholder { id });
                true
            }
            Self::Holey {
                max_holes,
                holes,
                inner,
            } => {
                if *holes >= *max_holes {
                    return false;
                }
                inner.push(MessageRecord::Placeholder { id });
                *holes += 1;
                true
            }
        }
    }

    #[must_use]
    pub fn done(&self) -> bool {
        match self {
            Self::Simple(state) | Self::Typed { state, .. } => state.done(),
            Self::Insatiable(_) => false,
            Self::Holey { inner, .. } => inner.done(),
        }
    }

    /// Decide whether a scan error reaches the caller
    pub fn filter_error(&self, err: StorageError) -> Result<()> {
        match self {
            Self::Simple(state) | Self::Typed { state, .. } => state.filter_error(err),
            Self::Insatiable(_) => Err(err),
            Self::Holey { inner, .. } => inner.filter_error(err),
        }
    }

    #[must_use]
    pub fn results(&self) -> &[MessageRecord] {
        match self {
            Self::Simple(state) | Self::Typed { state, .. } => &state.results,
            Self::Insatiable(results) => results,
            Self::Holey { inner, .. } => inner.results(),
        }
    }

    #[must_use]
    pub fn into_results(self) -> Vec<MessageRecord> {
        match self {
            Self::Simple(state) | Self::Typed { state, .. } => state.results,
            Self::Insatiable(results) => results,
            Self::Holey { inner, .. } => inner.into_results(),
        }
    }

    /// Placeholders accepted so far
    #[must_use]
    pub fn holes(&self) -> usize {
        match self {
            Self::Holey { holes, .. } => *holes,
            _ => 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Typed { .. } => "typed",
            Self::Insatiable(_) => "inf",
            Self::Holey { .. } => "holey",
        }
    }
}

impl fmt::Display for ResultCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(state) | Self::Typed { state, .. } => match state.target {
                Some(target) => write!(f, "[ {}: t: {target} c: {} ]", self.name(), state.cur),
                None => write!(f, "[ {}: t: - c: {} ]", self.name(), state.cur),
            },
            Self::Insatiable(results) => write!(f, "[ inf: c: {} ]", results.len()),
            Self::Holey {
                max_holes,
                holes,
                inner,
            } => write!(f, "[ holey: {holes}/{max_holes} {inner} ]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, ValidMessage};
    use crate::types::Uid;

    fn text(id: MessageId) -> MessageRecord {
        ValidMessage::new(id, 0, Uid::new(vec![1]), MessageBody::Text { body: format!("m{id}") }).into()
    }

    fn deleted(id: MessageId) -> MessageRecord {
        let mut msg = ValidMessage::new(id, 0, Uid::new(vec![1]), MessageBody::Text { body: String::new() });
        msg.purge();
        msg.into()
    }

    fn headline(id: MessageId) -> MessageRecord {
        ValidMessage::new(id, 0, Uid::new(vec![1]), MessageBody::Headline { headline: "h".into() }).into()
    }

    #[test]
    fn test_simple_counts_non_deleted() {
        let mut rc = ResultCollector::simple(2);
        rc.push(text(5));
        rc.push(deleted(4));
        assert!(!rc.done());
        rc.push(text(3));
        assert!(rc.done());
        assert_eq!(rc.results().len(), 3);
    }

    #[test]
    fn test_simple_scan_cap() {
        let mut rc = ResultCollector::simple(10).with_max_scan(3);
        rc.push(deleted(3));
        rc.push(deleted(2));
        assert!(!rc.done());
        rc.push(deleted(1));
        assert!(rc.done());
    }

    #[test]
    fn test_typed_counts_matching_types_only() {
        let mut rc = ResultCollector::typed(1, [MessageType::Text]);
        rc.push(headline(3));
        rc.push(deleted(2));
        assert!(!rc.done());
        rc.push(text(1));
        assert!(rc.done());
        assert_eq!(rc.results().len(), 3);
    }

    #[test]
    fn test_unbounded_never_done_and_swallows_miss() {
        let mut rc = ResultCollector::simple_unbounded();
        for id in (1..=MAX_FETCH_NUM as u64 + 5).rev() {
            rc.push(text(id));
        }
        assert!(!rc.done());
        assert!(rc.filter_error(StorageError::miss("gone")).is_ok());
        assert!(rc.filter_error(StorageError::internal("bad")).is_err());
    }

    #[test]
    fn test_counted_propagates_miss() {
        let rc = ResultCollector::simple(5);
        assert!(rc.filter_error(StorageError::miss("gone")).unwrap_err().is_miss());
    }

    #[test]
    fn test_placeholder_policy() {
        assert!(!ResultCollector::simple(1).push_placeholder(3));
        assert!(!ResultCollector::typed(1, [MessageType::Text]).push_placeholder(3));

        let mut inf = ResultCollector::insatiable();
        assert!(inf.push_placeholder(3));
        assert!(!inf.done());
        assert!(inf.filter_error(StorageError::miss("x")).is_err());
    }

    #[test]
    fn test_holey_budget() {
        let mut rc = ResultCollector::holey(2, ResultCollector::simple(10));
        assert!(rc.push_placeholder(9));
        rc.push(text(8));
        assert!(rc.push_placeholder(7));
        assert!(!rc.push_placeholder(6));
        assert_eq!(rc.holes(), 2);

        let results = rc.into_results();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_placeholder());
        assert_eq!(results[1].id(), 8);
    }

    #[test]
    fn test_holey_done_follows_inner() {
        let mut rc = ResultCollector::holey(5, ResultCollector::simple(1));
        assert!(rc.push_placeholder(2));
        // Placeholders are not deleted messages, so they count
        assert!(rc.done());
    }

    #[test]
    fn test_display() {
        let rc = ResultCollector::simple(4);
        assert_eq!(rc.to_string(), "[ simple: t: 4 c: 0 ]");
        let rc = ResultCollector::holey(1, ResultCollector::insatiable());
        assert_eq!(rc.to_string(), "[ holey: 0/1 [ inf: c: 0 ] ]");
    }
}
