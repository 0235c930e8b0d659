//! Pagination cursors for thread fetches.
//!
//! A cursor is an opaque byte string holding a single message id. `next`
//! points at the oldest message of a page and `previous` at the newest, so
//! the caller pages older with `next` and newer with `previous`.

use serde::{Deserialize, Serialize};

use crate::crypto::{decode, encode};
use crate::error::{Result, StorageError};
use crate::message::MessageRecord;
use crate::types::MessageId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Cursor for the page of older messages
    pub next: Option<Vec<u8>>,
    /// Cursor for the page of newer messages
    pub previous: Option<Vec<u8>>,
    pub num: usize,
    /// Nothing older is worth asking for
    pub last: bool,
}

impl Pagination {
    /// Request the first page of `num` messages
    #[must_use]
    pub fn first(num: usize) -> Self {
        Self {
            num,
            ..Self::default()
        }
    }

    /// Request the page of `num` messages older than `cursor`
    #[must_use]
    pub fn older(num: usize, cursor: Vec<u8>) -> Self {
        Self {
            next: Some(cursor),
            num,
            ..Self::default()
        }
    }

    /// Request the page of `num` messages newer than `cursor`
    #[must_use]
    pub fn newer(num: usize, cursor: Vec<u8>) -> Self {
        Self {
            previous: Some(cursor),
            num,
            ..Self::default()
        }
    }
}

/// Encode `id` as a cursor
pub fn make_index(id: MessageId) -> Result<Vec<u8>> {
    Ok(encode(&id)?)
}

/// Decode a cursor produced by `make_index`
///
/// A cursor that does not decode came from the caller, not from local
/// state, so it is reported as `Remote`.
pub fn decode_index(cursor: &[u8]) -> Result<MessageId> {
    decode(cursor).map_err(|e| StorageError::Remote(format!("bad pagination cursor: {e}")))
}

/// Build the cursor for a page of `msgs` (newest first)
///
/// `max_deleted_upto` is the delete-history watermark: nothing at or below
/// it can be shown, so a page reaching it is the last.
pub fn make_page(msgs: &[MessageRecord], num: usize, max_deleted_upto: MessageId) -> Result<Pagination> {
    let (Some(newest), Some(oldest)) = (msgs.first(), msgs.last()) else {
        return Ok(Pagination {
            num: 0,
            last: true,
            ..Pagination::default()
        });
    };
    let oldest_id = oldest.id();
    Ok(Pagination {
        next: Some(make_index(oldest_id)?),
        previous: Some(make_index(newest.id())?),
        num: msgs.len(),
        last: msgs.len() < num || oldest_id <= max_deleted_upto || oldest_id == 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(ids: &[MessageId]) -> Vec<MessageRecord> {
        ids.iter().map(|&id| MessageRecord::Placeholder { id }).collect()
    }

    #[test]
    fn test_cursor_round_trip() {
        assert_eq!(decode_index(&make_index(120).unwrap()).unwrap(), 120);
    }

    #[test]
    fn test_bad_cursor_is_remote_error() {
        let err = decode_index(&[]).unwrap_err();
        assert!(matches!(err, StorageError::Remote(_)));
        assert!(!err.should_clear());
    }

    #[test]
    fn test_page_cursors() {
        let p = make_page(&page(&[30, 29, 28]), 3, 0).unwrap();
        assert_eq!(decode_index(p.next.as_deref().unwrap()).unwrap(), 28);
        assert_eq!(decode_index(p.previous.as_deref().unwrap()).unwrap(), 30);
        assert_eq!(p.num, 3);
        assert!(!p.last);
    }

    #[test]
    fn test_short_page_is_last() {
        assert!(make_page(&page(&[30, 29]), 3, 0).unwrap().last);
    }

    #[test]
    fn test_page_reaching_delete_history_is_last() {
        assert!(make_page(&page(&[30, 29, 28]), 3, 28).unwrap().last);
        assert!(!make_page(&page(&[30, 29, 28]), 3, 27).unwrap().last);
    }

    #[test]
    fn test_page_reaching_origin_is_last() {
        assert!(make_page(&page(&[3, 2, 1]), 3, 0).unwrap().last);
    }

    #[test]
    fn test_empty_page() {
        let p = make_page(&[], 10, 0).unwrap();
        assert_eq!(p.num, 0);
        assert!(p.last);
        assert!(p.next.is_none());
    }
}
