//! Small persistent trackers kept next to the message blocks.
//!
//! Each tracker owns one concern, its own lock and its own record format,
//! so any of them can be dropped and rebuilt without touching the others:
//! - `MsgIdTracker`: highest message id stored per conversation
//! - `DelhTracker`: delete-history progress per conversation
//! - `EphemeralTracker`: purge scheduling, one map per user
//! - `BreakTracker`: identify failures per top-level folder
//!
//! All records are sealed with the trackers subkey.

mod breaks;
mod delh;
mod ephemeral;
mod msgid;

pub use breaks::{BreakTracker, IdentifyFailure};
pub use delh::{DelhTracker, DelhTrackerEntry};
pub use ephemeral::{EphemeralPurgeInfo, EphemeralTracker};
pub use msgid::MsgIdTracker;
