//! Storage configuration
//!
//! Fetch limits and outbox purge cutoffs. Production values are the
//! default; tests shrink them with `StorageConfig::with_limits`.

use crate::clock::{DAY_MS, HOUR_MS};

/// Limits configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of slots a single fetch scans
    pub max_fetch_num: usize,
    /// How far past the read marker the unread line search looks
    pub unreadline_scan_limit: u64,
    /// Age after which an errored outbox record is dropped
    pub outbox_error_purge_cutoff_ms: u64,
    /// Same, for ephemeral outgoing messages
    pub outbox_ephemeral_purge_cutoff_ms: u64,
}

impl Limits {
    /// Production values
    pub const PROD: Self = Self {
        max_fetch_num: 1000,
        unreadline_scan_limit: 1000,
        outbox_error_purge_cutoff_ms: 7 * DAY_MS,      // one week
        outbox_ephemeral_purge_cutoff_ms: 24 * HOUR_MS, // one day
    };

    /// Small values for unit tests
    pub const TINY: Self = Self {
        max_fetch_num: 50,
        unreadline_scan_limit: 20,
        outbox_error_purge_cutoff_ms: 7 * DAY_MS,
        outbox_ephemeral_purge_cutoff_ms: 24 * HOUR_MS,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Self::PROD
    }
}

/// Storage configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageConfig {
    limits: Limits,
}

impl StorageConfig {
    /// Create config with production limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with custom limits
    pub fn with_limits(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn max_fetch_num(&self) -> usize {
        self.limits.max_fetch_num
    }
}
