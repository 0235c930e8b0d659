//! Caller-side cancellation.
//!
//! Operations check the token once on entry; work that has started always
//! runs to completion or failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StorageError};

/// Shared cancellation flag
/// Clones observe the same flag
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Aborted)` if the request was cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::Aborted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_observed_by_clones() {
        let token = CancelToken::new();
        let seen = token.clone();
        assert!(seen.check().is_ok());
        token.cancel();
        assert_eq!(seen.check(), Err(StorageError::Aborted));
    }
}
