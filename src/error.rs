//! Error taxonomy for the storage layer.
//!
//! Every failure that crosses a component boundary is classified into one
//! of these kinds. The kind decides whether the affected keyspace slice is
//! destroyed (`should_clear`) or the error is simply surfaced.

use crate::crypto::{CryptoError, KeyError};
use crate::kv::StoreError;

/// Storage error kinds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Structural invariant violated or backend failure
    #[error("internal storage error: {0}")]
    Internal(String),
    /// Record failed to decrypt or decode
    #[error("corrupt record: {0}")]
    Corruption(String),
    /// Requested data is not cached
    #[error("cache miss: {0}")]
    Miss(String),
    /// Inbox update does not follow the stored version
    #[error("inbox version mismatch: current {current}, update {update}")]
    VersionMismatch { current: u64, update: u64 },
    /// Caller cancelled before the operation started
    #[error("request aborted")]
    Aborted,
    /// Malformed input from the remote side (e.g. a pagination cursor)
    #[error("remote error: {0}")]
    Remote(String),
    /// Anything else, e.g. the key provider failed
    #[error("{0}")]
    Misc(String),
}

impl StorageError {
    pub(crate) fn miss(what: impl Into<String>) -> Self {
        Self::Miss(what.into())
    }

    pub(crate) fn internal(what: impl Into<String>) -> Self {
        Self::Internal(what.into())
    }

    /// Whether the failure means the cached state cannot be trusted and must
    /// be dropped so it can be rebuilt from the remote source.
    #[must_use]
    pub fn should_clear(&self) -> bool {
        matches!(
            self,
            Self::Internal(_) | Self::Corruption(_) | Self::VersionMismatch { .. }
        )
    }

    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss(_))
    }
}

impl From<CryptoError> for StorageError {
    fn from(err: CryptoError) -> Self {
        Self::Corruption(err.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<KeyError> for StorageError {
    fn from(err: KeyError) -> Self {
        Self::Misc(format!("unable to get secret key: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_clear_classification() {
        assert!(StorageError::internal("x").should_clear());
        assert!(StorageError::Corruption("x".into()).should_clear());
        assert!(StorageError::VersionMismatch { current: 5, update: 7 }.should_clear());

        assert!(!StorageError::miss("x").should_clear());
        assert!(!StorageError::Aborted.should_clear());
        assert!(!StorageError::Remote("x".into()).should_clear());
        assert!(!StorageError::Misc("x".into()).should_clear());
    }

    #[test]
    fn test_conversions() {
        let err: StorageError = CryptoError::InvalidTag.into();
        assert!(matches!(err, StorageError::Corruption(_)));

        let err: StorageError = StoreError::Io("disk gone".into()).into();
        assert!(matches!(err, StorageError::Internal(_)));

        let err: StorageError = KeyError::Unavailable("locked".into()).into();
        assert!(matches!(err, StorageError::Misc(_)));
        assert!(!err.should_clear());
    }
}
