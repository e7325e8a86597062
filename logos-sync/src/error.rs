//! Error taxonomy for the sync subsystem.
//!
//! Mutating operations (join, leave, persist) never bubble these out to the
//! caller; they are logged at the call site and reflected in status flags.
//! Only identity preconditions are returned directly.

use thiserror::Error;

/// Errors produced by the transport, document, cache and session layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Sending or receiving through the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Content was malformed or rejected by a validator.
    #[error("validation error: {0}")]
    Validation(String),

    /// No usable snapshot in the cache or in history.
    #[error("not found: {0}")]
    NotFound(String),

    /// A deferred record could not be armed, renewed or cancelled.
    #[error("lease error: {0}")]
    Lease(String),

    /// The local identity is incomplete.
    #[error("missing identity: {0}")]
    Identity(String),

    /// Local cache backend failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Encoding or decoding of wire content failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SyncError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for SyncError {
    fn from(e: lz4_flex::block::DecompressError) -> Self {
        SyncError::Codec(format!("lz4: {e}"))
    }
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Codec(format!("crdt update: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind() {
        let err = SyncError::transport("socket closed");
        assert_eq!(err.to_string(), "transport error: socket closed");

        let err = SyncError::Lease("not supported".into());
        assert!(err.to_string().starts_with("lease error"));
    }
}
