//! Error types for GridStore
//!
//! This module defines the common error taxonomy used throughout the system.

use thiserror::Error;

/// Common result type for GridStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for GridStore
#[derive(Debug, Error)]
pub enum Error {
    // Memory errors
    #[error("memory policy {policy} exhausted: requested {requested} bytes, budget {budget} bytes")]
    OutOfMemory {
        policy: String,
        requested: u64,
        budget: u64,
    },

    #[error("entry too large: {size} bytes, page capacity {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    // Durability errors
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("corrupt WAL at lsn {lsn}: {reason}")]
    CorruptLog { lsn: u64, reason: String },

    #[error("corrupt page store: {0}")]
    CorruptPageStore(String),

    #[error("node stopped after a fatal error")]
    NodeFailed,

    #[error("node is not ready: {0}")]
    NotReady(String),

    // Lifecycle errors
    #[error("cache already exists: {0}")]
    CacheAlreadyExists(String),

    #[error("cache not found: {0}")]
    CacheNotFound(String),

    // Routing errors
    #[error("stale topology: request computed for epoch {requested}, current epoch is {current}")]
    StaleTopology { requested: u64, current: u64 },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an I/O failure with context
    pub fn io(context: &str, e: impl std::fmt::Display) -> Self {
        Self::IoFailure(format!("{context}: {e}"))
    }

    /// Create a WAL corruption error
    pub fn corrupt_log(lsn: u64, reason: impl Into<String>) -> Self {
        Self::CorruptLog {
            lsn,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Only routing against a superseded topology is retryable: the caller
    /// refreshes its topology view and tries again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleTopology { .. })
    }

    /// Check if this error must halt the node's participation
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IoFailure(_)
                | Self::CorruptLog { .. }
                | Self::CorruptPageStore(_)
                | Self::NodeFailed
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::CacheNotFound(_))
    }
}
