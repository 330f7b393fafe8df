//! # Error Handling for Paged Topics
//!
//! A single error enum ([`Error`]) covers every failure a caller can observe.
//!
//! ## What Is NOT an Error
//!
//! Backpressure and cursor outcomes are ordinary return values:
//!
//! | Outcome | Where | Caller reaction |
//! |---------|-------|-----------------|
//! | `TopicFull` | offer | wait for a removal notification, retry |
//! | `PageSealed` | offer | move to the next page |
//! | `Exhausted` | poll | move to the next page |
//! | `UnknownSubscriber` | poll | reconnect and re-initialise |
//! | `AlreadyCommitted` | commit | nothing to do |
//!
//! Everything in this module is something the caller did wrong, a lifecycle
//! boundary (closed queue, shut down partition), or an internal failure.
//!
//! ## Rust Pattern: Clone-able Errors
//!
//! A failed batch completes many futures with the same error, so [`Error`]
//! is `Clone`. The SQLite error is kept behind an `Arc` for that reason.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{ChannelId, Position};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in topic operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Protocol Rejections
    // =========================================================================
    /// The channel is outside the topic's current channel range.
    #[error("invalid channel {channel} (topic has {channel_count} channels)")]
    InvalidChannel {
        channel: ChannelId,
        channel_count: u32,
    },

    /// The channel count given does not match the topic's channel count.
    #[error("channel count changed: expected {expected}, topic has {actual}")]
    ChannelCountChanged { expected: u32, actual: u32 },

    /// An existing subscriber group was joined with a different filter or
    /// transform than the one it was created with.
    #[error("subscriber group '{group}' exists with a different filter or transform")]
    FilterMismatch { group: String },

    /// A filter or transform name was not found in the function registry.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// A position that can never be committed or sought (null page, sentinel offset).
    #[error("invalid position {0}")]
    InvalidPosition(Position),

    /// The subscriber group has no subscription in this topic.
    #[error("unknown subscriber group '{0}'")]
    UnknownGroup(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The batching queue was closed; no more operations are accepted.
    #[error("queue is no longer active")]
    QueueInactive,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The topic (or one of its partitions) has shut down.
    #[error("topic closed: {0}")]
    Closed(String),

    /// A wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A batch failed as a whole; every element carries this message.
    #[error("batch failed: {0}")]
    Batch(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// SQLite database error.
    #[error("sqlite error: {0}")]
    Sqlite(Arc<rusqlite::Error>),

    /// Schema or migration error.
    #[error("schema error: {0}")]
    Schema(String),

    /// Persisted data could not be decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Filesystem error while opening a topic directory.
    #[error("io error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Returns true if the error means "this instance is finished, stop using it".
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::QueueInactive | Error::Closed(_))
    }
}

/// Result type alias for topic operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
