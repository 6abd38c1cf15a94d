// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (peer transport, task store,
//! checkpoint protocol) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Timeouts, connection resets against a peer |
//! | `FeedParse` | No | Malformed change-feed event |
//! | `CheckpointConflict` | No | Another writer owns this replication id |
//! | `MissingTarget` | No | Target absent and `create_target` is off |
//! | `Unauthorized` | No | Peer rejected our credentials |
//! | `TaskStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Task descriptor invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Replication is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retries are scoped to a single peer call,
//! never to a whole batch: a worker that exhausts its retries fails the
//! document, not the batch.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport failure against a peer.
    ///
    /// Timeouts, connection drops, 5xx responses. Retryable with backoff.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Change-feed event parsing failure.
    ///
    /// The event is malformed at the source. Not retryable.
    #[error("Feed parse error: {0}")]
    FeedParse(String),

    /// Checkpoint document revision conflict.
    ///
    /// Another manager instance is writing checkpoints for the same
    /// replication id. Fatal to this run; ownership must be resolved by
    /// an operator, so the manager never auto-restarts after this.
    #[error("Checkpoint conflict for replication {rep_id} on {peer}")]
    CheckpointConflict { rep_id: String, peer: String },

    /// Target database does not exist and `create_target` is disabled.
    #[error("Target does not exist: {0}")]
    MissingTarget(String),

    /// Peer rejected the configured credentials.
    #[error("Unauthorized against peer {0}")]
    Unauthorized(String),

    /// SQLite error from the manager's task store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Task store error: {0}")]
    TaskStore(#[from] sqlx::Error),

    /// Invalid replication task descriptor.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// An operation was attempted in the wrong state (e.g. starting an
    /// already-running replication). Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error with an operation label.
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error from a reqwest error.
    pub fn transport_from(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true, // Network errors are retryable
            Self::FeedParse(_) => false,    // Data corruption
            Self::CheckpointConflict { .. } => false,
            Self::MissingTarget(_) => false,
            Self::Unauthorized(_) => false,
            Self::TaskStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error aborts the whole replication rather than a
    /// single document or request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CheckpointConflict { .. } | Self::MissingTarget(_) | Self::Unauthorized(_)
        )
    }
}
