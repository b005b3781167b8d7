//! Error types for store operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a store driver or one of its connections.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred while talking to the store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store rejected a statement.
    #[error("statement rejected: {message}")]
    Rejected {
        /// Store-provided message.
        message: String,
        /// Store-specific error code (SQLSTATE or similar), if any.
        code: Option<String>,
    },

    /// The statement did not finish within its timeout.
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    /// The statement was cancelled before completion.
    #[error("statement cancelled")]
    Cancelled,

    /// The connection is closed.
    #[error("connection is closed")]
    Closed,

    /// No physical transaction is open on the connection.
    #[error("no transaction in progress")]
    NoTransaction,

    /// A physical transaction is already open on the connection.
    #[error("transaction already in progress")]
    TransactionInProgress,

    /// A result set is still open and the connection cannot multiplex readers.
    #[error("a result set is already open on this connection")]
    ReaderOpen,
}

impl StoreError {
    /// Creates a rejected-statement error without a code.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a rejected-statement error carrying a store error code.
    pub fn rejected_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Returns true for timeout and cancellation.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Cancelled)
    }
}
