//! Error types for ormid core.

use ormid_store::StoreError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ormid core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A write was attempted with no transaction in scope.
    #[error("write operation must be performed inside a transaction")]
    NoActiveTransaction,

    /// The transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Commit was attempted with an entity whose primary key never became ready.
    #[error("the object {entity} is missing a primary key")]
    MissingOrInvalidPrimaryKey {
        /// Description of the offending entity.
        entity: String,
    },

    /// Two distinct new instances resolved to the same primary key.
    #[error("an object with the same primary key already exists: {entity}")]
    DuplicateObject {
        /// Description of the rejected entity.
        entity: String,
    },

    /// The store rejected a statement.
    #[error("statement failed: {message} (sql: {sql})")]
    StatementExecutionFailed {
        /// SQL text of the failing statement.
        sql: String,
        /// Message reported by the store.
        message: String,
        /// Driver-specific diagnostic, when the driver supplies one.
        diagnostic: Option<String>,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Store error outside of statement execution (connect, close).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The owning data model has been disposed.
    #[error("data model has been disposed")]
    ModelDisposed,

    /// No entity type with this name is registered.
    #[error("unknown entity type: {name}")]
    UnknownEntityType {
        /// Requested type name.
        name: String,
    },

    /// An identity cache was requested with a key type other than the one it
    /// was created with.
    #[error("identity cache for {entity_type} uses a different key type")]
    CacheKeyMismatch {
        /// Entity type name.
        entity_type: String,
    },
}

impl CoreError {
    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a missing primary key error.
    pub fn missing_primary_key(entity: impl Into<String>) -> Self {
        Self::MissingOrInvalidPrimaryKey {
            entity: entity.into(),
        }
    }

    /// Creates a duplicate object error.
    pub fn duplicate_object(entity: impl Into<String>) -> Self {
        Self::DuplicateObject {
            entity: entity.into(),
        }
    }

    /// Returns true if this error came from the store rejecting a statement.
    #[must_use]
    pub fn is_statement_failure(&self) -> bool {
        matches!(self, Self::StatementExecutionFailed { .. })
    }
}
