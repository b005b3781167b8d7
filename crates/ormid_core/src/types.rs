//! Core type definitions for ormid.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an ambient transaction.
///
/// Transaction IDs are monotonically increasing and never reused within a
/// [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Reference identity of one entity instance.
///
/// Two handles are the same instance iff their IDs are equal. IDs are unique
/// for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl InstanceId {
    /// Allocates a fresh instance ID.
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a transaction context.
///
/// ```text
/// Created -> Active -> Committing -> Committed | Failed
///            Active -> RollingBack -> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Context exists but nothing has touched it yet.
    Created,
    /// Reads and writes are permitted.
    Active,
    /// Pending writes are being flushed and committed.
    Committing,
    /// The bound transaction committed; caches are reconciled.
    Committed,
    /// Commit failed; the context awaits rollback.
    Failed,
    /// The physical transaction is being rolled back.
    RollingBack,
    /// The bound transaction rolled back; caches were discarded.
    RolledBack,
}

impl ContextState {
    /// Returns true for `Committed` and `RolledBack`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, ContextState::Committed | ContextState::RolledBack)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Created => "created",
            ContextState::Active => "active",
            ContextState::Committing => "committing",
            ContextState::Committed => "committed",
            ContextState::Failed => "failed",
            ContextState::RollingBack => "rolling back",
            ContextState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn terminal_states() {
        assert!(ContextState::Committed.is_terminal());
        assert!(ContextState::RolledBack.is_terminal());
        assert!(!ContextState::Failed.is_terminal());
        assert!(!ContextState::Committing.is_terminal());
    }

    #[test]
    fn transaction_id_display() {
        assert_eq!(TransactionId::new(7).to_string(), "txn:7");
    }
}
