//! Transaction manager.

use crate::error::CoreResult;
use crate::transaction::state::Transaction;
use crate::types::TransactionId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Issues ambient transactions.
///
/// Transaction IDs are monotonically increasing and never reused by one
/// manager. The manager does not own the transactions it issues; it only
/// counts how many are still active.
#[derive(Debug)]
pub struct TransactionManager {
    /// Next transaction ID.
    next_txid: AtomicU64,
    /// Transactions issued and not yet completed.
    active: Arc<AtomicUsize>,
}

impl TransactionManager {
    /// Creates a new transaction manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_txid: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Begins a new transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        Transaction::new(id, Arc::clone(&self.active))
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Executes a function within a transaction.
    ///
    /// If the function returns `Ok`, the transaction is committed.
    /// If it returns `Err`, the transaction is rolled back.
    ///
    /// # Errors
    ///
    /// Returns the function's error, or the commit error.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        let txn = self.begin();
        match f(&txn) {
            Ok(result) => {
                txn.commit()?;
                Ok(result)
            }
            Err(e) => {
                // Roll back, keeping the original error.
                if let Err(rollback) = txn.rollback() {
                    warn!(txn = %txn.id(), error = %rollback, "rollback after failed unit of work failed");
                }
                Err(e)
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::transaction::TransactionStatus;

    #[test]
    fn ids_increase() {
        let manager = TransactionManager::new();
        let a = manager.begin();
        let b = manager.begin();
        assert!(b.id() > a.id());
        assert_eq!(manager.active_count(), 2);

        a.commit().unwrap();
        b.rollback().unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn transaction_helper() {
        let manager = TransactionManager::new();
        let mut seen = None;
        let value = manager
            .transaction(|txn| {
                seen = Some(txn.clone());
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(seen.unwrap().status(), TransactionStatus::Committed);
    }

    #[test]
    fn transaction_helper_rolls_back_on_error() {
        let manager = TransactionManager::new();
        let mut seen = None;
        let result: CoreResult<()> = manager.transaction(|txn| {
            seen = Some(txn.clone());
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert!(seen.unwrap().is_aborted());
        assert_eq!(manager.active_count(), 0);
    }
}
