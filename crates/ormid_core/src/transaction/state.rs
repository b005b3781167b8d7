//! Transaction handles and participants.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status of an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Work may be enlisted.
    Active,
    /// Participants are being prepared and committed.
    Committing,
    /// Every participant committed.
    Committed,
    /// Rolled back, explicitly or after a failure.
    Aborted,
}

impl TransactionStatus {
    /// Returns true once the transaction can no longer change.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// A participant in an ambient transaction.
///
/// `prepare` runs on every participant before any `commit`; a failing
/// `prepare` rolls every participant back.
pub trait Enlistment: Send + Sync {
    /// Does all the work that can fail before the durable commit.
    ///
    /// # Errors
    ///
    /// Any error vetoes the transaction.
    fn prepare(&self) -> CoreResult<()>;

    /// Makes the prepared work durable.
    ///
    /// # Errors
    ///
    /// Errors are reported to the committer and abort the participants that
    /// have not committed yet.
    fn commit(&self) -> CoreResult<()>;

    /// Discards the participant's work. Must tolerate repeated calls.
    fn rollback(&self);
}

type CompletionCallback = Box<dyn FnOnce(TransactionId, TransactionStatus) + Send>;

struct TxnState {
    status: TransactionStatus,
    abort_reason: Option<String>,
    enlistments: Vec<Arc<dyn Enlistment>>,
    callbacks: Vec<CompletionCallback>,
}

struct TransactionInner {
    id: TransactionId,
    state: Mutex<TxnState>,
    active: Arc<AtomicUsize>,
}

impl TransactionInner {
    /// Moves to a terminal status and runs completion callbacks, outside the
    /// state lock so callbacks may inspect the transaction.
    fn complete(&self, status: TransactionStatus) {
        let callbacks = {
            let mut state = self.state.lock();
            state.status = status;
            state.enlistments.clear();
            std::mem::take(&mut state.callbacks)
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(txn = %self.id, ?status, "transaction completed");
        for callback in callbacks {
            callback(self.id, status);
        }
    }

    fn abort(&self, reason: String) -> bool {
        let enlistments = {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::Active {
                return false;
            }
            state.status = TransactionStatus::Aborted;
            state.abort_reason = Some(reason);
            state.enlistments.clone()
        };
        for enlistment in &enlistments {
            enlistment.rollback();
        }
        self.complete(TransactionStatus::Aborted);
        true
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if self.state.get_mut().status == TransactionStatus::Active {
            warn!(txn = %self.id, "transaction dropped while active, rolling back");
            self.abort("transaction dropped without commit".to_string());
        }
    }
}

/// Handle to an ambient transaction.
///
/// Handles are cheap to clone and may be passed to other threads; every
/// clone refers to the same transaction. Work is attached by enlisting
/// participants, which the transaction prepares, commits or rolls back as a
/// unit.
///
/// Dropping the last handle of a transaction that is still active rolls it
/// back.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(TransactionInner {
                id,
                state: Mutex::new(TxnState {
                    status: TransactionStatus::Active,
                    abort_reason: None,
                    enlistments: Vec::new(),
                    callbacks: Vec::new(),
                }),
                active,
            }),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// Checks if work may still be enlisted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Checks if the transaction was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.status() == TransactionStatus::Aborted
    }

    /// Why the transaction was aborted, if it was.
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        self.inner.state.lock().abort_reason.clone()
    }

    /// Returns true if both handles refer to the same transaction.
    #[must_use]
    pub fn same_transaction(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attaches a participant.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` if the transaction was aborted, or
    /// `InvalidOperation` if it is committing or committed.
    pub fn enlist(&self, participant: Arc<dyn Enlistment>) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        match state.status {
            TransactionStatus::Active => {
                state.enlistments.push(participant);
                Ok(())
            }
            TransactionStatus::Aborted => Err(aborted_error(&state)),
            TransactionStatus::Committing | TransactionStatus::Committed => Err(
                CoreError::invalid_operation(format!("{} is no longer active", self.inner.id)),
            ),
        }
    }

    /// Registers a callback that runs exactly once when the transaction
    /// completes, on whichever thread completes it.
    ///
    /// If the transaction has already completed the callback runs
    /// immediately on the calling thread.
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce(TransactionId, TransactionStatus) + Send + 'static,
    {
        let status = {
            let mut state = self.inner.state.lock();
            if !state.status.is_completed() {
                state.callbacks.push(Box::new(callback));
                return;
            }
            state.status
        };
        callback(self.inner.id, status);
    }

    /// Aborts the transaction, rolling back every participant.
    ///
    /// Later attempts to use the transaction fail with `TransactionAborted`
    /// carrying `reason`. Has no effect unless the transaction is active.
    pub fn mark_aborted(&self, reason: impl Into<String>) {
        self.inner.abort(reason.into());
    }

    /// Rolls the transaction back.
    ///
    /// Rolling back an aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is committing or has
    /// committed.
    pub fn rollback(&self) -> CoreResult<()> {
        if self.inner.abort("rolled back".to_string()) {
            return Ok(());
        }
        match self.status() {
            TransactionStatus::Aborted => Ok(()),
            _ => Err(CoreError::invalid_operation(format!(
                "{} cannot be rolled back after commit",
                self.inner.id
            ))),
        }
    }

    /// Prepares and commits every participant.
    ///
    /// If any participant fails to prepare, all participants are rolled back
    /// and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first participant error, `TransactionAborted` if the
    /// transaction was already aborted, or `InvalidOperation` if it already
    /// committed.
    pub fn commit(&self) -> CoreResult<()> {
        let enlistments = {
            let mut state = self.inner.state.lock();
            match state.status {
                TransactionStatus::Active => {
                    state.status = TransactionStatus::Committing;
                    state.enlistments.clone()
                }
                TransactionStatus::Aborted => return Err(aborted_error(&state)),
                TransactionStatus::Committing | TransactionStatus::Committed => {
                    return Err(CoreError::invalid_operation(format!(
                        "{} already committed",
                        self.inner.id
                    )))
                }
            }
        };

        for enlistment in &enlistments {
            if let Err(err) = enlistment.prepare() {
                self.fail(&enlistments, 0, &err);
                return Err(err);
            }
        }

        for (index, enlistment) in enlistments.iter().enumerate() {
            if let Err(err) = enlistment.commit() {
                if index > 0 {
                    warn!(
                        txn = %self.inner.id,
                        committed = index,
                        "participant failed to commit after others committed"
                    );
                }
                self.fail(&enlistments, index, &err);
                return Err(err);
            }
        }

        self.inner.complete(TransactionStatus::Committed);
        Ok(())
    }

    /// Rolls back the participants from `from` onward and completes aborted.
    fn fail(&self, enlistments: &[Arc<dyn Enlistment>], from: usize, err: &CoreError) {
        self.inner.state.lock().abort_reason = Some(err.to_string());
        for enlistment in &enlistments[from..] {
            enlistment.rollback();
        }
        self.inner.complete(TransactionStatus::Aborted);
    }
}

fn aborted_error(state: &TxnState) -> CoreError {
    CoreError::transaction_aborted(
        state
            .abort_reason
            .clone()
            .unwrap_or_else(|| "aborted".to_string()),
    )
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
