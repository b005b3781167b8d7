//! Ambient transaction coordination.

use crate::context::TransactionContext;
use crate::error::{CoreError, CoreResult};
use crate::model::ModelShared;
use crate::transaction::{Transaction, TransactionStatus};
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::debug;

/// Maps active transactions to their contexts.
///
/// Shared by every coordinator of a data model, so threads participating in
/// the same transaction resolve the same context.
#[derive(Default)]
pub(crate) struct BindingTable {
    contexts: Mutex<HashMap<TransactionId, Arc<TransactionContext>>>,
}

impl BindingTable {
    /// Returns the context bound to `txn`, creating and enlisting one if
    /// there is none. Find-or-create runs under the table lock.
    fn bind(
        self: &Arc<Self>,
        shared: &Arc<ModelShared>,
        txn: &Transaction,
    ) -> CoreResult<Arc<TransactionContext>> {
        let context = {
            let mut contexts = self.contexts.lock();
            if let Some(existing) = contexts.get(&txn.id()) {
                return Ok(Arc::clone(existing));
            }
            let context = Arc::new(TransactionContext::new(
                Arc::clone(shared),
                Some(txn.id()),
            ));
            txn.enlist(context.clone())?;
            contexts.insert(txn.id(), Arc::clone(&context));
            context
        };

        // Registered outside the table lock: if the transaction completed
        // meanwhile the callback runs right here.
        let table: Weak<BindingTable> = Arc::downgrade(self);
        txn.on_completed(move |id, status| {
            if let Some(table) = table.upgrade() {
                table.remove(id);
                debug!(txn = %id, ?status, "transaction context unbound");
            }
        });
        Ok(context)
    }

    fn remove(&self, id: TransactionId) {
        self.contexts.lock().remove(&id);
    }

    pub(crate) fn get(&self, id: TransactionId) -> Option<Arc<TransactionContext>> {
        self.contexts.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.lock().len()
    }
}

/// Resolves the transaction context for one calling thread of a data model.
///
/// Obtain coordinators from [`DataModel::coordinator`](crate::DataModel::coordinator);
/// the model owns them and disposes them with itself.
pub struct Coordinator {
    shared: Arc<ModelShared>,
    thread: ThreadId,
    root: Mutex<Option<Arc<TransactionContext>>>,
    disposed: AtomicBool,
}

impl Coordinator {
    pub(crate) fn new(shared: Arc<ModelShared>, thread: ThreadId) -> Self {
        Self {
            shared,
            thread,
            root: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Thread this coordinator serves.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Returns the context for `ambient`.
    ///
    /// - With an active transaction, returns the context bound to it,
    ///   creating and enlisting it on first use.
    /// - Without a transaction, reads get this coordinator's root context.
    ///
    /// # Errors
    ///
    /// - `NoActiveTransaction` for a write without a transaction
    /// - `TransactionAborted` if the transaction was aborted
    /// - `InvalidOperation` if the transaction is committing or committed
    /// - `ModelDisposed` after disposal
    pub fn resolve_context(
        &self,
        ambient: Option<&Transaction>,
        for_write: bool,
    ) -> CoreResult<Arc<TransactionContext>> {
        if self.is_disposed() {
            return Err(CoreError::ModelDisposed);
        }
        match ambient {
            Some(txn) => match txn.status() {
                TransactionStatus::Active => self.shared.bindings.bind(&self.shared, txn),
                TransactionStatus::Aborted => Err(CoreError::transaction_aborted(
                    txn.abort_reason().unwrap_or_else(|| "aborted".to_string()),
                )),
                status => Err(CoreError::invalid_operation(format!(
                    "{} is {status:?}",
                    txn.id()
                ))),
            },
            None if for_write => Err(CoreError::NoActiveTransaction),
            None => self.root_context(),
        }
    }

    /// Returns the non-transactional root context, creating it lazily.
    ///
    /// # Errors
    ///
    /// Returns `ModelDisposed` after disposal.
    pub fn root_context(&self) -> CoreResult<Arc<TransactionContext>> {
        let mut root = self.root.lock();
        if self.is_disposed() {
            return Err(CoreError::ModelDisposed);
        }
        let context = root.get_or_insert_with(|| {
            Arc::new(TransactionContext::new(Arc::clone(&self.shared), None))
        });
        Ok(Arc::clone(context))
    }

    /// Returns true once disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tears down the root context. Idempotent.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(root) = self.root.lock().take() {
            root.dispose();
        }
        debug!(thread = ?self.thread, "coordinator disposed");
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("thread", &self.thread)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
