//! Ambient transactions.
//!
//! A [`Transaction`] is discovered explicitly: callers pass the handle to
//! [`Coordinator::resolve_context`](crate::Coordinator::resolve_context)
//! rather than relying on thread-local state. Transaction contexts enlist in
//! the transaction and are prepared, committed or rolled back with it.

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{Enlistment, Transaction, TransactionStatus};
