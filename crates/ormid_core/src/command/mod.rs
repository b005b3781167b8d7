//! Statement execution against the store.
//!
//! A [`CommandBoundary`] owns one physical connection for one transaction
//! context; a [`SqlDialect`] turns entity writes into SQL.

mod boundary;
mod dialect;

pub use boundary::{CommandBoundary, ResultSet};
pub use dialect::{BasicDialect, SqlDialect};
