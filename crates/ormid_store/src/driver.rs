//! Store driver contract.

use crate::error::{StoreError, StoreResult};
use crate::value::{Row, Value};
use std::time::Duration;

/// Isolation level requested when a physical transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Let the store pick.
    #[default]
    Unspecified,
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is visible.
    ReadCommitted,
    /// Rows read once stay stable.
    RepeatableRead,
    /// Snapshot isolation.
    Snapshot,
    /// Full serializability.
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the level, if the level has one.
    #[must_use]
    pub const fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Unspecified => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Snapshot => Some("SNAPSHOT"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// A statement ready to be sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// SQL text.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<Value>,
    /// Upper bound on execution time.
    pub timeout: Option<Duration>,
}

impl Command {
    /// Creates a command without parameters or timeout.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a non-query statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    /// Number of rows the statement touched.
    pub rows_affected: u64,
    /// Values produced by the store for the statement (`RETURNING` columns),
    /// such as server-generated keys.
    pub returned: Row,
}

/// A forward-only cursor over the rows of one result set.
pub trait RowReader: Send {
    /// Returns the next row, or `None` once the result set is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while streaming the result.
    fn next_row(&mut self) -> StoreResult<Option<Row>>;
}

/// A reader over rows already held in memory.
#[derive(Debug, Default)]
pub struct BufferedReader {
    rows: std::collections::VecDeque<Row>,
}

impl BufferedReader {
    /// Wraps the given rows.
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    /// Drains another reader completely into memory.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by `reader`.
    pub fn drain(reader: &mut dyn RowReader) -> StoreResult<Self> {
        let mut rows = std::collections::VecDeque::new();
        while let Some(row) = reader.next_row()? {
            rows.push_back(row);
        }
        Ok(Self { rows })
    }

    /// Rows not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowReader for BufferedReader {
    fn next_row(&mut self) -> StoreResult<Option<Row>> {
        Ok(self.rows.pop_front())
    }
}

/// One physical connection to the store.
///
/// A connection is owned by exactly one command boundary at a time; it is
/// `Send` so it can move between threads but never shared.
///
/// # Invariants
///
/// - `commit`/`rollback` fail with [`StoreError::NoTransaction`] when no
///   transaction is open
/// - once `close` has run, every operation fails with [`StoreError::Closed`]
pub trait StoreConnection: Send {
    /// Opens a physical transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or the store refuses.
    fn begin_transaction(&mut self, isolation: IsolationLevel) -> StoreResult<()>;

    /// Executes a statement that returns no result set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the statement or it times out.
    fn execute(&mut self, command: &Command) -> StoreResult<ExecuteOutcome>;

    /// Executes a query and returns a reader over its rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the statement or it times out.
    fn execute_reader(&mut self, command: &Command) -> StoreResult<Box<dyn RowReader>>;

    /// Commits the open physical transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is then gone.
    fn commit(&mut self) -> StoreResult<()>;

    /// Rolls back the open physical transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to roll back.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Returns true while a physical transaction is open.
    fn in_transaction(&self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&mut self);

    /// Returns true once the connection has been closed.
    fn is_closed(&self) -> bool;
}

/// Factory for connections plus store-specific diagnostics.
pub trait StoreDriver: Send + Sync {
    /// Short driver name used in logs.
    fn name(&self) -> &str;

    /// Opens a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>>;

    /// Whether a connection can keep several result sets open at once.
    fn supports_multiple_active_result_sets(&self) -> bool;

    /// Produces extra diagnostic text for `error`, given the SQL that failed.
    ///
    /// Returns `None` when the driver has nothing to add.
    fn decorate_error(&self, error: &StoreError, sql: Option<&str>) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_sql_names() {
        assert_eq!(IsolationLevel::Unspecified.as_sql(), None);
        assert_eq!(
            IsolationLevel::Serializable.as_sql(),
            Some("SERIALIZABLE")
        );
    }

    #[test]
    fn buffered_reader_drains_in_order() {
        let mut source = BufferedReader::new(vec![
            Row::new().with("n", 1i64),
            Row::new().with("n", 2i64),
        ]);
        let mut copy = BufferedReader::drain(&mut source).unwrap();
        assert_eq!(source.remaining(), 0);
        assert_eq!(copy.remaining(), 2);
        assert_eq!(
            copy.next_row().unwrap().unwrap().get("n"),
            Some(&Value::BigInt(1))
        );
    }
}
