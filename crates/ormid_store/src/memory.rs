//! In-memory scripted store driver.

use crate::driver::{
    BufferedReader, Command, ExecuteOutcome, IsolationLevel, RowReader, StoreConnection,
    StoreDriver,
};
use crate::error::{StoreError, StoreResult};
use crate::value::{Row, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An in-memory store driver.
///
/// The driver does not interpret SQL beyond two things: it answers queries
/// from result sets scripted by exact SQL text, and it assigns increasing
/// integers to the columns named in a trailing `RETURNING` clause. It is
/// suitable for:
/// - Unit and integration tests
/// - Exercising transaction and failure paths without a database
///
/// Statements executed inside a transaction are held per connection and only
/// become visible through [`MemoryDriver::committed_statements`] once the
/// transaction commits.
///
/// # Thread Safety
///
/// The driver is cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust
/// use ormid_store::{Command, IsolationLevel, MemoryDriver, StoreConnection, StoreDriver};
///
/// let driver = MemoryDriver::new();
/// let mut conn = driver.connect().unwrap();
/// conn.begin_transaction(IsolationLevel::Unspecified).unwrap();
/// let outcome = conn
///     .execute(&Command::new("INSERT INTO dog (name) VALUES (?) RETURNING id"))
///     .unwrap();
/// assert!(outcome.returned.get("id").is_some());
/// conn.commit().unwrap();
/// assert_eq!(driver.committed_statements().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    shared: Arc<Mutex<MemoryState>>,
    mars: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<Command>,
    result_sets: HashMap<String, Vec<Row>>,
    faults: Vec<(String, StoreFault)>,
    commit_fault: Option<String>,
    latency: Option<Duration>,
    next_generated: i64,
    open_connections: usize,
    connections_opened: usize,
    rollbacks: usize,
}

/// Failure injected into statements whose SQL contains a given fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    /// The store rejects the statement with this message.
    Reject(String),
    /// The statement is cancelled.
    Cancel,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Creates a driver that supports multiple active result sets.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MemoryState {
                next_generated: 1,
                ..MemoryState::default()
            })),
            mars: true,
        }
    }

    /// Creates a driver whose connections allow only one open result set.
    #[must_use]
    pub fn without_mars() -> Self {
        Self {
            mars: false,
            ..Self::new()
        }
    }

    /// Serves `rows` for every query whose SQL equals `sql`.
    pub fn script_result(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.shared.lock().result_sets.insert(sql.into(), rows);
    }

    /// Makes every statement containing `fragment` fail with `fault`.
    pub fn fail_on(&self, fragment: impl Into<String>, fault: StoreFault) {
        self.shared.lock().faults.push((fragment.into(), fault));
    }

    /// Removes all injected statement faults.
    pub fn clear_faults(&self) {
        self.shared.lock().faults.clear();
    }

    /// Makes the next commit on any connection fail with `message`.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.shared.lock().commit_fault = Some(message.into());
    }

    /// Simulated execution time of every statement.
    ///
    /// Statements whose timeout is shorter than the latency fail with
    /// [`StoreError::Timeout`].
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.shared.lock().latency = latency;
    }

    /// SQL of every statement that became durable, in commit order.
    #[must_use]
    pub fn committed_statements(&self) -> Vec<String> {
        self.shared
            .lock()
            .committed
            .iter()
            .map(|c| c.sql.clone())
            .collect()
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.shared.lock().open_connections
    }

    /// Connections opened over the driver's lifetime.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.shared.lock().connections_opened
    }

    /// Number of physical rollbacks performed.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.shared.lock().rollbacks
    }
}

impl StoreDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        {
            let mut state = self.shared.lock();
            state.open_connections += 1;
            state.connections_opened += 1;
        }
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            mars: self.mars,
            pending: None,
            closed: false,
            active_reader: None,
        }))
    }

    fn supports_multiple_active_result_sets(&self) -> bool {
        self.mars
    }

    fn decorate_error(&self, error: &StoreError, sql: Option<&str>) -> Option<String> {
        sql.map(|sql| format!("memory store: {error} while executing `{sql}`"))
    }
}

struct MemoryConnection {
    shared: Arc<Mutex<MemoryState>>,
    mars: bool,
    /// Statements of the open transaction, if any.
    pending: Option<Vec<Command>>,
    closed: bool,
    active_reader: Option<Arc<AtomicBool>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if !self.mars {
            if let Some(flag) = &self.active_reader {
                if flag.load(Ordering::SeqCst) {
                    return Err(StoreError::ReaderOpen);
                }
            }
        }
        Ok(())
    }

    fn check_faults(&self, command: &Command) -> StoreResult<()> {
        let state = self.shared.lock();
        if let (Some(latency), Some(timeout)) = (state.latency, command.timeout) {
            if latency > timeout {
                return Err(StoreError::Timeout(timeout));
            }
        }
        for (fragment, fault) in &state.faults {
            if command.sql.contains(fragment.as_str()) {
                return Err(match fault {
                    StoreFault::Reject(message) => StoreError::rejected(message.clone()),
                    StoreFault::Cancel => StoreError::Cancelled,
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, command: &Command) {
        match &mut self.pending {
            Some(pending) => pending.push(command.clone()),
            None => self.shared.lock().committed.push(command.clone()),
        }
    }
}

/// Column names listed after a trailing `RETURNING`.
fn returning_columns(sql: &str) -> Vec<String> {
    let upper = sql.to_ascii_uppercase();
    match upper.rfind(" RETURNING ") {
        Some(pos) => sql[pos + " RETURNING ".len()..]
            .split(',')
            .map(|c| c.trim().trim_end_matches(';').to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

impl StoreConnection for MemoryConnection {
    fn begin_transaction(&mut self, _isolation: IsolationLevel) -> StoreResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> StoreResult<ExecuteOutcome> {
        self.ensure_open()?;
        self.check_faults(command)?;

        let mut returned = Row::new();
        let columns = returning_columns(&command.sql);
        if !columns.is_empty() {
            let mut state = self.shared.lock();
            for column in columns {
                let id = state.next_generated;
                state.next_generated += 1;
                returned.push(column, Value::BigInt(id));
            }
        }

        self.record(command);
        Ok(ExecuteOutcome {
            rows_affected: 1,
            returned,
        })
    }

    fn execute_reader(&mut self, command: &Command) -> StoreResult<Box<dyn RowReader>> {
        self.ensure_open()?;
        self.check_faults(command)?;

        let rows = self
            .shared
            .lock()
            .result_sets
            .get(&command.sql)
            .cloned()
            .unwrap_or_default();
        let open = Arc::new(AtomicBool::new(true));
        self.active_reader = Some(Arc::clone(&open));
        Ok(Box::new(MemoryReader {
            inner: BufferedReader::new(rows),
            open,
        }))
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let pending = self.pending.take().ok_or(StoreError::NoTransaction)?;
        let mut state = self.shared.lock();
        if let Some(message) = state.commit_fault.take() {
            state.rollbacks += 1;
            return Err(StoreError::rejected(message));
        }
        state.committed.extend(pending);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if self.pending.take().is_none() {
            return Err(StoreError::NoTransaction);
        }
        self.shared.lock().rollbacks += 1;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.pending.take().is_some() {
            self.shared.lock().rollbacks += 1;
        }
        self.closed = true;
        self.active_reader = None;
        self.shared.lock().open_connections -= 1;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryReader {
    inner: BufferedReader,
    open: Arc<AtomicBool>,
}

impl RowReader for MemoryReader {
    fn next_row(&mut self) -> StoreResult<Option<Row>> {
        let row = self.inner.next_row()?;
        if row.is_none() {
            self.open.store(false, Ordering::SeqCst);
        }
        Ok(row)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(sql: &str) -> Command {
        Command::new(sql).with_params(vec![Value::from("rex")])
    }

    #[test]
    fn statements_become_durable_on_commit() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect().unwrap();
        conn.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        conn.execute(&insert("INSERT INTO dog (name) VALUES (?)"))
            .unwrap();
        assert!(driver.committed_statements().is_empty());

        conn.commit().unwrap();
        assert_eq!(driver.committed_statements().len(), 1);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn rollback_discards_pending() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect().unwrap();
        conn.begin_transaction(IsolationLevel::Unspecified).unwrap();
        conn.execute(&insert("INSERT INTO dog (name) VALUES (?)"))
            .unwrap();
        conn.rollback().unwrap();

        assert!(driver.committed_statements().is_empty());
        assert_eq!(driver.rollbacks(), 1);
        assert!(matches!(conn.rollback(), Err(StoreError::NoTransaction)));
    }

    #[test]
    fn returning_assigns_increasing_values() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect().unwrap();
        let sql = "INSERT INTO dog (name) VALUES (?) RETURNING id";
        let first = conn.execute(&insert(sql)).unwrap();
        let second = conn.execute(&insert(sql)).unwrap();
        assert_eq!(first.returned.get("id"), Some(&Value::BigInt(1)));
        assert_eq!(second.returned.get("id"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn returning_columns_parsed() {
        assert_eq!(
            returning_columns("INSERT INTO t (a) VALUES (?) RETURNING id, seq"),
            vec!["id".to_string(), "seq".to_string()]
        );
        assert!(returning_columns("INSERT INTO t (a) VALUES (?)").is_empty());
    }

    #[test]
    fn injected_fault_rejects_statement() {
        let driver = MemoryDriver::new();
        driver.fail_on("INTO cat", StoreFault::Reject("no cats".into()));
        let mut conn = driver.connect().unwrap();

        let err = conn.execute(&Command::new("INSERT INTO cat (id) VALUES (1)"));
        assert!(matches!(err, Err(StoreError::Rejected { .. })));
        assert!(conn.execute(&Command::new("INSERT INTO dog (id) VALUES (1)")).is_ok());
    }

    #[test]
    fn latency_beyond_timeout_times_out() {
        let driver = MemoryDriver::new();
        driver.set_latency(Some(Duration::from_millis(50)));
        let mut conn = driver.connect().unwrap();
        let command = Command::new("UPDATE dog SET name = ?")
            .with_timeout(Some(Duration::from_millis(10)));

        assert!(matches!(conn.execute(&command), Err(StoreError::Timeout(_))));
    }

    #[test]
    fn single_reader_connection_refuses_second_command() {
        let driver = MemoryDriver::without_mars();
        driver.script_result("SELECT * FROM dog", vec![Row::new().with("id", 1i64)]);
        let mut conn = driver.connect().unwrap();

        let mut reader = conn.execute_reader(&Command::new("SELECT * FROM dog")).unwrap();
        assert!(matches!(
            conn.execute_reader(&Command::new("SELECT * FROM dog")),
            Err(StoreError::ReaderOpen)
        ));

        while reader.next_row().unwrap().is_some() {}
        assert!(conn.execute_reader(&Command::new("SELECT * FROM dog")).is_ok());
    }

    #[test]
    fn commit_fault_fails_once() {
        let driver = MemoryDriver::new();
        driver.fail_next_commit("serialization failure");
        let mut conn = driver.connect().unwrap();
        conn.begin_transaction(IsolationLevel::Serializable).unwrap();
        assert!(conn.commit().is_err());
        assert!(!conn.in_transaction());

        conn.begin_transaction(IsolationLevel::Serializable).unwrap();
        assert!(conn.commit().is_ok());
    }

    #[test]
    fn close_tracks_open_connections() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect().unwrap();
        assert_eq!(driver.open_connections(), 1);
        conn.close();
        conn.close();
        assert_eq!(driver.open_connections(), 0);
        assert!(matches!(
            conn.execute(&Command::new("SELECT 1")),
            Err(StoreError::Closed)
        ));
        drop(conn);
        assert_eq!(driver.open_connections(), 0);
        assert_eq!(driver.connections_opened(), 1);
    }
}
