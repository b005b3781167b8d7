//! Transactional command boundary.

use crate::command::dialect::SqlDialect;
use crate::config::ModelConfig;
use crate::entity::{EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use ormid_store::{
    BufferedReader, Command, ExecuteOutcome, Row, RowReader, StoreConnection, StoreDriver,
    StoreError, Value,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

enum ReaderState {
    Live(Box<dyn RowReader>),
    Buffered(BufferedReader),
    Closed,
}

/// Rows returned by [`CommandBoundary::execute_reader`].
///
/// On connections that cannot keep several result sets open, the boundary
/// may move the remaining rows into memory before running another command;
/// reading continues transparently either way.
#[derive(Clone)]
pub struct ResultSet {
    state: Arc<Mutex<ReaderState>>,
}

impl ResultSet {
    fn live(reader: Box<dyn RowReader>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReaderState::Live(reader))),
        }
    }

    /// Returns the next row, or `None` once exhausted.
    ///
    /// # Errors
    ///
    /// Returns a store error if streaming fails; the result set is closed.
    pub fn next_row(&self) -> CoreResult<Option<Row>> {
        let mut state = self.state.lock();
        let next = match &mut *state {
            ReaderState::Live(reader) => reader.next_row(),
            ReaderState::Buffered(reader) => reader.next_row(),
            ReaderState::Closed => return Ok(None),
        };
        match next {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                *state = ReaderState::Closed;
                Ok(None)
            }
            Err(e) => {
                *state = ReaderState::Closed;
                Err(e.into())
            }
        }
    }

    /// Reads every remaining row.
    ///
    /// # Errors
    ///
    /// Returns the first streaming error.
    pub fn collect_rows(&self) -> CoreResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Releases the result set. Remaining rows are discarded.
    pub fn close(&self) {
        *self.state.lock() = ReaderState::Closed;
    }

    /// Returns true once every row was read or the set was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ReaderState::Closed)
    }

    /// Returns true if the remaining rows are held in memory.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(*self.state.lock(), ReaderState::Buffered(_))
    }

    /// Moves the remaining rows into memory, freeing the connection.
    fn buffer(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let ReaderState::Live(reader) = &mut *state {
            let buffered = BufferedReader::drain(reader.as_mut())?;
            debug!(rows = buffered.remaining(), "buffered open result set");
            *state = ReaderState::Buffered(buffered);
        }
        Ok(())
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("closed", &self.is_closed())
            .field("buffered", &self.is_buffered())
            .finish_non_exhaustive()
    }
}

struct BoundaryState {
    connection: Option<Box<dyn StoreConnection>>,
    timeout: Option<Duration>,
    open_reader: Option<ResultSet>,
    poisoned: Option<String>,
    // Columns written back by inserts of the open transaction.
    assigned: Vec<(EntityRef, Vec<String>)>,
}

/// Executes row-level statements for one transaction context over one
/// physical connection, and commits or rolls back that connection's
/// physical transaction.
///
/// The boundary owns its connection exclusively. Statement failures are
/// translated to [`CoreError::StatementExecutionFailed`] with the driver's
/// diagnostic attached, and poison the boundary: a poisoned boundary can
/// only be rolled back. Whatever happens, `commit` and `rollback` leave the
/// connection closed.
pub struct CommandBoundary {
    driver: Arc<dyn StoreDriver>,
    dialect: Arc<dyn SqlDialect>,
    transactional: bool,
    mars: bool,
    state: Mutex<BoundaryState>,
}

impl CommandBoundary {
    /// Opens a connection and, when `transactional`, begins a physical
    /// transaction at the configured isolation level.
    ///
    /// # Errors
    ///
    /// Returns a store error if connecting or beginning fails.
    pub fn open(
        driver: Arc<dyn StoreDriver>,
        dialect: Arc<dyn SqlDialect>,
        config: &ModelConfig,
        transactional: bool,
    ) -> CoreResult<Self> {
        let mut connection = driver.connect()?;
        if transactional {
            if let Err(e) = connection.begin_transaction(config.isolation_level) {
                connection.close();
                return Err(e.into());
            }
        }
        let mars = config
            .multiple_active_result_sets
            .unwrap_or_else(|| driver.supports_multiple_active_result_sets());
        debug!(driver = driver.name(), transactional, mars, "command boundary opened");
        Ok(Self {
            driver,
            dialect,
            transactional,
            mars,
            state: Mutex::new(BoundaryState {
                connection: Some(connection),
                timeout: config.command_timeout,
                open_reader: None,
                poisoned: None,
                assigned: Vec::new(),
            }),
        })
    }

    /// Overrides the timeout attached to commands that carry none.
    pub fn set_command_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().timeout = timeout;
    }

    /// Timeout attached to commands that carry none.
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    /// Returns true if the boundary runs inside a physical transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Returns true once a statement has failed.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    /// Returns true once the connection has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().connection.is_none()
    }

    /// Executes a statement that returns no rows.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` if the store rejects the statement,
    /// it times out or it is cancelled; `InvalidOperation` if the boundary
    /// is closed.
    pub fn execute(&self, command: Command) -> CoreResult<ExecuteOutcome> {
        let mut state = self.state.lock();
        self.run(&mut state, command, |conn, cmd| conn.execute(cmd))
    }

    /// Executes a query.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_reader(&self, command: Command) -> CoreResult<ResultSet> {
        let mut state = self.state.lock();
        let reader = self.run(&mut state, command, |conn, cmd| conn.execute_reader(cmd))?;
        let result = ResultSet::live(reader);
        state.open_reader = Some(result.clone());
        Ok(result)
    }

    /// Inserts new entities, writing store-assigned values (such as
    /// generated keys) back into each entity.
    ///
    /// Statements run in order; on failure, earlier inserts in the batch may
    /// have reached the store and are undone only by rolling back. Values
    /// written back are reset to null if the transaction does not commit.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` for the first failing statement.
    pub fn insert(&self, entity_type: &EntityType, entities: &[EntityRef]) -> CoreResult<()> {
        check_batch(entity_type, entities)?;
        let mut state = self.state.lock();
        for entity in entities {
            let command = self.dialect.insert(entity);
            let outcome = self.run(&mut state, command, |conn, cmd| conn.execute(cmd))?;
            let mut columns = Vec::with_capacity(outcome.returned.len());
            for (column, value) in outcome.returned.iter() {
                entity.assign_generated(column, value.clone());
                columns.push(column.to_string());
            }
            if !columns.is_empty() {
                state.assigned.push((Arc::clone(entity), columns));
            }
        }
        Ok(())
    }

    /// Writes modified fields of persisted entities. Entities without
    /// modified non-key fields are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` for the first failing statement.
    pub fn update(&self, entity_type: &EntityType, entities: &[EntityRef]) -> CoreResult<()> {
        check_batch(entity_type, entities)?;
        let mut state = self.state.lock();
        for entity in entities {
            let changes = entity.modified_row();
            if changes.is_empty() {
                continue;
            }
            let command = self.dialect.update(entity, &changes);
            self.run(&mut state, command, |conn, cmd| conn.execute(cmd))?;
        }
        Ok(())
    }

    /// Deletes the rows of persisted entities.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` for the first failing statement.
    pub fn delete(&self, entity_type: &EntityType, entities: &[EntityRef]) -> CoreResult<()> {
        check_batch(entity_type, entities)?;
        let mut state = self.state.lock();
        for entity in entities {
            let command = self.dialect.delete(entity);
            self.run(&mut state, command, |conn, cmd| conn.execute(cmd))?;
        }
        Ok(())
    }

    /// Runs the key lookup query for `entity_type`.
    ///
    /// # Errors
    ///
    /// Same as [`execute_reader`](Self::execute_reader).
    pub fn select_by_key(
        &self,
        entity_type: &EntityType,
        key: &[ormid_store::Value],
    ) -> CoreResult<ResultSet> {
        self.execute_reader(self.dialect.select_by_key(entity_type, key))
    }

    /// Commits the physical transaction and closes the connection.
    ///
    /// # Errors
    ///
    /// - `TransactionAborted` if an earlier statement failed (the physical
    ///   transaction is rolled back instead)
    /// - `StatementExecutionFailed` if the store fails to commit
    /// - `InvalidOperation` if the boundary is already closed or not
    ///   transactional
    pub fn commit(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if !self.transactional {
            return Err(CoreError::invalid_operation(
                "command boundary has no physical transaction",
            ));
        }
        let Some(mut connection) = state.connection.take() else {
            return Err(CoreError::invalid_operation("command boundary already closed"));
        };
        close_reader(&mut state);

        if let Some(reason) = state.poisoned.clone() {
            if connection.in_transaction() {
                if let Err(e) = connection.rollback() {
                    warn!(error = %e, "rollback of failed transaction failed");
                }
            }
            connection.close();
            revert_assigned(&mut state);
            return Err(CoreError::transaction_aborted(reason));
        }

        let result = connection
            .commit()
            .map_err(|e| self.statement_failed("COMMIT", e));
        connection.close();
        if result.is_ok() {
            state.assigned.clear();
        } else {
            revert_assigned(&mut state);
        }
        result
    }

    /// Rolls back the physical transaction, if one is open, and closes the
    /// connection. Values written back by inserts are reset to null. Calling
    /// it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` if the store fails to roll back;
    /// the connection is closed regardless.
    pub fn rollback(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        revert_assigned(&mut state);
        let Some(mut connection) = state.connection.take() else {
            return Ok(());
        };
        close_reader(&mut state);

        let result = if connection.in_transaction() {
            connection
                .rollback()
                .map_err(|e| self.statement_failed("ROLLBACK", e))
        } else {
            Ok(())
        };
        connection.close();
        result
    }

    /// Closes any open result set and the connection. An open physical
    /// transaction is abandoned (the store rolls it back).
    pub fn close(&self) {
        let mut state = self.state.lock();
        close_reader(&mut state);
        revert_assigned(&mut state);
        if let Some(mut connection) = state.connection.take() {
            connection.close();
        }
    }

    fn run<T>(
        &self,
        state: &mut BoundaryState,
        mut command: Command,
        op: impl FnOnce(&mut dyn StoreConnection, &Command) -> Result<T, StoreError>,
    ) -> CoreResult<T> {
        if command.timeout.is_none() {
            command.timeout = state.timeout;
        }
        if !self.mars {
            if let Some(reader) = state.open_reader.take() {
                if let Err(e) = reader.buffer() {
                    return Err(self.fail(state, &command.sql, e));
                }
            }
        }
        let Some(connection) = state.connection.as_mut() else {
            return Err(CoreError::invalid_operation("command boundary already closed"));
        };
        match op(connection.as_mut(), &command) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(state, &command.sql, e)),
        }
    }

    fn fail(&self, state: &mut BoundaryState, sql: &str, error: StoreError) -> CoreError {
        let err = self.statement_failed(sql, error);
        warn!(sql, error = %err, "statement failed");
        if state.poisoned.is_none() {
            state.poisoned = Some(err.to_string());
        }
        err
    }

    fn statement_failed(&self, sql: &str, error: StoreError) -> CoreError {
        CoreError::StatementExecutionFailed {
            sql: sql.to_string(),
            message: error.to_string(),
            diagnostic: self.driver.decorate_error(&error, Some(sql)),
            source: error,
        }
    }
}

fn close_reader(state: &mut BoundaryState) {
    if let Some(reader) = state.open_reader.take() {
        reader.close();
    }
}

fn revert_assigned(state: &mut BoundaryState) {
    for (entity, columns) in state.assigned.drain(..) {
        for column in columns {
            entity.assign_generated(&column, Value::Null);
        }
    }
}

fn check_batch(entity_type: &EntityType, entities: &[EntityRef]) -> CoreResult<()> {
    match entities
        .iter()
        .find(|e| e.entity_type().name() != entity_type.name())
    {
        Some(stray) => Err(CoreError::invalid_operation(format!(
            "{stray} is not a {entity_type}"
        ))),
        None => Ok(()),
    }
}

impl Drop for CommandBoundary {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        close_reader(state);
        if let Some(mut connection) = state.connection.take() {
            if connection.in_transaction() {
                debug!("closing command boundary with an open transaction");
            }
            connection.close();
        }
    }
}

impl fmt::Debug for CommandBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBoundary")
            .field("driver", &self.driver.name())
            .field("transactional", &self.transactional)
            .field("mars", &self.mars)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
