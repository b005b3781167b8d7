//! # ormid Store
//!
//! Store driver contract and implementations for ormid.
//!
//! This crate is the lowest layer of ormid. A driver hands out physical
//! connections; connections run statements and own at most one physical
//! transaction. Drivers do **not** know about entities, caches or
//! transaction contexts.
//!
//! ## Design Principles
//!
//! - Drivers see only SQL text, positional parameters and rows
//! - A connection is owned by exactly one caller at a time
//! - Drivers must be `Send + Sync`; connections must be `Send`
//! - Store-specific diagnostics come from [`StoreDriver::decorate_error`]
//!
//! ## Available Drivers
//!
//! - [`MemoryDriver`] - scripted in-memory driver for tests and ephemeral use
//!
//! ## Example
//!
//! ```rust
//! use ormid_store::{Command, MemoryDriver, Row, RowReader, StoreConnection, StoreDriver};
//!
//! let driver = MemoryDriver::new();
//! driver.script_result("SELECT id FROM dog", vec![Row::new().with("id", 1i64)]);
//!
//! let mut conn = driver.connect().unwrap();
//! let mut reader = conn.execute_reader(&Command::new("SELECT id FROM dog")).unwrap();
//! assert!(reader.next_row().unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod memory;
mod value;

pub use driver::{
    BufferedReader, Command, ExecuteOutcome, IsolationLevel, RowReader, StoreConnection,
    StoreDriver,
};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryDriver, StoreFault};
pub use value::{Row, Value};
