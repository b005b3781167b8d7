//! # ormid Core
//!
//! Transactional object identity for ormid.
//!
//! This crate provides:
//! - Identity caches guaranteeing one in-memory instance per persisted row
//!   within a transaction
//! - Transaction contexts tracking new, modified and deleted entities until
//!   their transaction resolves
//! - Ambient transaction coordination shared by all threads of a transaction
//! - A command boundary running entity writes over one physical connection
//!
//! ## Example
//!
//! ```rust
//! use ormid_core::{DataModel, EntityType, ModelConfig, TransactionManager};
//! use ormid_store::{MemoryDriver, Row};
//! use std::sync::Arc;
//!
//! let model = DataModel::new(Arc::new(MemoryDriver::new()), ModelConfig::default());
//! let dog = model.register(EntityType::builder("Dog").generated_key("id").field("name").build());
//!
//! let txn = TransactionManager::new().begin();
//! let context = model.resolve_context(Some(&txn), true).unwrap();
//! let first = context.load(&dog, &Row::new().with("id", 1i64)).unwrap();
//! let again = context.load(&dog, &Row::new().with("id", 1i64)).unwrap();
//! assert!(Arc::ptr_eq(&first, &again));
//! txn.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod command;
mod config;
mod context;
mod coordinator;
mod entity;
mod error;
mod model;
mod transaction;
mod types;

pub use cache::{IdentityCache, ObjectCache, Partition};
pub use command::{BasicDialect, CommandBoundary, ResultSet, SqlDialect};
pub use config::ModelConfig;
pub use context::TransactionContext;
pub use coordinator::Coordinator;
pub use entity::{
    CacheKey, DeflatedPredicate, Entity, EntityRef, EntityType, EntityTypeBuilder, KeyComponent,
    PrimaryKey,
};
pub use error::{CoreError, CoreResult};
pub use model::DataModel;
pub use transaction::{Enlistment, Transaction, TransactionManager, TransactionStatus};
pub use types::{ContextState, InstanceId, TransactionId};
