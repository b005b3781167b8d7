//! Property-based test generators using proptest.
//!
//! Provides strategies for rows, keys and sequences of identity-cache
//! operations, plus a runner that applies such a sequence to a transaction
//! context.

use crate::fixtures::dog_row;
use ormid_core::{CoreResult, EntityRef, EntityType, PrimaryKey, TransactionContext};
use ormid_store::{Row, Value};
use proptest::prelude::*;
use std::sync::Arc;

/// Strategy for `Dog` keys in `0..max_key`.
pub fn dog_key_strategy(max_key: i64) -> impl Strategy<Value = i64> {
    0..max_key
}

/// Strategy for entity names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,12}").expect("Invalid regex")
}

/// Strategy for `Dog` rows with keys in `0..max_key`.
pub fn dog_row_strategy(max_key: i64) -> impl Strategy<Value = Row> {
    (dog_key_strategy(max_key), name_strategy()).prop_map(|(id, name)| dog_row(id, &name))
}

/// Strategy for scalar values usable as key components.
pub fn key_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::BigInt),
        "[a-z0-9]{1,8}".prop_map(Value::Text),
        any::<u128>().prop_map(|n| Value::Uuid(uuid::Uuid::from_u128(n))),
    ]
}

/// One step applied to a transaction context's `Dog` cache.
#[derive(Debug, Clone)]
pub enum CacheOperation {
    /// Materialize a row read from the store.
    Load {
        /// Key.
        id: i64,
        /// Name column.
        name: String,
    },
    /// Import a row with an authoritative deletion flag.
    Import {
        /// Key.
        id: i64,
        /// Whether the row is deleted.
        deleted: bool,
    },
    /// Delete the cached instance for a key, if any.
    Delete {
        /// Key.
        id: i64,
    },
    /// Evict the cached instance for a key, if any.
    Evict {
        /// Key.
        id: i64,
    },
    /// Create a new object.
    Create,
}

/// Strategy for cache operations over keys in `0..max_key`.
pub fn cache_operation_strategy(max_key: i64) -> impl Strategy<Value = CacheOperation> {
    prop_oneof![
        4 => (dog_key_strategy(max_key), name_strategy())
            .prop_map(|(id, name)| CacheOperation::Load { id, name }),
        1 => (dog_key_strategy(max_key), any::<bool>())
            .prop_map(|(id, deleted)| CacheOperation::Import { id, deleted }),
        2 => dog_key_strategy(max_key).prop_map(|id| CacheOperation::Delete { id }),
        1 => dog_key_strategy(max_key).prop_map(|id| CacheOperation::Evict { id }),
        1 => Just(CacheOperation::Create),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    max_key: i64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<CacheOperation>> {
    prop::collection::vec(cache_operation_strategy(max_key), min_ops..max_ops)
}

/// Applies `op` to `context`, returning the entity the operation produced
/// or touched.
///
/// # Errors
///
/// Propagates context errors.
pub fn apply_operation(
    context: &TransactionContext,
    dog: &Arc<EntityType>,
    op: &CacheOperation,
) -> CoreResult<Option<EntityRef>> {
    let cache = context.identity_cache_for::<PrimaryKey>(dog)?;
    match op {
        CacheOperation::Load { id, name } => context.load(dog, &dog_row(*id, name)).map(Some),
        CacheOperation::Import { id, deleted } => context
            .import(dog, &dog_row(*id, "imported"), *deleted)
            .map(Some),
        CacheOperation::Delete { id } => match cache.get(&[Value::BigInt(*id)]) {
            Some(entity) => {
                context.delete(&entity)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        },
        CacheOperation::Evict { id } => {
            let found = cache.get(&[Value::BigInt(*id)]);
            if let Some(entity) = &found {
                context.evict(entity);
            }
            Ok(found)
        }
        CacheOperation::Create => context.create(dog).map(Some),
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
