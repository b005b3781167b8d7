//! Test fixtures and model helpers.
//!
//! Provides sample entity types and a ready-made data model over the
//! in-memory driver.

use ormid_core::{
    CoreResult, DataModel, EntityType, ModelConfig, Transaction, TransactionContext,
    TransactionManager,
};
use ormid_store::{MemoryDriver, Row, Value};
use std::sync::Arc;

/// `Dog`: store-assigned `id`, plus `name` and `owner`.
pub fn dog_type() -> Arc<EntityType> {
    EntityType::builder("Dog")
        .generated_key("id")
        .field("name")
        .field("owner")
        .build()
}

/// `Shop`: composite client-assigned key (`region`, `number`), plus `name`.
pub fn shop_type() -> Arc<EntityType> {
    EntityType::builder("Shop")
        .key("region")
        .key("number")
        .field("name")
        .build()
}

/// `Address`: client-assigned UUID key, plus `street`.
pub fn address_type() -> Arc<EntityType> {
    EntityType::builder("Address")
        .table("addresses")
        .key("id")
        .field("street")
        .build()
}

/// A `Dog` row as the store would return it.
pub fn dog_row(id: i64, name: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("name", name)
        .with("owner", Value::Null)
}

/// Parses rows from a JSON array of `Row` values.
///
/// # Panics
///
/// Panics if `json` is not a valid row array.
pub fn rows_from_json(json: &str) -> Vec<Row> {
    serde_json::from_str(json).expect("Invalid row fixture")
}

/// A data model over a [`MemoryDriver`] with the sample types registered.
pub struct TestModel {
    /// The driver, for scripting results and inspecting statements.
    pub driver: MemoryDriver,
    /// The model.
    pub model: DataModel,
    /// Transaction source.
    pub manager: TransactionManager,
    /// Registered `Dog` type.
    pub dog: Arc<EntityType>,
    /// Registered `Shop` type.
    pub shop: Arc<EntityType>,
    /// Registered `Address` type.
    pub address: Arc<EntityType>,
}

impl TestModel {
    /// Creates a model with default configuration.
    pub fn new() -> Self {
        Self::with_driver(MemoryDriver::new(), ModelConfig::default())
    }

    /// Creates a model over a driver without multiple active result sets.
    pub fn without_mars() -> Self {
        Self::with_driver(MemoryDriver::without_mars(), ModelConfig::default())
    }

    /// Creates a model over `driver` with `config`.
    pub fn with_driver(driver: MemoryDriver, config: ModelConfig) -> Self {
        let model = DataModel::new(Arc::new(driver.clone()), config);
        let dog = model.register(dog_type());
        let shop = model.register(shop_type());
        let address = model.register(address_type());
        Self {
            driver,
            model,
            manager: TransactionManager::new(),
            dog,
            shop,
            address,
        }
    }

    /// Runs `f` in a new transaction, committing on `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit.
    pub fn in_transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Arc<TransactionContext>, &Transaction) -> CoreResult<T>,
    {
        self.manager.transaction(|txn| {
            let context = self.model.resolve_context(Some(txn), true)?;
            f(&context, txn)
        })
    }
}

impl Default for TestModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestModel {
    type Target = DataModel;

    fn deref(&self) -> &Self::Target {
        &self.model
    }
}

/// Runs a test with a fresh [`TestModel`].
///
/// # Example
///
/// ```rust
/// use ormid_testkit::with_test_model;
///
/// with_test_model(|t| {
///     let context = t.resolve_context(None, false).unwrap();
///     assert!(context.is_root());
/// });
/// ```
pub fn with_test_model<F, R>(f: F) -> R
where
    F: FnOnce(&TestModel) -> R,
{
    let model = TestModel::new();
    f(&model)
}
