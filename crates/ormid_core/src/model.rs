//! Data model handle.

use crate::command::{BasicDialect, SqlDialect};
use crate::config::ModelConfig;
use crate::context::TransactionContext;
use crate::coordinator::{BindingTable, Coordinator};
use crate::entity::EntityType;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::TransactionId;
use ormid_store::StoreDriver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::info;

/// State shared by a model's coordinators and contexts.
pub(crate) struct ModelShared {
    pub(crate) driver: Arc<dyn StoreDriver>,
    pub(crate) dialect: Arc<dyn SqlDialect>,
    pub(crate) config: ModelConfig,
    pub(crate) bindings: Arc<BindingTable>,
}

impl ModelShared {
    pub(crate) fn new(
        driver: Arc<dyn StoreDriver>,
        dialect: Arc<dyn SqlDialect>,
        config: ModelConfig,
    ) -> Self {
        Self {
            driver,
            dialect,
            config,
            bindings: Arc::new(BindingTable::default()),
        }
    }
}

/// An ORM data model bound to one store.
///
/// The model registers entity types and owns one [`Coordinator`] per calling
/// thread. Coordinators of one model share the transaction binding table,
/// so every thread working in a transaction sees that transaction's single
/// context.
///
/// Disposing the model (explicitly or by dropping it) disposes every
/// coordinator.
///
/// # Example
///
/// ```rust
/// use ormid_core::{DataModel, EntityType, ModelConfig, TransactionManager};
/// use ormid_store::MemoryDriver;
/// use std::sync::Arc;
///
/// let model = DataModel::new(Arc::new(MemoryDriver::new()), ModelConfig::default());
/// let dog = model.register(EntityType::builder("Dog").generated_key("id").field("name").build());
/// let manager = TransactionManager::new();
///
/// let created = manager
///     .transaction(|txn| {
///         let context = model.resolve_context(Some(txn), true)?;
///         let rex = context.create(&dog)?;
///         rex.set("name", "rex")?;
///         Ok(rex)
///     })
///     .unwrap();
/// assert!(!created.is_new());
/// ```
pub struct DataModel {
    shared: Arc<ModelShared>,
    types: RwLock<HashMap<String, Arc<EntityType>>>,
    coordinators: Mutex<HashMap<ThreadId, Arc<Coordinator>>>,
    disposed: AtomicBool,
}

impl DataModel {
    /// Creates a model over `driver` using [`BasicDialect`] SQL.
    #[must_use]
    pub fn new(driver: Arc<dyn StoreDriver>, config: ModelConfig) -> Self {
        Self::with_dialect(driver, Arc::new(BasicDialect), config)
    }

    /// Creates a model with a custom SQL dialect.
    #[must_use]
    pub fn with_dialect(
        driver: Arc<dyn StoreDriver>,
        dialect: Arc<dyn SqlDialect>,
        config: ModelConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ModelShared::new(driver, dialect, config)),
            types: RwLock::new(HashMap::new()),
            coordinators: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Model configuration.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.shared.config
    }

    /// Registers an entity type, replacing any type of the same name.
    pub fn register(&self, entity_type: Arc<EntityType>) -> Arc<EntityType> {
        self.types
            .write()
            .insert(entity_type.name().to_string(), Arc::clone(&entity_type));
        entity_type
    }

    /// Looks up a registered entity type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if no type has that name.
    pub fn entity_type(&self, name: &str) -> CoreResult<Arc<EntityType>> {
        self.types
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownEntityType {
                name: name.to_string(),
            })
    }

    /// Returns the calling thread's coordinator, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `ModelDisposed` after disposal.
    pub fn coordinator(&self) -> CoreResult<Arc<Coordinator>> {
        let mut coordinators = self.coordinators.lock();
        if self.is_disposed() {
            return Err(CoreError::ModelDisposed);
        }
        let thread = thread::current().id();
        let coordinator = coordinators
            .entry(thread)
            .or_insert_with(|| Arc::new(Coordinator::new(Arc::clone(&self.shared), thread)));
        Ok(Arc::clone(coordinator))
    }

    /// Resolves the context through the calling thread's coordinator.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::resolve_context`].
    pub fn resolve_context(
        &self,
        ambient: Option<&Transaction>,
        for_write: bool,
    ) -> CoreResult<Arc<TransactionContext>> {
        self.coordinator()?.resolve_context(ambient, for_write)
    }

    /// The context currently bound to a transaction, if any.
    #[must_use]
    pub fn bound_context(&self, id: TransactionId) -> Option<Arc<TransactionContext>> {
        self.shared.bindings.get(id)
    }

    /// Number of transactions with a bound context.
    #[must_use]
    pub fn bound_contexts(&self) -> usize {
        self.shared.bindings.len()
    }

    /// Number of live coordinators.
    #[must_use]
    pub fn coordinator_count(&self) -> usize {
        self.coordinators.lock().len()
    }

    /// Disposes and forgets the calling thread's coordinator, if it has one.
    pub fn release_coordinator(&self) {
        let removed = self.coordinators.lock().remove(&thread::current().id());
        if let Some(coordinator) = removed {
            coordinator.dispose();
        }
    }

    /// Returns true once disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Disposes every coordinator. Idempotent.
    ///
    /// Contexts bound to transactions stay usable until their transaction
    /// completes.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let coordinators: Vec<_> = self.coordinators.lock().drain().map(|(_, c)| c).collect();
        for coordinator in &coordinators {
            coordinator.dispose();
        }
        info!(coordinators = coordinators.len(), "data model disposed");
    }
}

impl Drop for DataModel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataModel")
            .field("driver", &self.shared.driver.name())
            .field("types", &self.types.read().len())
            .field("coordinators", &self.coordinator_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
