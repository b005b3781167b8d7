//! Transaction contexts.

use crate::cache::{IdentityCache, ObjectCache};
use crate::command::CommandBoundary;
use crate::entity::{CacheKey, DeflatedPredicate, Entity, EntityRef, EntityType, PrimaryKey};
use crate::error::{CoreError, CoreResult};
use crate::model::ModelShared;
use crate::transaction::Enlistment;
use crate::types::{ContextState, TransactionId};
use ormid_store::{Row, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-transaction state: one identity cache per entity type plus the
/// command boundary that carries the transaction's statements.
///
/// A context bound to a transaction is enlisted in it and is prepared,
/// committed or rolled back by the transaction. The root context of a
/// coordinator has no transaction: it serves reads only, over a connection
/// without a physical transaction.
///
/// Commit order:
///
/// 1. flush deletions, new objects (store-assigned keys are written back)
///    and modified objects through the command boundary
/// 2. promote new objects whose key is now complete, failing if any is not
/// 3. commit the physical transaction
/// 4. graduate new objects to persisted in every cache
///
/// A failure at any step leaves the caches un-reconciled.
pub struct TransactionContext {
    shared: Arc<ModelShared>,
    transaction: Option<TransactionId>,
    // Keyed by type name; ordered so flushes are deterministic.
    caches: Mutex<BTreeMap<String, Arc<dyn ObjectCache>>>,
    committing: Arc<AtomicBool>,
    state: Mutex<ContextState>,
    boundary: Mutex<Option<Arc<CommandBoundary>>>,
}

impl TransactionContext {
    pub(crate) fn new(shared: Arc<ModelShared>, transaction: Option<TransactionId>) -> Self {
        debug!(?transaction, "transaction context created");
        Self {
            shared,
            transaction,
            caches: Mutex::new(BTreeMap::new()),
            committing: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ContextState::Created),
            boundary: Mutex::new(None),
        }
    }

    /// The bound transaction, or `None` for a root context.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Returns true for a coordinator's non-transactional root context.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.transaction.is_none()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    /// Returns true while the context is committing.
    #[must_use]
    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    /// Returns the identity cache for `entity_type`, keyed by `K`.
    ///
    /// The first request for a type fixes its key type.
    ///
    /// # Errors
    ///
    /// Returns `CacheKeyMismatch` if the type's cache was created with a
    /// different key type.
    pub fn identity_cache_for<K: CacheKey>(
        &self,
        entity_type: &Arc<EntityType>,
    ) -> CoreResult<Arc<IdentityCache<K>>> {
        let mut caches = self.caches.lock();
        if let Some(existing) = caches.get(entity_type.name()) {
            return Arc::clone(existing)
                .as_any()
                .downcast::<IdentityCache<K>>()
                .map_err(|_| CoreError::CacheKeyMismatch {
                    entity_type: entity_type.name().to_string(),
                });
        }
        let cache = Arc::new(IdentityCache::<K>::new(
            Arc::clone(entity_type),
            Arc::clone(&self.committing),
        ));
        caches.insert(entity_type.name().to_string(), cache.clone());
        Ok(cache)
    }

    /// Key-erased cache for `entity_type`, created with [`PrimaryKey`] keys
    /// if the type has no cache yet.
    fn cache_for(&self, entity_type: &Arc<EntityType>) -> Arc<dyn ObjectCache> {
        let mut caches = self.caches.lock();
        let cache = caches
            .entry(entity_type.name().to_string())
            .or_insert_with(|| {
                Arc::new(IdentityCache::<PrimaryKey>::new(
                    Arc::clone(entity_type),
                    Arc::clone(&self.committing),
                ))
            });
        Arc::clone(cache)
    }

    fn all_caches(&self) -> Vec<Arc<dyn ObjectCache>> {
        self.caches.lock().values().cloned().collect()
    }

    /// Returns the command boundary, opening its connection on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is finished or the store cannot be
    /// reached.
    pub fn command_boundary(&self) -> CoreResult<Arc<CommandBoundary>> {
        self.ensure_usable(false)?;
        self.open_boundary()
    }

    fn open_boundary(&self) -> CoreResult<Arc<CommandBoundary>> {
        let mut slot = self.boundary.lock();
        if let Some(boundary) = slot.as_ref() {
            if !boundary.is_closed() {
                return Ok(Arc::clone(boundary));
            }
        }
        let boundary = Arc::new(CommandBoundary::open(
            Arc::clone(&self.shared.driver),
            Arc::clone(&self.shared.dialect),
            &self.shared.config,
            !self.is_root(),
        )?);
        *slot = Some(Arc::clone(&boundary));
        Ok(boundary)
    }

    /// Creates a new, unsaved entity tracked by this context.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` on a root context.
    pub fn create(&self, entity_type: &Arc<EntityType>) -> CoreResult<EntityRef> {
        self.ensure_usable(true)?;
        let entity = Entity::new_object(Arc::clone(entity_type));
        self.cache_for(entity_type).cache(&entity, false)
    }

    /// Caches an entity materialized from a row read from the store.
    ///
    /// Returns the canonical instance for the row's key.
    ///
    /// # Errors
    ///
    /// Returns `MissingOrInvalidPrimaryKey` if the row lacks key values.
    pub fn load(&self, entity_type: &Arc<EntityType>, row: &Row) -> CoreResult<EntityRef> {
        self.ensure_usable(false)?;
        let entity = Entity::from_row(Arc::clone(entity_type), row, false);
        self.cache_for(entity_type).cache(&entity, false)
    }

    /// Imports a row whose deletion state is authoritative.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` on a root context, or
    /// `MissingOrInvalidPrimaryKey` if the row lacks key values.
    pub fn import(
        &self,
        entity_type: &Arc<EntityType>,
        row: &Row,
        deleted: bool,
    ) -> CoreResult<EntityRef> {
        self.ensure_usable(true)?;
        let entity = Entity::from_row(Arc::clone(entity_type), row, deleted);
        self.cache_for(entity_type).cache(&entity, true)
    }

    /// Returns the placeholder standing for the entity matched by
    /// `predicate`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is finished.
    pub fn deflated_reference(
        &self,
        entity_type: &Arc<EntityType>,
        predicate: DeflatedPredicate,
    ) -> CoreResult<EntityRef> {
        self.ensure_usable(false)?;
        let cache = self.cache_for(entity_type);
        if let Some(existing) = cache.get_by_predicate(&predicate) {
            return Ok(existing);
        }
        let entity = Entity::deflated(Arc::clone(entity_type), predicate, &Row::new());
        cache.cache(&entity, false)
    }

    /// Finds a live entity by key, querying the store on a cache miss.
    ///
    /// Entities deleted in this context are not found.
    ///
    /// # Errors
    ///
    /// Returns `StatementExecutionFailed` if the lookup query fails.
    pub fn find(
        &self,
        entity_type: &Arc<EntityType>,
        key: &[Value],
    ) -> CoreResult<Option<EntityRef>> {
        self.ensure_usable(false)?;
        let cache = self.cache_for(entity_type);
        if let Some(hit) = cache.get(key) {
            return Ok(Some(hit));
        }

        let rows = self.open_boundary()?.select_by_key(entity_type, key)?;
        let row = rows.next_row()?;
        rows.close();
        match row {
            Some(row) => {
                let entity = cache.cache(
                    &Entity::from_row(Arc::clone(entity_type), &row, false),
                    false,
                )?;
                Ok((!entity.is_deleted()).then_some(entity))
            }
            None => Ok(None),
        }
    }

    /// Looks up a predicate placeholder in the cache.
    #[must_use]
    pub fn find_by_predicate(
        &self,
        entity_type: &Arc<EntityType>,
        predicate: &DeflatedPredicate,
    ) -> Option<EntityRef> {
        self.cache_for(entity_type).get_by_predicate(predicate)
    }

    /// Marks an entity deleted. Persisted entities are deleted from the
    /// store on commit; new ones are simply forgotten.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` on a root context.
    pub fn delete(&self, entity: &EntityRef) -> CoreResult<()> {
        self.ensure_usable(true)?;
        self.cache_for(entity.entity_type()).deleted(entity)?;
        entity.set_deleted(true);
        Ok(())
    }

    /// Stops tracking an entity.
    pub fn evict(&self, entity: &EntityRef) {
        self.cache_for(entity.entity_type()).evict(entity);
    }

    /// Closes the context's connection, if one is open.
    ///
    /// On a transactional context this abandons the physical transaction.
    pub fn flush_connections(&self) {
        if let Some(boundary) = self.boundary.lock().take() {
            boundary.close();
        }
    }

    /// Tears down a root context.
    pub(crate) fn dispose(&self) {
        self.flush_connections();
        for cache in self.all_caches() {
            cache.discard();
        }
        self.caches.lock().clear();
    }

    fn ensure_usable(&self, for_write: bool) -> CoreResult<()> {
        if for_write && self.is_root() {
            return Err(CoreError::NoActiveTransaction);
        }
        let mut state = self.state.lock();
        match *state {
            ContextState::Created => {
                *state = ContextState::Active;
                Ok(())
            }
            ContextState::Active | ContextState::Committing => Ok(()),
            other => Err(CoreError::invalid_operation(format!(
                "transaction context is {other}"
            ))),
        }
    }

    fn transition(&self, from: &[ContextState], to: ContextState) -> CoreResult<()> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(CoreError::invalid_operation(format!(
                "transaction context cannot move from {} to {to}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let caches = self.all_caches();
        let pending: Vec<_> = caches
            .iter()
            .map(|c| {
                (
                    c,
                    // Entities missing client-assigned key values cannot be
                    // inserted; readiness checking reports them below.
                    c.pending_inserts()
                        .into_iter()
                        .filter(|e| {
                            e.entity_type()
                                .key_components()
                                .iter()
                                .filter(|k| !k.server_generated)
                                .all(|k| !e.get(&k.name).is_null())
                        })
                        .collect::<Vec<_>>(),
                    c.pending_updates(),
                    c.pending_deletes(),
                )
            })
            .collect();

        let has_writes = pending
            .iter()
            .any(|(_, i, u, d)| !i.is_empty() || !u.is_empty() || !d.is_empty());
        if has_writes {
            let boundary = self.open_boundary()?;
            // Deletes first: a new object may reuse the key of a deleted row.
            for (cache, _, _, deletes) in &pending {
                if !deletes.is_empty() {
                    boundary.delete(cache.entity_type(), deletes)?;
                }
            }
            for (cache, inserts, _, _) in &pending {
                if !inserts.is_empty() {
                    boundary.insert(cache.entity_type(), inserts)?;
                }
            }
            for (cache, _, updates, _) in &pending {
                if !updates.is_empty() {
                    boundary.update(cache.entity_type(), updates)?;
                }
            }
        }

        for cache in &caches {
            cache.assert_ready_for_commit()?;
        }
        Ok(())
    }

    fn fail(&self, err: &CoreError) {
        warn!(transaction = ?self.transaction, error = %err, "transaction context commit failed");
        *self.state.lock() = ContextState::Failed;
        self.committing.store(false, Ordering::SeqCst);
    }
}

impl Enlistment for TransactionContext {
    fn prepare(&self) -> CoreResult<()> {
        self.transition(
            &[ContextState::Created, ContextState::Active],
            ContextState::Committing,
        )?;
        self.committing.store(true, Ordering::SeqCst);
        self.flush().inspect_err(|e| self.fail(e))
    }

    fn commit(&self) -> CoreResult<()> {
        if self.state() != ContextState::Committing {
            return Err(CoreError::invalid_operation(
                "transaction context was not prepared",
            ));
        }
        let boundary = self.boundary.lock().clone();
        if let Some(boundary) = boundary {
            if !boundary.is_closed() {
                boundary.commit().inspect_err(|e| self.fail(e))?;
            }
        }
        for cache in self.all_caches() {
            cache.process_after_commit().inspect_err(|e| self.fail(e))?;
        }
        *self.state.lock() = ContextState::Committed;
        self.committing.store(false, Ordering::SeqCst);
        info!(transaction = ?self.transaction, "transaction context committed");
        Ok(())
    }

    fn rollback(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ContextState::Committed | ContextState::RolledBack) {
                return;
            }
            *state = ContextState::RollingBack;
        }
        let boundary = self.boundary.lock().take();
        if let Some(boundary) = boundary {
            if let Err(e) = boundary.rollback() {
                warn!(error = %e, "physical rollback failed");
            }
        }
        for cache in self.all_caches() {
            cache.discard();
        }
        self.committing.store(false, Ordering::SeqCst);
        *self.state.lock() = ContextState::RolledBack;
        info!(transaction = ?self.transaction, "transaction context rolled back");
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("transaction", &self.transaction)
            .field("state", &self.state())
            .field("caches", &self.caches.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Partition;
    use crate::command::BasicDialect;
    use crate::config::ModelConfig;
    use ormid_store::{MemoryDriver, StoreFault};

    fn dog_type() -> Arc<EntityType> {
        EntityType::builder("Dog")
            .generated_key("id")
            .field("name")
            .build()
    }

    fn context(driver: &MemoryDriver, transactional: bool) -> TransactionContext {
        let shared = ModelShared::new(
            Arc::new(driver.clone()),
            Arc::new(BasicDialect),
            ModelConfig::default(),
        );
        TransactionContext::new(Arc::new(shared), transactional.then_some(TransactionId::new(1)))
    }

    fn commit(ctx: &TransactionContext) -> CoreResult<()> {
        ctx.prepare()?;
        ctx.commit()
    }

    #[test]
    fn commit_inserts_and_graduates_new_objects() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let ty = dog_type();
        let dog = ctx.create(&ty).unwrap();
        dog.set("name", "rex").unwrap();

        commit(&ctx).unwrap();
        assert_eq!(ctx.state(), ContextState::Committed);
        assert!(!dog.is_new());
        let found = ctx.find(&ty, &[dog.get("id")]);
        assert!(found.is_err(), "committed context refuses further work");

        let cache = ctx.identity_cache_for::<PrimaryKey>(&ty).unwrap();
        assert_eq!(cache.partition_of(&dog), Some(Partition::ByKey));
        assert_eq!(driver.committed_statements().len(), 1);
    }

    #[test]
    fn updates_and_deletes_are_flushed() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let ty = dog_type();
        let kept = ctx
            .load(&ty, &Row::new().with("id", 1i64).with("name", "rex"))
            .unwrap();
        let gone = ctx.load(&ty, &Row::new().with("id", 2i64)).unwrap();
        kept.set("name", "max").unwrap();
        ctx.delete(&gone).unwrap();

        commit(&ctx).unwrap();
        let statements = driver.committed_statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("DELETE FROM dog"));
        assert!(statements[1].starts_with("UPDATE dog"));
        assert!(!kept.is_modified());
    }

    #[test]
    fn loading_twice_returns_same_instance() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, false);
        let ty = dog_type();
        let row = Row::new().with("id", 5i64).with("name", "rex");
        let a = ctx.load(&ty, &row).unwrap();
        let b = ctx.load(&ty, &row).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let found = ctx.find(&ty, &[Value::BigInt(5)]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &found));
    }

    #[test]
    fn find_queries_store_on_miss() {
        let driver = MemoryDriver::new();
        driver.script_result(
            "SELECT id, name FROM dog WHERE id = ?",
            vec![Row::new().with("id", 9i64).with("name", "fido")],
        );
        let ctx = context(&driver, false);
        let ty = dog_type();

        let first = ctx.find(&ty, &[Value::BigInt(9)]).unwrap().unwrap();
        let second = ctx.find(&ty, &[Value::BigInt(9)]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get("name"), Value::from("fido"));
    }

    #[test]
    fn root_context_refuses_writes() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, false);
        let ty = dog_type();
        assert!(matches!(ctx.create(&ty), Err(CoreError::NoActiveTransaction)));
        let dog = ctx.load(&ty, &Row::new().with("id", 1i64)).unwrap();
        assert!(matches!(ctx.delete(&dog), Err(CoreError::NoActiveTransaction)));

        ctx.command_boundary().unwrap();
        assert_eq!(driver.open_connections(), 1);
        ctx.flush_connections();
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn failed_statement_leaves_caches_unreconciled() {
        let driver = MemoryDriver::new();
        driver.fail_on("INSERT", StoreFault::Reject("no space".into()));
        let ctx = context(&driver, true);
        let ty = dog_type();
        let dog = ctx.create(&ty).unwrap();

        let err = commit(&ctx).unwrap_err();
        assert!(err.is_statement_failure());
        assert_eq!(ctx.state(), ContextState::Failed);
        assert!(dog.is_new());
        assert!(!ctx.is_committing());

        ctx.rollback();
        assert_eq!(ctx.state(), ContextState::RolledBack);
        assert!(driver.committed_statements().is_empty());
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn incomplete_client_key_blocks_commit() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let shop = EntityType::builder("Shop").key("code").field("name").build();
        let entity = ctx.create(&shop).unwrap();

        let err = commit(&ctx).unwrap_err();
        assert!(matches!(err, CoreError::MissingOrInvalidPrimaryKey { .. }));
        assert!(entity.is_new());
        assert!(driver.committed_statements().is_empty());
    }

    #[test]
    fn recreating_deleted_key_deletes_first() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let shop = EntityType::builder("Shop").key("code").field("name").build();
        let old = ctx
            .load(&shop, &Row::new().with("code", "X").with("name", "old"))
            .unwrap();
        ctx.delete(&old).unwrap();
        let fresh = ctx.create(&shop).unwrap();
        fresh.set("code", "X").unwrap();
        fresh.set("name", "new").unwrap();

        commit(&ctx).unwrap();
        let statements = driver.committed_statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("DELETE FROM shop"));
        assert!(statements[1].starts_with("INSERT INTO shop"));

        let cache = ctx.identity_cache_for::<PrimaryKey>(&shop).unwrap();
        let found = cache.get(&[Value::from("X")]).unwrap();
        assert!(Arc::ptr_eq(&found, &fresh));
        assert_eq!(cache.partition_of(&old), None);
        assert_eq!(old.get("name"), Value::from("old"));
        assert!(!fresh.is_deleted());
    }

    #[test]
    fn failed_commit_clears_generated_keys() {
        let driver = MemoryDriver::new();
        driver.fail_on("INSERT INTO shop", StoreFault::Reject("duplicate key".into()));
        let ctx = context(&driver, true);
        let dog_ty = dog_type();
        let shop = EntityType::builder("Shop").key("code").field("name").build();
        let dog = ctx.create(&dog_ty).unwrap();
        dog.set("name", "rex").unwrap();
        let store = ctx.create(&shop).unwrap();
        store.set("code", "X").unwrap();

        assert!(commit(&ctx).is_err());
        ctx.rollback();
        assert!(dog.is_new());
        assert!(dog.get("id").is_null());
        assert!(!dog.primary_key_ready());
        assert!(driver.committed_statements().is_empty());
    }

    #[test]
    fn failed_delete_leaves_entity_untouched() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let ty = dog_type();
        let placeholder = ctx
            .deflated_reference(&ty, DeflatedPredicate::new("name = 'rex'"))
            .unwrap();

        let err = ctx.delete(&placeholder).unwrap_err();
        assert!(matches!(err, CoreError::MissingOrInvalidPrimaryKey { .. }));
        assert!(!placeholder.is_deleted());
        let cache = ctx.identity_cache_for::<PrimaryKey>(&ty).unwrap();
        assert_eq!(cache.partition_of(&placeholder), Some(Partition::ByPredicate));
    }

    #[test]
    fn find_matches_keys_across_integer_widths() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, false);
        let ty = dog_type();
        let loaded = ctx.load(&ty, &Row::new().with("id", 5i64)).unwrap();

        let found = ctx.find(&ty, &[Value::Int(5)]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &found));
        assert_eq!(driver.connections_opened(), 0);
    }

    #[test]
    fn rollback_discards_caches() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let ty = dog_type();
        ctx.load(&ty, &Row::new().with("id", 1i64)).unwrap();
        ctx.rollback();
        ctx.rollback();
        assert_eq!(ctx.state(), ContextState::RolledBack);
        assert!(ctx.identity_cache_for::<PrimaryKey>(&ty).unwrap().is_empty());
    }

    #[test]
    fn cache_key_type_is_fixed() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, true);
        let ty = dog_type();
        ctx.identity_cache_for::<i64>(&ty).unwrap();
        assert!(ctx.identity_cache_for::<i64>(&ty).is_ok());
        assert!(matches!(
            ctx.identity_cache_for::<String>(&ty),
            Err(CoreError::CacheKeyMismatch { .. })
        ));
    }

    #[test]
    fn deflated_references_share_identity() {
        let driver = MemoryDriver::new();
        let ctx = context(&driver, false);
        let ty = dog_type();
        let predicate = DeflatedPredicate::new("name = 'rex'");
        let a = ctx.deflated_reference(&ty, predicate.clone()).unwrap();
        let b = ctx.deflated_reference(&ty, predicate.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(ctx.find_by_predicate(&ty, &predicate).is_some());
    }
}
