//! Per-type identity cache.

use crate::cache::{ObjectCache, Partition};
use crate::entity::{CacheKey, DeflatedPredicate, EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::types::InstanceId;
use ormid_store::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Where a tracked entity currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<K> {
    NotReady,
    ReadyNew(K),
    ByKey(K),
    ByPredicate(DeflatedPredicate),
    Tombstoned { key: K, pending_delete: bool },
}

impl<K> Slot<K> {
    fn partition(&self) -> Partition {
        match self {
            Slot::NotReady => Partition::NotReady,
            Slot::ReadyNew(_) => Partition::ReadyNew,
            Slot::ByKey(_) => Partition::ByKey,
            Slot::ByPredicate(_) => Partition::ByPredicate,
            Slot::Tombstoned { .. } => Partition::Tombstoned,
        }
    }
}

struct Tracked<K> {
    entity: EntityRef,
    slot: Slot<K>,
}

/// Partition indexes. Every tracked entity appears in exactly one index, the
/// one named by its slot; `place` and `unplace` are the only writers.
struct CacheInner<K> {
    tracked: HashMap<InstanceId, Tracked<K>>,
    // Ordered by instance id so commit-time scans follow creation order.
    not_ready: BTreeMap<InstanceId, ()>,
    ready_new: HashMap<K, InstanceId>,
    by_key: HashMap<K, InstanceId>,
    by_predicate: HashMap<DeflatedPredicate, InstanceId>,
    tombstones: HashMap<K, InstanceId>,
}

impl<K: CacheKey> CacheInner<K> {
    fn new() -> Self {
        Self {
            tracked: HashMap::new(),
            not_ready: BTreeMap::new(),
            ready_new: HashMap::new(),
            by_key: HashMap::new(),
            by_predicate: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn slot_of(&self, id: InstanceId) -> Option<&Slot<K>> {
        self.tracked.get(&id).map(|t| &t.slot)
    }

    fn entity(&self, id: InstanceId) -> Option<EntityRef> {
        self.tracked.get(&id).map(|t| Arc::clone(&t.entity))
    }

    fn entities<'a>(&'a self, ids: impl Iterator<Item = &'a InstanceId>) -> Vec<EntityRef> {
        let mut out: Vec<EntityRef> = ids.filter_map(|id| self.entity(*id)).collect();
        out.sort_by_key(|e| e.instance_id());
        out
    }

    /// Removes an entity from whatever partition holds it.
    fn unplace(&mut self, id: InstanceId) -> Option<EntityRef> {
        let tracked = self.tracked.remove(&id)?;
        match &tracked.slot {
            Slot::NotReady => {
                self.not_ready.remove(&id);
            }
            Slot::ReadyNew(key) => remove_if(&mut self.ready_new, key, id),
            Slot::ByKey(key) => remove_if(&mut self.by_key, key, id),
            Slot::ByPredicate(predicate) => remove_if(&mut self.by_predicate, predicate, id),
            Slot::Tombstoned { key, .. } => remove_if(&mut self.tombstones, key, id),
        }
        Some(tracked.entity)
    }

    /// Moves `entity` into `slot`, displacing any other instance indexed
    /// under the same key.
    fn place(&mut self, entity: &EntityRef, slot: Slot<K>) {
        let id = entity.instance_id();
        self.unplace(id);
        let displaced = match &slot {
            Slot::NotReady => self.not_ready.insert(id, ()).map(|()| id),
            Slot::ReadyNew(key) => self.ready_new.insert(key.clone(), id),
            Slot::ByKey(key) => self.by_key.insert(key.clone(), id),
            Slot::ByPredicate(predicate) => self.by_predicate.insert(predicate.clone(), id),
            Slot::Tombstoned { key, .. } => self.tombstones.insert(key.clone(), id),
        };
        if let Some(old) = displaced.filter(|old| *old != id) {
            self.tracked.remove(&old);
        }
        self.tracked.insert(
            id,
            Tracked {
                entity: Arc::clone(entity),
                slot,
            },
        );
    }

    fn clear(&mut self) {
        self.tracked.clear();
        self.not_ready.clear();
        self.ready_new.clear();
        self.by_key.clear();
        self.by_predicate.clear();
        self.tombstones.clear();
    }
}

fn remove_if<Q: std::hash::Hash + Eq>(index: &mut HashMap<Q, InstanceId>, key: &Q, id: InstanceId) {
    if index.get(key) == Some(&id) {
        index.remove(key);
    }
}

/// The identity map for one entity type within one transaction context.
///
/// Entities live in exactly one of five partitions:
///
/// | partition | holds | indexed by |
/// |---|---|---|
/// | not-ready | new entities whose key is incomplete | reference identity |
/// | ready-new | new entities with a complete key, not yet durable | key |
/// | by-key | persisted entities | key |
/// | by-predicate | placeholders identified by a query predicate | predicate |
/// | tombstones | deleted persisted entities | key |
///
/// All mutating operations take the cache's own lock, so caches for
/// different entity types never contend.
///
/// While the owning context is committing, `cache` and `evict` calls from
/// other code are dropped (the argument is returned unchanged) so they cannot
/// race the commit's own reconciliation.
pub struct IdentityCache<K: CacheKey> {
    entity_type: Arc<EntityType>,
    committing: Arc<AtomicBool>,
    inner: Mutex<CacheInner<K>>,
}

impl<K: CacheKey> IdentityCache<K> {
    /// Creates an empty cache for `entity_type`.
    ///
    /// `committing` is the owning context's commit flag.
    #[must_use]
    pub fn new(entity_type: Arc<EntityType>, committing: Arc<AtomicBool>) -> Self {
        Self {
            entity_type,
            committing,
            inner: Mutex::new(CacheInner::new()),
        }
    }

    /// Entity type served by this cache.
    #[must_use]
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Inserts or reconciles `entity`, returning the canonical instance.
    ///
    /// The returned instance may differ from the argument when an equivalent
    /// instance was already cached; callers must use the returned one from
    /// then on. With `for_import`, the incoming row's deletion flag decides
    /// between by-key and tombstones instead of merging into what is cached.
    ///
    /// # Errors
    ///
    /// - `DuplicateObject` if a different new instance already holds the key
    /// - `MissingOrInvalidPrimaryKey` if a persisted entity has no usable key
    /// - `InvalidOperation` if the entity belongs to another type
    pub fn cache(&self, entity: &EntityRef, for_import: bool) -> CoreResult<EntityRef> {
        self.check_type(entity)?;
        let mut inner = self.inner.lock();
        self.cache_locked(&mut inner, entity, for_import, true)
    }

    fn cache_locked(
        &self,
        inner: &mut CacheInner<K>,
        entity: &EntityRef,
        for_import: bool,
        honor_commit_gate: bool,
    ) -> CoreResult<EntityRef> {
        let committing = honor_commit_gate && self.committing.load(Ordering::SeqCst);
        let id = entity.instance_id();

        if entity.is_new() {
            if !entity.primary_key_ready() {
                if matches!(inner.slot_of(id), Some(Slot::NotReady)) {
                    return Ok(Arc::clone(entity));
                }
                if committing {
                    self.skip("not-ready new object");
                    return Ok(Arc::clone(entity));
                }
                inner.place(entity, Slot::NotReady);
                return Ok(Arc::clone(entity));
            }

            let key = self.key_of(entity)?;
            if let Some(existing) = inner.ready_new.get(&key) {
                if *existing != id {
                    return Err(CoreError::duplicate_object(entity.to_string()));
                }
            }
            if committing {
                self.skip("new object");
                return Ok(Arc::clone(entity));
            }
            inner.place(entity, Slot::ReadyNew(key));
            return Ok(Arc::clone(entity));
        }

        if let Some(predicate) = entity.predicate() {
            if let Some(existing) = inner
                .by_predicate
                .get(&predicate)
                .and_then(|existing| inner.entity(*existing))
            {
                existing.swap_data(entity);
                return Ok(existing);
            }
            if committing {
                self.skip("predicate-deflated object");
                return Ok(Arc::clone(entity));
            }
            inner.place(entity, Slot::ByPredicate(predicate));
            return Ok(Arc::clone(entity));
        }

        if entity.is_missing_server_generated_keys() {
            return Ok(Arc::clone(entity));
        }
        let key = self.key_of(entity)?;

        if !for_import {
            if let Some(existing) = inner.by_key.get(&key).and_then(|e| inner.entity(*e)) {
                let deleted = existing.is_deleted();
                existing.swap_data(entity);
                if deleted {
                    existing.set_deleted(true);
                }
                return Ok(existing);
            }
        }

        if !for_import {
            if let Some(tombstone) = inner.tombstones.get(&key).and_then(|e| inner.entity(*e)) {
                tombstone.swap_data(entity);
                tombstone.set_deleted(true);
                return Ok(tombstone);
            }
        }

        if committing {
            self.skip("object");
            return Ok(Arc::clone(entity));
        }
        if for_import {
            // The imported instance replaces whatever held the key.
            for existing in [inner.by_key.get(&key), inner.tombstones.get(&key)]
                .into_iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>()
            {
                if existing != id {
                    inner.unplace(existing);
                }
            }
        }
        let slot = if for_import && entity.is_deleted() {
            Slot::Tombstoned {
                key,
                pending_delete: false,
            }
        } else {
            Slot::ByKey(key)
        };
        inner.place(entity, slot);
        Ok(Arc::clone(entity))
    }

    /// Looks up a live, persisted entity by key component values.
    ///
    /// Only the by-key partition is searched: pending new objects and
    /// tombstones are never returned.
    #[must_use]
    pub fn get(&self, key_components: &[Value]) -> Option<EntityRef> {
        let key = K::from_components(key_components)?;
        self.get_by_key(&key)
    }

    /// Looks up a live, persisted entity by typed key.
    #[must_use]
    pub fn get_by_key(&self, key: &K) -> Option<EntityRef> {
        let inner = self.inner.lock();
        inner.by_key.get(key).and_then(|id| inner.entity(*id))
    }

    /// Looks up a placeholder by its predicate identity.
    #[must_use]
    pub fn get_by_predicate(&self, predicate: &DeflatedPredicate) -> Option<EntityRef> {
        let inner = self.inner.lock();
        inner.by_predicate.get(predicate).and_then(|id| inner.entity(*id))
    }

    /// Removes `entity` from whichever partition holds it.
    ///
    /// An evicted new object becomes transient again. Persisted entities
    /// whose store-assigned key is still missing cannot be located and are
    /// left alone.
    pub fn evict(&self, entity: &EntityRef) {
        if self.committing.load(Ordering::SeqCst) {
            self.skip("eviction");
            return;
        }
        let mut inner = self.inner.lock();
        let id = entity.instance_id();

        if entity.is_new() {
            if matches!(
                inner.slot_of(id),
                Some(Slot::NotReady | Slot::ReadyNew(_))
            ) {
                inner.unplace(id);
            }
            return;
        }

        if let Some(predicate) = entity.predicate() {
            if let Some(existing) = inner.by_predicate.get(&predicate).copied() {
                inner.unplace(existing);
            }
            return;
        }

        if entity.is_missing_server_generated_keys() {
            return;
        }
        let Some(key) = entity.key::<K>() else {
            return;
        };
        if let Some(existing) = inner.by_key.get(&key).copied() {
            inner.unplace(existing);
        }
        if let Some(existing) = inner.tombstones.get(&key).copied() {
            inner.unplace(existing);
        }
    }

    /// Records that `entity` was deleted.
    ///
    /// New entities are dropped from the cache entirely. Persisted entities
    /// move to the tombstones, keyed by their primary key, and lose any
    /// predicate mapping.
    ///
    /// # Errors
    ///
    /// Returns `MissingOrInvalidPrimaryKey` if a persisted entity has no
    /// usable key.
    pub fn deleted(&self, entity: &EntityRef) -> CoreResult<()> {
        self.check_type(entity)?;
        let mut inner = self.inner.lock();
        let id = entity.instance_id();

        if entity.is_new() {
            if matches!(
                inner.slot_of(id),
                Some(Slot::NotReady | Slot::ReadyNew(_))
            ) {
                inner.unplace(id);
            }
            return Ok(());
        }

        let key = self.key_of(entity)?;
        if let Some(predicate) = entity.predicate() {
            if let Some(existing) = inner.by_predicate.get(&predicate).copied() {
                inner.unplace(existing);
            }
        }
        if let Some(existing) = inner.by_key.get(&key).copied() {
            inner.unplace(existing);
        }
        inner.place(
            entity,
            Slot::Tombstoned {
                key,
                pending_delete: true,
            },
        );
        Ok(())
    }

    /// Promotes not-ready entities whose key has become complete.
    ///
    /// Either every not-ready entity is promoted to ready-new, or nothing
    /// changes and an error names one offender.
    ///
    /// # Errors
    ///
    /// - `MissingOrInvalidPrimaryKey` if some entity's key is still incomplete
    /// - `DuplicateObject` if a promoted key collides with another new entity
    pub fn assert_ready_for_commit(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.not_ready.is_empty() {
            return Ok(());
        }

        let pending = inner.entities(inner.not_ready.keys());
        if let Some(blocked) = pending.iter().find(|e| !e.primary_key_ready()) {
            return Err(CoreError::missing_primary_key(blocked.to_string()));
        }

        let mut promotions = Vec::with_capacity(pending.len());
        let mut seen = HashSet::new();
        for entity in pending {
            let key = self.key_of(&entity)?;
            let taken = inner
                .ready_new
                .get(&key)
                .is_some_and(|existing| *existing != entity.instance_id());
            if taken || !seen.insert(key.clone()) {
                return Err(CoreError::duplicate_object(entity.to_string()));
            }
            promotions.push((entity, key));
        }

        for (entity, key) in promotions {
            inner.place(&entity, Slot::ReadyNew(key));
        }
        Ok(())
    }

    /// Graduates ready-new entities to persisted after a durable commit.
    ///
    /// Every ready-new entity loses its new and modified flags and is cached
    /// again, landing in by-key and replacing any tombstone left under the
    /// same key; every by-key entity loses its modified flag; tombstones no
    /// longer carry a pending delete.
    ///
    /// # Errors
    ///
    /// Propagates key errors from re-caching, which cannot occur for
    /// entities that passed [`assert_ready_for_commit`](Self::assert_ready_for_commit).
    pub fn process_after_commit(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();

        let graduated = inner.entities(inner.ready_new.values());
        for entity in &graduated {
            inner.unplace(entity.instance_id());
            entity.set_new(false);
            entity.reset_modified();
        }
        for entity in &graduated {
            // The graduated row is now the durable one for its key.
            let key = self.key_of(entity)?;
            let stale: Vec<InstanceId> = [inner.by_key.get(&key), inner.tombstones.get(&key)]
                .into_iter()
                .flatten()
                .copied()
                .filter(|id| *id != entity.instance_id())
                .collect();
            for id in stale {
                inner.unplace(id);
            }
            self.cache_locked(&mut inner, entity, false, false)?;
        }

        for id in inner.by_key.values() {
            if let Some(tracked) = inner.tracked.get(id) {
                tracked.entity.reset_modified();
            }
        }
        for tracked in inner.tracked.values_mut() {
            if let Slot::Tombstoned { pending_delete, .. } = &mut tracked.slot {
                *pending_delete = false;
            }
        }
        Ok(())
    }

    /// Drops every entity (post-rollback).
    pub fn discard(&self) {
        self.inner.lock().clear();
    }

    /// Partition currently holding `entity`, if it is tracked.
    #[must_use]
    pub fn partition_of(&self, entity: &EntityRef) -> Option<Partition> {
        self.inner
            .lock()
            .slot_of(entity.instance_id())
            .map(Slot::partition)
    }

    /// New entities with a complete key.
    #[must_use]
    pub fn new_objects(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.ready_new.values())
    }

    /// New entities still waiting on key components.
    #[must_use]
    pub fn not_ready_objects(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.not_ready.keys())
    }

    /// Persisted entities.
    #[must_use]
    pub fn objects_by_key(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.by_key.values())
    }

    /// Predicate placeholders.
    #[must_use]
    pub fn objects_by_predicate(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.by_predicate.values())
    }

    /// Tombstoned entities.
    #[must_use]
    pub fn deleted_objects(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.tombstones.values())
    }

    /// Number of tracked entities across all partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tracked.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_type(&self, entity: &EntityRef) -> CoreResult<()> {
        if entity.entity_type().name() == self.entity_type.name() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{entity} cannot be cached as {}",
                self.entity_type
            )))
        }
    }

    fn key_of(&self, entity: &EntityRef) -> CoreResult<K> {
        entity
            .key::<K>()
            .ok_or_else(|| CoreError::missing_primary_key(entity.to_string()))
    }

    fn skip(&self, what: &str) {
        debug!(
            entity_type = %self.entity_type,
            "skipping cache update of {what} because commit in progress"
        );
    }
}

impl<K: CacheKey> ObjectCache for IdentityCache<K> {
    fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    fn cache(&self, entity: &EntityRef, for_import: bool) -> CoreResult<EntityRef> {
        IdentityCache::cache(self, entity, for_import)
    }

    fn get(&self, key_components: &[Value]) -> Option<EntityRef> {
        IdentityCache::get(self, key_components)
    }

    fn get_by_predicate(&self, predicate: &DeflatedPredicate) -> Option<EntityRef> {
        IdentityCache::get_by_predicate(self, predicate)
    }

    fn evict(&self, entity: &EntityRef) {
        IdentityCache::evict(self, entity);
    }

    fn deleted(&self, entity: &EntityRef) -> CoreResult<()> {
        IdentityCache::deleted(self, entity)
    }

    fn assert_ready_for_commit(&self) -> CoreResult<()> {
        IdentityCache::assert_ready_for_commit(self)
    }

    fn process_after_commit(&self) -> CoreResult<()> {
        IdentityCache::process_after_commit(self)
    }

    fn discard(&self) {
        IdentityCache::discard(self);
    }

    fn pending_inserts(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner.entities(inner.not_ready.keys().chain(inner.ready_new.values()))
    }

    fn pending_updates(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        inner
            .entities(inner.by_key.values().chain(inner.by_predicate.values()))
            .into_iter()
            .filter(|e| e.is_modified() && !e.is_deleted())
            .collect()
    }

    fn pending_deletes(&self) -> Vec<EntityRef> {
        let inner = self.inner.lock();
        let ids: Vec<InstanceId> = inner
            .tracked
            .iter()
            .filter(|(_, t)| {
                matches!(
                    t.slot,
                    Slot::Tombstoned {
                        pending_delete: true,
                        ..
                    }
                )
            })
            .map(|(id, _)| *id)
            .collect();
        inner.entities(ids.iter())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, PrimaryKey};
    use ormid_store::Row;

    fn dog_type() -> Arc<EntityType> {
        EntityType::builder("Dog")
            .generated_key("id")
            .field("name")
            .build()
    }

    fn cache() -> IdentityCache<i64> {
        IdentityCache::new(dog_type(), Arc::new(AtomicBool::new(false)))
    }

    fn loaded(ty: &Arc<EntityType>, id: i64, name: &str) -> EntityRef {
        Entity::from_row(
            Arc::clone(ty),
            &Row::new().with("id", id).with("name", name),
            false,
        )
    }

    #[test]
    fn first_instance_wins_and_merges() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let first = loaded(&ty, 1, "rex");
        let second = loaded(&ty, 1, "max");

        let a = cache.cache(&first, false).unwrap();
        let b = cache.cache(&second, false).unwrap();

        assert!(Arc::ptr_eq(&a, &first));
        assert!(Arc::ptr_eq(&b, &first));
        assert_eq!(first.get("name"), Value::from("max"));
        assert!(Arc::ptr_eq(&cache.get(&[Value::BigInt(1)]).unwrap(), &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn recreated_key_replaces_tombstone_after_commit() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let old = loaded(&ty, 4, "rex");
        cache.cache(&old, false).unwrap();
        old.set_deleted(true);
        cache.deleted(&old).unwrap();

        let fresh = Entity::new_object(Arc::clone(&ty));
        fresh.set("id", 4i64).unwrap();
        fresh.set("name", "max").unwrap();
        cache.cache(&fresh, false).unwrap();
        cache.assert_ready_for_commit().unwrap();
        cache.process_after_commit().unwrap();

        let found = cache.get(&[Value::BigInt(4)]).unwrap();
        assert!(Arc::ptr_eq(&found, &fresh));
        assert_eq!(cache.partition_of(&fresh), Some(Partition::ByKey));
        assert_eq!(cache.partition_of(&old), None);
        assert!(!fresh.is_new());
        assert!(!fresh.is_deleted());
        assert_eq!(old.get("name"), Value::from("rex"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn new_object_promotion() {
        let cache = cache();
        let dog = Entity::new_object(Arc::clone(cache.entity_type()));
        dog.set("name", "rex").unwrap();

        cache.cache(&dog, false).unwrap();
        assert_eq!(cache.partition_of(&dog), Some(Partition::NotReady));

        dog.assign_generated("id", Value::BigInt(10));
        assert!(cache.get(&[Value::BigInt(10)]).is_none());

        cache.assert_ready_for_commit().unwrap();
        assert_eq!(cache.partition_of(&dog), Some(Partition::ReadyNew));
        assert!(cache.get(&[Value::BigInt(10)]).is_none());

        cache.process_after_commit().unwrap();
        let found = cache.get(&[Value::BigInt(10)]).unwrap();
        assert!(Arc::ptr_eq(&found, &dog));
        assert!(!dog.is_new());
        assert!(!dog.is_modified());
        assert!(cache.new_objects().is_empty());
    }

    #[test]
    fn caching_not_ready_twice_is_idempotent() {
        let cache = cache();
        let dog = Entity::new_object(Arc::clone(cache.entity_type()));
        cache.cache(&dog, false).unwrap();
        cache.cache(&dog, false).unwrap();
        assert_eq!(cache.not_ready_objects().len(), 1);
    }

    #[test]
    fn duplicate_new_objects_rejected() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let a = Entity::new_object(Arc::clone(&ty));
        let b = Entity::new_object(ty);
        a.set("id", 5i64).unwrap();
        b.set("id", 5i64).unwrap();

        cache.cache(&a, false).unwrap();
        assert!(cache.cache(&a, false).is_ok());
        let err = cache.cache(&b, false).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateObject { .. }));
    }

    #[test]
    fn assert_ready_failure_changes_nothing() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let ready = Entity::new_object(Arc::clone(&ty));
        let stuck = Entity::new_object(ty);
        cache.cache(&ready, false).unwrap();
        cache.cache(&stuck, false).unwrap();
        ready.assign_generated("id", Value::BigInt(1));

        let err = cache.assert_ready_for_commit().unwrap_err();
        assert!(matches!(err, CoreError::MissingOrInvalidPrimaryKey { .. }));
        assert_eq!(cache.partition_of(&ready), Some(Partition::NotReady));
        assert_eq!(cache.partition_of(&stuck), Some(Partition::NotReady));
        assert!(cache.new_objects().is_empty());
    }

    #[test]
    fn delete_then_recache_converges_on_tombstone() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let e2 = loaded(&ty, 7, "rex");
        cache.cache(&e2, false).unwrap();
        e2.set_deleted(true);
        cache.deleted(&e2).unwrap();
        assert!(cache.get(&[Value::BigInt(7)]).is_none());

        let e3 = loaded(&ty, 7, "rex again");
        let result = cache.cache(&e3, false).unwrap();
        assert!(Arc::ptr_eq(&result, &e2));
        assert!(e2.is_deleted());
        assert_eq!(e2.get("name"), Value::from("rex again"));
        assert_eq!(cache.partition_of(&e2), Some(Partition::Tombstoned));
    }

    #[test]
    fn import_promotes_out_of_tombstones() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let gone = loaded(&ty, 3, "rex");
        cache.cache(&gone, false).unwrap();
        gone.set_deleted(true);
        cache.deleted(&gone).unwrap();

        let revived = loaded(&ty, 3, "rex");
        let result = cache.cache(&revived, true).unwrap();
        assert!(Arc::ptr_eq(&result, &revived));
        assert!(Arc::ptr_eq(&cache.get(&[Value::BigInt(3)]).unwrap(), &revived));
        assert!(cache.deleted_objects().is_empty());
        assert_eq!(cache.partition_of(&gone), None);
    }

    #[test]
    fn import_of_deleted_row_goes_to_tombstones() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let row = Entity::from_row(ty, &Row::new().with("id", 4i64), true);
        cache.cache(&row, true).unwrap();
        assert_eq!(cache.partition_of(&row), Some(Partition::Tombstoned));
        assert!(cache.get(&[Value::BigInt(4)]).is_none());
        assert!(ObjectCache::pending_deletes(&cache).is_empty());
    }

    #[test]
    fn import_replaces_live_instance() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let live = loaded(&ty, 5, "rex");
        cache.cache(&live, false).unwrap();

        let replacement = loaded(&ty, 5, "max");
        cache.cache(&replacement, true).unwrap();
        assert!(Arc::ptr_eq(&cache.get(&[Value::BigInt(5)]).unwrap(), &replacement));
        assert_eq!(cache.partition_of(&live), None);

        let gone = Entity::from_row(ty, &Row::new().with("id", 5i64), true);
        cache.cache(&gone, true).unwrap();
        assert!(cache.get(&[Value::BigInt(5)]).is_none());
        assert_eq!(cache.partition_of(&replacement), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deleted_flag_survives_merge() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let dog = loaded(&ty, 2, "rex");
        cache.cache(&dog, false).unwrap();
        dog.set_deleted(true);

        let fresh = loaded(&ty, 2, "rex");
        let result = cache.cache(&fresh, false).unwrap();
        assert!(Arc::ptr_eq(&result, &dog));
        assert!(dog.is_deleted());
    }

    #[test]
    fn predicate_placeholders_merge() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let predicate = DeflatedPredicate::new("name = 'rex'");
        let first = Entity::deflated(Arc::clone(&ty), predicate.clone(), &Row::new());
        let second = Entity::deflated(ty, predicate.clone(), &Row::new().with("name", "rex"));

        cache.cache(&first, false).unwrap();
        let result = cache.cache(&second, false).unwrap();
        assert!(Arc::ptr_eq(&result, &first));
        assert_eq!(first.get("name"), Value::from("rex"));
        assert!(Arc::ptr_eq(&cache.get_by_predicate(&predicate).unwrap(), &first));

        first.set_deleted(true);
        first.assign_generated("id", Value::BigInt(8));
        cache.deleted(&first).unwrap();
        assert!(cache.get_by_predicate(&predicate).is_none());
        assert_eq!(cache.partition_of(&first), Some(Partition::Tombstoned));
    }

    #[test]
    fn evict_removes_from_every_partition() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());

        let fresh = Entity::new_object(Arc::clone(&ty));
        cache.cache(&fresh, false).unwrap();
        cache.evict(&fresh);
        assert_eq!(cache.partition_of(&fresh), None);

        let live = loaded(&ty, 1, "rex");
        cache.cache(&live, false).unwrap();
        cache.evict(&live);
        assert!(cache.get(&[Value::BigInt(1)]).is_none());

        let dead = loaded(&ty, 2, "max");
        cache.cache(&dead, false).unwrap();
        cache.deleted(&dead).unwrap();
        cache.evict(&dead);
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_without_generated_key_is_noop() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let live = loaded(&ty, 1, "rex");
        cache.cache(&live, false).unwrap();

        let keyless = Entity::from_row(ty, &Row::new().with("name", "rex"), false);
        cache.evict(&keyless);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deleting_new_object_forgets_it() {
        let cache = cache();
        let dog = Entity::new_object(Arc::clone(cache.entity_type()));
        dog.set("id", 4i64).unwrap();
        cache.cache(&dog, false).unwrap();
        cache.deleted(&dog).unwrap();
        assert!(cache.is_empty());
        assert!(ObjectCache::pending_deletes(&cache).is_empty());
    }

    #[test]
    fn commit_gate_drops_new_entries() {
        let committing = Arc::new(AtomicBool::new(false));
        let cache: IdentityCache<i64> = IdentityCache::new(dog_type(), Arc::clone(&committing));
        let ty = Arc::clone(cache.entity_type());
        let existing = loaded(&ty, 1, "rex");
        cache.cache(&existing, false).unwrap();

        committing.store(true, Ordering::SeqCst);
        let other = loaded(&ty, 2, "max");
        let returned = cache.cache(&other, false).unwrap();
        assert!(Arc::ptr_eq(&returned, &other));
        assert!(cache.get(&[Value::BigInt(2)]).is_none());

        // Merges into existing instances still converge.
        let update = loaded(&ty, 1, "rex2");
        let merged = cache.cache(&update, false).unwrap();
        assert!(Arc::ptr_eq(&merged, &existing));

        cache.evict(&existing);
        assert!(cache.get(&[Value::BigInt(1)]).is_some());
    }

    #[test]
    fn pending_writes_enumerated() {
        let cache = cache();
        let ty = Arc::clone(cache.entity_type());
        let fresh = Entity::new_object(Arc::clone(&ty));
        cache.cache(&fresh, false).unwrap();
        let changed = loaded(&ty, 1, "rex");
        cache.cache(&changed, false).unwrap();
        changed.set("name", "max").unwrap();
        let clean = loaded(&ty, 2, "fido");
        cache.cache(&clean, false).unwrap();
        let gone = loaded(&ty, 3, "spot");
        cache.cache(&gone, false).unwrap();
        cache.deleted(&gone).unwrap();

        assert_eq!(ObjectCache::pending_inserts(&cache).len(), 1);
        let updates = ObjectCache::pending_updates(&cache);
        assert_eq!(updates.len(), 1);
        assert!(Arc::ptr_eq(&updates[0], &changed));
        assert_eq!(ObjectCache::pending_deletes(&cache).len(), 1);
    }

    #[test]
    fn wrong_type_rejected() {
        let cache = cache();
        let cat = EntityType::builder("Cat").key("id").build();
        let entity = Entity::from_row(cat, &Row::new().with("id", 1i64), false);
        assert!(matches!(
            cache.cache(&entity, false),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn composite_keys() {
        let shop = EntityType::builder("Shop").key("region").key("number").build();
        let cache: IdentityCache<PrimaryKey> =
            IdentityCache::new(Arc::clone(&shop), Arc::new(AtomicBool::new(false)));
        let row = Row::new().with("region", "eu").with("number", 4i64);
        let a = Entity::from_row(Arc::clone(&shop), &row, false);
        let b = Entity::from_row(shop, &row, false);

        cache.cache(&a, false).unwrap();
        assert!(Arc::ptr_eq(&cache.cache(&b, false).unwrap(), &a));
        assert!(cache
            .get(&[Value::from("eu"), Value::BigInt(4)])
            .is_some());
        assert!(cache.get(&[Value::from("eu")]).is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn first_cached_instance_stays_canonical(keys in prop::collection::vec(0i64..6, 1..40)) {
                let cache = cache();
                let ty = Arc::clone(cache.entity_type());
                let mut first: HashMap<i64, EntityRef> = HashMap::new();

                for key in keys {
                    let incoming = loaded(&ty, key, "x");
                    let canonical = cache.cache(&incoming, false).unwrap();
                    let expected = first.entry(key).or_insert_with(|| Arc::clone(&incoming));
                    prop_assert!(Arc::ptr_eq(&canonical, expected));
                    prop_assert!(Arc::ptr_eq(&cache.get(&[Value::BigInt(key)]).unwrap(), expected));
                }
                prop_assert_eq!(cache.len(), first.len());
            }

            #[test]
            fn failed_readiness_moves_nothing(assigned in prop::collection::vec(any::<bool>(), 1..12)) {
                let cache = cache();
                let ty = Arc::clone(cache.entity_type());
                let entities: Vec<EntityRef> = assigned
                    .iter()
                    .enumerate()
                    .map(|(i, ready)| {
                        let e = Entity::new_object(Arc::clone(&ty));
                        cache.cache(&e, false).unwrap();
                        if *ready {
                            e.assign_generated("id", Value::BigInt(i as i64));
                        }
                        e
                    })
                    .collect();
                let before: Vec<_> = entities.iter().map(|e| cache.partition_of(e)).collect();

                let result = cache.assert_ready_for_commit();
                let after: Vec<_> = entities.iter().map(|e| cache.partition_of(e)).collect();
                if assigned.iter().all(|ready| *ready) {
                    prop_assert!(result.is_ok());
                    prop_assert!(after.iter().all(|p| *p == Some(Partition::ReadyNew)));
                } else {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(before, after);
                }
            }
        }
    }
}
