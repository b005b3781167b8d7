//! Identity caches.
//!
//! A transaction context owns one cache per entity type. [`IdentityCache`]
//! is generic over the key type; [`ObjectCache`] erases the key so a context
//! can drive caches of different types uniformly at commit time.

mod identity;

pub use identity::IdentityCache;

use crate::entity::{DeflatedPredicate, EntityRef, EntityType};
use crate::error::CoreResult;
use ormid_store::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The partition an entity currently occupies in its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// New, key incomplete.
    NotReady,
    /// New, key complete, not yet durable.
    ReadyNew,
    /// Persisted and live.
    ByKey,
    /// Placeholder identified by a query predicate.
    ByPredicate,
    /// Persisted and deleted.
    Tombstoned,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Partition::NotReady => "not-ready",
            Partition::ReadyNew => "ready-new",
            Partition::ByKey => "by-key",
            Partition::ByPredicate => "by-predicate",
            Partition::Tombstoned => "tombstoned",
        };
        f.write_str(name)
    }
}

/// Key-erased view of an identity cache.
///
/// See [`IdentityCache`] for the semantics of each operation.
pub trait ObjectCache: Send + Sync {
    /// Entity type served by this cache.
    fn entity_type(&self) -> &Arc<EntityType>;

    /// Inserts or reconciles an entity, returning the canonical instance.
    ///
    /// # Errors
    ///
    /// See [`IdentityCache::cache`].
    fn cache(&self, entity: &EntityRef, for_import: bool) -> CoreResult<EntityRef>;

    /// Looks up a persisted entity by key component values.
    fn get(&self, key_components: &[Value]) -> Option<EntityRef>;

    /// Looks up a placeholder by predicate.
    fn get_by_predicate(&self, predicate: &DeflatedPredicate) -> Option<EntityRef>;

    /// Removes an entity from the cache.
    fn evict(&self, entity: &EntityRef);

    /// Records a deletion.
    ///
    /// # Errors
    ///
    /// See [`IdentityCache::deleted`].
    fn deleted(&self, entity: &EntityRef) -> CoreResult<()>;

    /// Promotes not-ready entities, all or nothing.
    ///
    /// # Errors
    ///
    /// See [`IdentityCache::assert_ready_for_commit`].
    fn assert_ready_for_commit(&self) -> CoreResult<()>;

    /// Reconciles partitions after a durable commit.
    ///
    /// # Errors
    ///
    /// See [`IdentityCache::process_after_commit`].
    fn process_after_commit(&self) -> CoreResult<()>;

    /// Drops every entity.
    fn discard(&self);

    /// New entities, in creation order.
    fn pending_inserts(&self) -> Vec<EntityRef>;

    /// Live persisted entities with unsaved changes.
    fn pending_updates(&self) -> Vec<EntityRef>;

    /// Deleted persisted entities whose delete has not been committed.
    fn pending_deletes(&self) -> Vec<EntityRef>;

    /// Upcast for downcasting to the concrete cache.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
