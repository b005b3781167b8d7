//! Entity handles.

use crate::entity::key::{CacheKey, DeflatedPredicate};
use crate::entity::metadata::EntityType;
use crate::error::{CoreError, CoreResult};
use crate::types::InstanceId;
use ormid_store::{Row, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Shared reference to an entity instance.
///
/// Every holder of an `EntityRef` sees the same instance; the identity cache
/// guarantees at most one live instance per key within a transaction context.
pub type EntityRef = Arc<Entity>;

/// A persisted-object instance.
///
/// Field values and flags live behind a per-entity mutex. Which cache
/// partition an entity belongs to is owned by the identity cache, not by the
/// entity; callers change it only through cache operations.
pub struct Entity {
    instance: InstanceId,
    entity_type: Arc<EntityType>,
    state: Mutex<EntityState>,
}

#[derive(Debug, Clone, Default)]
struct EntityState {
    values: HashMap<String, Value>,
    is_new: bool,
    is_deleted: bool,
    modified: BTreeSet<String>,
    predicate: Option<DeflatedPredicate>,
}

impl Entity {
    fn with_state(entity_type: Arc<EntityType>, state: EntityState) -> EntityRef {
        Arc::new(Self {
            instance: InstanceId::next(),
            entity_type,
            state: Mutex::new(state),
        })
    }

    /// Creates a transient instance that has never been persisted.
    pub(crate) fn new_object(entity_type: Arc<EntityType>) -> EntityRef {
        Self::with_state(
            entity_type,
            EntityState {
                is_new: true,
                ..EntityState::default()
            },
        )
    }

    /// Creates an instance from a row read from (or imported into) the store.
    ///
    /// Columns the type does not declare are ignored.
    pub(crate) fn from_row(entity_type: Arc<EntityType>, row: &Row, deleted: bool) -> EntityRef {
        let values = row
            .iter()
            .filter(|(column, _)| entity_type.has_column(column))
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect();
        Self::with_state(
            entity_type,
            EntityState {
                values,
                is_deleted: deleted,
                ..EntityState::default()
            },
        )
    }

    /// Creates a placeholder whose identity is a query predicate.
    pub(crate) fn deflated(
        entity_type: Arc<EntityType>,
        predicate: DeflatedPredicate,
        row: &Row,
    ) -> EntityRef {
        let entity = Self::from_row(entity_type, row, false);
        entity.state.lock().predicate = Some(predicate);
        entity
    }

    /// Reference identity of this instance.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Returns true if `self` and `other` are the same instance.
    #[must_use]
    pub fn same_instance(&self, other: &Entity) -> bool {
        self.instance == other.instance
    }

    /// Metadata of the entity's type.
    #[must_use]
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Current value of `column` (`Null` when unset).
    #[must_use]
    pub fn get(&self, column: &str) -> Value {
        self.state
            .lock()
            .values
            .get(column)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Sets a field value and marks it modified.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the type has no such column, or if the
    /// column is a key component of an entity that has already been persisted.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> CoreResult<()> {
        if !self.entity_type.has_column(column) {
            return Err(CoreError::invalid_operation(format!(
                "{} has no column {column}",
                self.entity_type
            )));
        }
        let mut state = self.state.lock();
        if !state.is_new && self.entity_type.is_key_component(column) {
            return Err(CoreError::invalid_operation(format!(
                "primary key column {column} of persisted {} cannot change",
                self.entity_type
            )));
        }
        state.values.insert(column.to_string(), value.into());
        state.modified.insert(column.to_string());
        Ok(())
    }

    /// Snapshot of every declared column, key components first.
    #[must_use]
    pub fn to_row(&self) -> Row {
        let state = self.state.lock();
        self.entity_type
            .columns()
            .map(|c| {
                (
                    c.to_string(),
                    state.values.get(c).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Snapshot of modified non-key columns.
    #[must_use]
    pub fn modified_row(&self) -> Row {
        let state = self.state.lock();
        state
            .modified
            .iter()
            .filter(|c| !self.entity_type.is_key_component(c))
            .map(|c| {
                (
                    c.clone(),
                    state.values.get(c).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Created this session and never persisted.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.lock().is_new
    }

    /// Marked deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state.lock().is_deleted
    }

    /// Has unsaved field changes.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.state.lock().modified.is_empty()
    }

    /// Names of modified columns.
    #[must_use]
    pub fn modified_fields(&self) -> Vec<String> {
        self.state.lock().modified.iter().cloned().collect()
    }

    /// Predicate identity, for placeholders created from a query.
    #[must_use]
    pub fn predicate(&self) -> Option<DeflatedPredicate> {
        self.state.lock().predicate.clone()
    }

    /// Key component values in key order (`Null` where unset).
    #[must_use]
    pub fn primary_key_values(&self) -> Vec<Value> {
        let state = self.state.lock();
        self.entity_type
            .key_components()
            .iter()
            .map(|k| state.values.get(&k.name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// All key components, server-generated ones included, have values.
    #[must_use]
    pub fn primary_key_ready(&self) -> bool {
        let state = self.state.lock();
        !self.entity_type.key_components().is_empty()
            && self
                .entity_type
                .key_components()
                .iter()
                .all(|k| state.values.get(&k.name).is_some_and(|v| !v.is_null()))
    }

    /// The type declares store-assigned key components.
    #[must_use]
    pub fn has_server_generated_key_components(&self) -> bool {
        self.entity_type.has_server_generated_key_components()
    }

    /// Some store-assigned key component has no value yet.
    #[must_use]
    pub fn is_missing_server_generated_keys(&self) -> bool {
        let state = self.state.lock();
        self.entity_type
            .server_generated_components()
            .any(|k| state.values.get(&k.name).map_or(true, Value::is_null))
    }

    /// The entity's key as `K`, if every component is set.
    #[must_use]
    pub fn key<K: CacheKey>(&self) -> Option<K> {
        K::from_components(&self.primary_key_values())
    }

    pub(crate) fn set_new(&self, value: bool) {
        self.state.lock().is_new = value;
    }

    pub(crate) fn set_deleted(&self, value: bool) {
        self.state.lock().is_deleted = value;
    }

    pub(crate) fn reset_modified(&self) {
        self.state.lock().modified.clear();
    }

    /// Writes a value produced by the store (e.g. a generated key).
    pub(crate) fn assign_generated(&self, column: &str, value: Value) {
        self.state.lock().values.insert(column.to_string(), value);
    }

    /// Merges `source`'s field values, change set and deletion flag into this
    /// instance. Identity, newness and predicate of `self` are kept.
    pub(crate) fn swap_data(&self, source: &Entity) {
        if self.same_instance(source) {
            return;
        }
        let incoming = source.state.lock().clone();
        let mut state = self.state.lock();
        state.values.extend(incoming.values);
        state.modified = incoming.modified;
        state.is_deleted = incoming.is_deleted;
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "{}(", self.entity_type)?;
        for (i, k) in self.entity_type.key_components().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let value = state.values.get(&k.name).cloned().unwrap_or(Value::Null);
            write!(f, "{}={value}", k.name)?;
        }
        f.write_str(")")?;
        if let Some(predicate) = &state.predicate {
            write!(f, "[{predicate}]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Entity")
            .field("instance", &self.instance)
            .field("type", &self.entity_type.name())
            .field("is_new", &state.is_new)
            .field("is_deleted", &state.is_deleted)
            .field("values", &state.values)
            .finish_non_exhaustive()
    }
}
