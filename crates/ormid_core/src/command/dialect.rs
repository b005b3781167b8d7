//! SQL generation.

use crate::entity::{Entity, EntityType};
use ormid_store::{Command, Row, Value};

/// Produces the statements a command boundary sends for entity writes and
/// key lookups.
///
/// Parameters are positional; the dialect decides the placeholder syntax.
pub trait SqlDialect: Send + Sync {
    /// Insert statement for a new entity.
    ///
    /// Server-generated key components without a value must be requested
    /// back from the store (`RETURNING`), so the boundary can write them into
    /// the entity.
    fn insert(&self, entity: &Entity) -> Command;

    /// Update statement writing `changes` to the row identified by the
    /// entity's key.
    fn update(&self, entity: &Entity, changes: &Row) -> Command;

    /// Delete statement for the row identified by the entity's key.
    fn delete(&self, entity: &Entity) -> Command;

    /// Query selecting every column of the row with the given key.
    fn select_by_key(&self, entity_type: &EntityType, key: &[Value]) -> Command;
}

/// Portable dialect using `?` placeholders and `RETURNING`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicDialect;

impl BasicDialect {
    fn key_filter(entity_type: &EntityType) -> String {
        entity_type
            .key_components()
            .iter()
            .map(|k| format!("{} = ?", k.name))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl SqlDialect for BasicDialect {
    fn insert(&self, entity: &Entity) -> Command {
        let entity_type = entity.entity_type();
        let mut columns = Vec::new();
        let mut params = Vec::new();
        let mut returning = Vec::new();
        for (column, value) in entity.to_row().iter() {
            let generated = entity_type
                .server_generated_components()
                .any(|k| k.name == column);
            if generated && value.is_null() {
                returning.push(column.to_string());
                continue;
            }
            columns.push(column.to_string());
            params.push(value.clone());
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            entity_type.table(),
            columns.join(", ")
        );
        if !returning.is_empty() {
            sql.push_str(" RETURNING ");
            sql.push_str(&returning.join(", "));
        }
        Command::new(sql).with_params(params)
    }

    fn update(&self, entity: &Entity, changes: &Row) -> Command {
        let entity_type = entity.entity_type();
        let assignments = changes
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {}",
            entity_type.table(),
            Self::key_filter(entity_type)
        );
        let mut params: Vec<Value> = changes.iter().map(|(_, v)| v.clone()).collect();
        params.extend(entity.primary_key_values());
        Command::new(sql).with_params(params)
    }

    fn delete(&self, entity: &Entity) -> Command {
        let entity_type = entity.entity_type();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            entity_type.table(),
            Self::key_filter(entity_type)
        );
        Command::new(sql).with_params(entity.primary_key_values())
    }

    fn select_by_key(&self, entity_type: &EntityType, key: &[Value]) -> Command {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            entity_type.columns().collect::<Vec<_>>().join(", "),
            entity_type.table(),
            Self::key_filter(entity_type)
        );
        Command::new(sql).with_params(key.to_vec())
    }
}
