//! Entity type metadata.

use std::fmt;
use std::sync::Arc;

/// One component of an entity type's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyComponent {
    /// Column name.
    pub name: String,
    /// Whether the store assigns the value at insert time.
    pub server_generated: bool,
}

/// Metadata describing one persisted entity type.
///
/// Key components are ordered; that order defines the order of the values
/// passed to key lookups and of composite keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    name: String,
    table: String,
    key: Vec<KeyComponent>,
    fields: Vec<String>,
}

impl EntityType {
    /// Starts building a type called `name`, stored in a table of the same name.
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        let name = name.into();
        EntityTypeBuilder {
            table: name.to_ascii_lowercase(),
            name,
            key: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Primary key components, in key order.
    #[must_use]
    pub fn key_components(&self) -> &[KeyComponent] {
        &self.key
    }

    /// Persisted non-key fields.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Key components followed by non-key fields.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.key
            .iter()
            .map(|k| k.name.as_str())
            .chain(self.fields.iter().map(String::as_str))
    }

    /// Returns true if `column` is part of the primary key.
    #[must_use]
    pub fn is_key_component(&self, column: &str) -> bool {
        self.key.iter().any(|k| k.name == column)
    }

    /// Returns true if `column` is a key component or a persisted field.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.is_key_component(column) || self.fields.iter().any(|f| f == column)
    }

    /// Returns true if any key component is assigned by the store.
    #[must_use]
    pub fn has_server_generated_key_components(&self) -> bool {
        self.key.iter().any(|k| k.server_generated)
    }

    /// Key components assigned by the store.
    pub fn server_generated_components(&self) -> impl Iterator<Item = &KeyComponent> {
        self.key.iter().filter(|k| k.server_generated)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Builder for [`EntityType`].
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    table: String,
    key: Vec<KeyComponent>,
    fields: Vec<String>,
}

impl EntityTypeBuilder {
    /// Overrides the table name.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Appends a client-assigned key component.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.key.push(KeyComponent {
            name: name.into(),
            server_generated: false,
        });
        self
    }

    /// Appends a store-assigned key component.
    #[must_use]
    pub fn generated_key(mut self, name: impl Into<String>) -> Self {
        self.key.push(KeyComponent {
            name: name.into(),
            server_generated: true,
        });
        self
    }

    /// Appends a persisted non-key field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    /// Finishes the type.
    #[must_use]
    pub fn build(self) -> Arc<EntityType> {
        Arc::new(EntityType {
            name: self.name,
            table: self.table,
            key: self.key,
            fields: self.fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_orders_columns() {
        let shop = EntityType::builder("Shop")
            .key("region")
            .generated_key("number")
            .field("name")
            .build();

        assert_eq!(shop.table(), "shop");
        assert_eq!(
            shop.columns().collect::<Vec<_>>(),
            vec!["region", "number", "name"]
        );
        assert!(shop.is_key_component("number"));
        assert!(!shop.is_key_component("name"));
        assert!(shop.has_column("name"));
        assert!(!shop.has_column("owner"));
    }

    #[test]
    fn server_generated_components() {
        let dog = EntityType::builder("Dog").generated_key("id").build();
        let cat = EntityType::builder("Cat").table("cats").key("name").build();

        assert!(dog.has_server_generated_key_components());
        assert_eq!(dog.server_generated_components().count(), 1);
        assert!(!cat.has_server_generated_key_components());
        assert_eq!(cat.table(), "cats");
    }
}
