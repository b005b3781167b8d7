//! Cross-crate integration test helpers.
//!
//! Provides a harness that drives a data model end to end (transactions,
//! contexts, command boundary, store) and verifies what reached the store.

use crate::fixtures::{dog_row, TestModel};
use ormid_core::{CoreResult, EntityRef, Transaction, TransactionContext};
use ormid_store::{MemoryDriver, Value};
use std::sync::Arc;

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The model under test.
    pub model: TestModel,
    /// Statements expected to be durable, by prefix, in commit order.
    expected: Vec<String>,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh [`TestModel`].
    pub fn new() -> Self {
        Self::with_model(TestModel::new())
    }

    /// Creates a harness over `model`.
    pub fn with_model(model: TestModel) -> Self {
        Self {
            model,
            expected: Vec::new(),
        }
    }

    /// The driver behind the model.
    pub fn driver(&self) -> &MemoryDriver {
        &self.model.driver
    }

    /// Begins a transaction and resolves its context on this thread.
    pub fn begin(&self) -> (Transaction, Arc<TransactionContext>) {
        let txn = self.model.manager.begin();
        let context = self
            .model
            .resolve_context(Some(&txn), true)
            .expect("Failed to resolve context");
        (txn, context)
    }

    /// Creates and commits a `Dog`, returning the graduated instance.
    pub fn create_dog(&mut self, name: &str) -> EntityRef {
        let dog = self
            .model
            .in_transaction(|ctx, _| {
                let dog = ctx.create(&self.model.dog)?;
                dog.set("name", name)?;
                Ok(dog)
            })
            .expect("Failed to create dog");
        self.expected.push("INSERT INTO dog".to_string());
        dog
    }

    /// Loads a `Dog` row into `context` as if a query returned it.
    pub fn load_dog(
        &self,
        context: &TransactionContext,
        id: i64,
        name: &str,
    ) -> CoreResult<EntityRef> {
        context.load(&self.model.dog, &dog_row(id, name))
    }

    /// Records that a statement with `prefix` is expected to be durable.
    pub fn expect_statement(&mut self, prefix: &str) {
        self.expected.push(prefix.to_string());
    }

    /// Asserts the durable statements match the expectations, in order.
    pub fn verify(&self) {
        let committed = self.driver().committed_statements();
        assert_eq!(
            committed.len(),
            self.expected.len(),
            "Durable statements mismatch: {committed:?}"
        );
        for (actual, prefix) in committed.iter().zip(&self.expected) {
            assert!(
                actual.starts_with(prefix.as_str()),
                "Expected statement starting with {prefix:?}, got {actual:?}"
            );
        }
    }

    /// Key value of a graduated `Dog`.
    pub fn dog_id(dog: &EntityRef) -> Value {
        dog.get("id")
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::init_test_logging;
    use ormid_core::{ContextState, CoreError, ModelConfig, Partition, PrimaryKey};
    use ormid_store::{Row, StoreFault};
    use std::time::Duration;

    #[test]
    fn new_object_graduates_after_commit() {
        let mut h = IntegrationHarness::new();
        let dog = h.create_dog("rex");
        assert!(!dog.is_new());
        assert!(!dog.is_modified());
        assert!(!IntegrationHarness::dog_id(&dog).is_null());
        h.verify();
    }

    #[test]
    fn reads_in_one_transaction_share_instances() {
        let h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let a = h.load_dog(&context, 1, "rex").unwrap();
        let b = h.load_dog(&context, 1, "rex").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Another transaction has its own identity map.
        let (other, other_context) = h.begin();
        let c = h.load_dog(&other_context, 1, "rex").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        txn.commit().unwrap();
        other.commit().unwrap();
        h.verify();
    }

    #[test]
    fn delete_then_recache_returns_tombstone() {
        let mut h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let e2 = h.load_dog(&context, 7, "rex").unwrap();
        context.delete(&e2).unwrap();

        let e3 = h.load_dog(&context, 7, "rex").unwrap();
        assert!(Arc::ptr_eq(&e2, &e3));
        assert!(e3.is_deleted());
        let found = context.find(&h.model.dog, &[Value::BigInt(7)]).unwrap();
        assert!(found.is_none());

        txn.commit().unwrap();
        h.expect_statement("DELETE FROM dog");
        h.verify();
    }

    #[test]
    fn modified_objects_are_updated() {
        let mut h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let dog = h.load_dog(&context, 3, "rex").unwrap();
        dog.set("owner", 12i64).unwrap();
        txn.commit().unwrap();

        h.expect_statement("UPDATE dog SET owner = ?");
        h.verify();
        assert!(!dog.is_modified());
    }

    #[test]
    fn statement_failure_rolls_back_everything() {
        init_test_logging();
        let mut h = IntegrationHarness::new();
        h.driver()
            .fail_on("UPDATE", StoreFault::Reject("lock timeout".into()));
        let (txn, context) = h.begin();
        let created = context.create(&h.model.dog).unwrap();
        let loaded = h.load_dog(&context, 1, "rex").unwrap();
        loaded.set("name", "max").unwrap();

        let err = txn.commit().unwrap_err();
        assert!(err.is_statement_failure());
        assert!(txn.is_aborted());
        assert_eq!(context.state(), ContextState::RolledBack);
        assert!(created.is_new());
        assert_eq!(h.model.bound_contexts(), 0);
        assert_eq!(h.driver().open_connections(), 0);

        h.driver().clear_faults();
        h.create_dog("fido");
        h.verify();
    }

    #[test]
    fn timeout_never_reports_persisted() {
        init_test_logging();
        let h = IntegrationHarness::with_model(TestModel::with_driver(
            MemoryDriver::new(),
            ModelConfig::default().command_timeout(Some(Duration::from_millis(5))),
        ));
        h.driver().set_latency(Some(Duration::from_millis(50)));
        let (txn, context) = h.begin();
        let dog = context.create(&h.model.dog).unwrap();

        assert!(txn.commit().is_err());
        assert!(dog.is_new());
        assert!(h.driver().committed_statements().is_empty());
    }

    #[test]
    fn missing_client_key_aborts_commit() {
        let h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let shop = context.create(&h.model.shop).unwrap();
        shop.set("region", "eu").unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::MissingOrInvalidPrimaryKey { .. }));
        assert!(h.driver().committed_statements().is_empty());
    }

    #[test]
    fn client_keys_commit_with_composite_identity() {
        let mut h = IntegrationHarness::new();
        let shop = h
            .model
            .in_transaction(|ctx, _| {
                let shop = ctx.create(&h.model.shop)?;
                shop.set("region", "eu")?;
                shop.set("number", 4i64)?;
                Ok(shop)
            })
            .unwrap();
        h.expect_statement("INSERT INTO shop (region, number, name)");
        h.verify();
        assert!(!shop.is_new());
    }

    #[test]
    fn duplicate_new_objects_abort_commit() {
        let h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let a = context.create(&h.model.address).unwrap();
        let b = context.create(&h.model.address).unwrap();
        let id = uuid::Uuid::new_v4();
        a.set("id", id).unwrap();
        b.set("id", id).unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateObject { .. }));
        assert!(h.driver().committed_statements().is_empty());
    }

    #[test]
    fn import_promotes_out_of_tombstones() {
        let h = IntegrationHarness::new();
        let (txn, context) = h.begin();
        let dog = h.load_dog(&context, 5, "rex").unwrap();
        context.delete(&dog).unwrap();

        let revived = context
            .import(&h.model.dog, &dog_row(5, "rex"), false)
            .unwrap();
        let cache = context.identity_cache_for::<PrimaryKey>(&h.model.dog).unwrap();
        assert_eq!(cache.partition_of(&revived), Some(Partition::ByKey));
        assert_eq!(cache.partition_of(&dog), None);
        txn.rollback().unwrap();
    }

    #[test]
    fn buffered_reads_without_mars() {
        let h = IntegrationHarness::with_model(TestModel::without_mars());
        h.driver().script_result(
            "SELECT id, name, owner FROM dog WHERE id = ?",
            vec![dog_row(1, "rex")],
        );
        h.driver().script_result("SELECT id FROM dog", vec![
            Row::new().with("id", 1i64),
            Row::new().with("id", 2i64),
        ]);
        let (txn, context) = h.begin();
        let boundary = context.command_boundary().unwrap();
        let listing = boundary
            .execute_reader(ormid_store::Command::new("SELECT id FROM dog"))
            .unwrap();
        listing.next_row().unwrap();

        let dog = context.find(&h.model.dog, &[Value::BigInt(1)]).unwrap().unwrap();
        assert_eq!(dog.get("name"), Value::from("rex"));
        assert!(listing.is_buffered());
        assert_eq!(listing.collect_rows().unwrap().len(), 1);
        txn.commit().unwrap();
    }
}
