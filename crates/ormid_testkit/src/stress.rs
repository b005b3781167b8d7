//! Stress tests for ormid.
//!
//! These tests verify identity and transaction behavior under heavy load and
//! concurrent access.

use crate::fixtures::{dog_row, TestModel};
use ormid_core::{CoreError, EntityRef, InstanceId, PrimaryKey};
use ormid_store::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Number of distinct keys.
    pub entity_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            entity_count: 1_000,
        }
    }
}

fn key_for(i: usize, config: &StressConfig) -> i64 {
    (i % config.entity_count.max(1)) as i64
}

/// Creates and commits one `Dog` per operation.
pub fn stress_sequential_commits(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let result = t.in_transaction(|ctx, _| {
            let dog = ctx.create(&t.dog)?;
            dog.set("name", format!("dog-{i}"))?;
            Ok(dog)
        });

        match result {
            Ok(dog) if !dog.is_new() => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Loads rows repeatedly in one transaction; a load succeeds when it
/// returns the first instance cached for its key.
pub fn stress_repeated_loads(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let txn = t.manager.begin();
    let Ok(context) = t.resolve_context(Some(&txn), true) else {
        return StressTestResult::new(0, config.operations, Duration::ZERO);
    };

    let start = Instant::now();
    let mut canonical: HashMap<i64, InstanceId> = HashMap::new();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let id = key_for(i, config);
        match context.load(&t.dog, &dog_row(id, "rex")) {
            Ok(dog) => {
                let first = *canonical.entry(id).or_insert_with(|| dog.instance_id());
                if first == dog.instance_id() {
                    successful += 1;
                } else {
                    failed += 1;
                }
            }
            Err(_) => failed += 1,
        }
    }

    if let Err(e) = txn.rollback() {
        tracing::warn!(error = %e, "rollback after repeated loads failed");
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Interleaves loads, deletes and imports in one transaction, then commits.
pub fn stress_mixed_operations(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    let result = t.in_transaction(|ctx, _| {
        let cache = ctx.identity_cache_for::<PrimaryKey>(&t.dog)?;
        for i in 0..config.operations {
            let id = key_for(i, config);
            let outcome = match i % 3 {
                0 => ctx.load(&t.dog, &dog_row(id, "rex")).map(|_| ()),
                1 => match cache.get(&[Value::BigInt(id)]) {
                    Some(dog) => ctx.delete(&dog),
                    None => Ok(()),
                },
                _ => ctx.import(&t.dog, &dog_row(id, "rex"), false).map(|_| ()),
            };
            match outcome {
                Ok(()) => successful += 1,
                Err(_) => failed += 1,
            }
        }
        Ok(())
    });

    if result.is_err() {
        failed += successful;
        successful = 0;
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Threads resolve the context of one shared transaction and load the
/// same keys; a load succeeds when every thread sees the same instance.
pub fn stress_shared_transaction(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let txn = t.manager.begin();
    let ops_per_thread = config.operations / config.threads.max(1);
    let barrier = Barrier::new(config.threads);
    let seen: parking_lot::Mutex<HashMap<i64, InstanceId>> = parking_lot::Mutex::new(HashMap::new());
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let start = Instant::now();
    thread::scope(|s| {
        for _ in 0..config.threads {
            s.spawn(|| {
                barrier.wait();
                let Ok(context) = t.resolve_context(Some(&txn), true) else {
                    failed.fetch_add(ops_per_thread, Ordering::Relaxed);
                    return;
                };
                for i in 0..ops_per_thread {
                    let id = key_for(i, config);
                    let same = context
                        .load(&t.dog, &dog_row(id, "rex"))
                        .map(|dog| *seen.lock().entry(id).or_insert(dog.instance_id()) == dog.instance_id());
                    match same {
                        Ok(true) => successful.fetch_add(1, Ordering::Relaxed),
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
                t.release_coordinator();
            });
        }
    });

    if txn.commit().is_err() {
        failed.fetch_add(successful.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }
    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Threads run independent transactions concurrently.
pub fn stress_concurrent_transactions(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let ops_per_thread = config.operations / config.threads.max(1);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let start = Instant::now();
    thread::scope(|s| {
        for worker in 0..config.threads {
            let (successful, failed) = (&successful, &failed);
            s.spawn(move || {
                for i in 0..ops_per_thread {
                    let id = key_for(worker * ops_per_thread + i, config);
                    let result = t.in_transaction(|ctx, _| {
                        let dog = ctx.load(&t.dog, &dog_row(id, "rex"))?;
                        dog.set("owner", worker as i64)?;
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
                t.release_coordinator();
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Every other transaction fails intentionally and must leave no trace.
pub fn stress_transaction_aborts(t: &TestModel, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        // Every other transaction will fail intentionally
        let should_fail = i % 2 == 0;

        let result: Result<EntityRef, CoreError> = t.in_transaction(|ctx, _| {
            let dog = ctx.create(&t.dog)?;
            if should_fail {
                Err(CoreError::invalid_operation("intentional"))
            } else {
                Ok(dog)
            }
        });

        match result {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_commits() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 500,
            ..Default::default()
        };

        let result = stress_sequential_commits(&t, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 500);
        assert_eq!(t.driver.committed_statements().len(), 500);
        assert_eq!(t.bound_contexts(), 0);
    }

    #[test]
    fn test_repeated_loads() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 2_000,
            entity_count: 50,
            ..Default::default()
        };

        let result = stress_repeated_loads(&t, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 2_000);
    }

    #[test]
    fn test_mixed_operations() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 900,
            entity_count: 30,
            ..Default::default()
        };

        let result = stress_mixed_operations(&t, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_shared_transaction() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 2_000,
            threads: 4,
            entity_count: 25,
        };

        let result = stress_shared_transaction(&t, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 2_000);
        assert_eq!(t.bound_contexts(), 0);
        assert_eq!(t.coordinator_count(), 0);
    }

    #[test]
    fn test_concurrent_transactions() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 400,
            threads: 4,
            entity_count: 100,
        };

        let result = stress_concurrent_transactions(&t, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(t.driver.committed_statements().len(), 400);
        assert_eq!(t.driver.open_connections(), 0);
        assert_eq!(t.manager.active_count(), 0);
    }

    #[test]
    fn test_transaction_aborts() {
        let t = TestModel::new();
        let config = StressConfig {
            operations: 100,
            ..Default::default()
        };

        let result = stress_transaction_aborts(&t, &config);
        // Half should succeed, half should fail (intentionally)
        assert_eq!(result.successful_ops, 50);
        assert_eq!(result.failed_ops, 50);
        assert_eq!(t.driver.committed_statements().len(), 50);
        assert_eq!(t.driver.open_connections(), 0);
    }
}
