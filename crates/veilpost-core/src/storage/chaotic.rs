//! Fault-injecting store wrapper
//!
//! Delegates to an inner store but fails a configurable fraction of calls
//! with `StorageError::Io`, and journals every write that reached the inner
//! store. Used to check that services survive storage failures and that
//! secure deletion overwrites before it deletes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{StorageError, Store};

/// A write that reached the inner store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// `put` or successful `update`, with the resulting record
    Write {
        /// Table name
        table: String,
        /// Record key
        key: String,
        /// Record as written
        record: Value,
    },
    /// `delete`
    Delete {
        /// Table name
        table: String,
        /// Record key
        key: String,
    },
}

/// Store wrapper that randomly fails operations.
#[derive(Clone)]
pub struct ChaoticStore<S: Store> {
    inner: S,
    state: Arc<Mutex<ChaosState>>,
}

struct ChaosState {
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: u64,
    operations: usize,
    journal: Vec<StoreOp>,
}

impl ChaosState {
    /// LCG step, uniform in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.rng = A.wrapping_mul(self.rng).wrapping_add(C) % M;
        (self.rng as f64) / (M as f64)
    }
}

impl<S: Store> ChaoticStore<S> {
    /// Wrap `inner`, failing roughly `failure_rate` of calls.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            state: Arc::new(Mutex::new(ChaosState {
                failure_rate,
                rng: seed,
                operations: 0,
                journal: Vec::new(),
            })),
        }
    }

    /// Change the failure rate, e.g. to 0.0 to let a retry through.
    pub fn set_failure_rate(&self, failure_rate: f64) {
        self.lock().failure_rate = failure_rate.clamp(0.0, 1.0);
    }

    /// Underlying store, for checking state after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Operations attempted, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }

    /// Writes that reached the inner store, in order.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().journal.clone()
    }

    fn roll(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.operations += 1;
        let rate = state.failure_rate;
        if state.next() < rate {
            return Err(StorageError::Io("chaotic failure injection".into()));
        }
        Ok(())
    }

    fn record(&self, op: StoreOp) {
        self.lock().journal.push(op);
    }

    fn lock(&self) -> MutexGuard<'_, ChaosState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Store> Store for ChaoticStore<S> {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError> {
        self.roll()?;
        self.inner.get(table, key)
    }

    fn put(&self, table: &str, key: &str, record: &Value) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.put(table, key, record)?;
        self.record(StoreOp::Write { table: table.into(), key: key.into(), record: record.clone() });
        Ok(())
    }

    fn update(&self, table: &str, key: &str, patch: &Value) -> Result<Value, StorageError> {
        self.roll()?;
        let merged = self.inner.update(table, key, patch)?;
        self.record(StoreOp::Write { table: table.into(), key: key.into(), record: merged.clone() });
        Ok(merged)
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.delete(table, key)?;
        self.record(StoreOp::Delete { table: table.into(), key: key.into() });
        Ok(())
    }

    fn get_all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError> {
        self.roll()?;
        self.inner.get_all(table)
    }
}
