//! Simulated Store with Fault Injection
//!
//! DST-compatible wrapper around `InMemoryStore` that injects faults using
//! buggify: transient failures and timeouts on every operation, keys that
//! vanish or change type between being typed and being read (a concurrent
//! writer on a live source), and latency on either side.

use super::{DestinationStore, InMemoryStore, ScanCursor, ScanPage, SourceStore, StoreError, StoreFuture};
use crate::buggify::{faults, BuggifyStats};
use crate::data::{Key, ScoredMember, ValueType};
use crate::io::{Rng, SimulatedRng, TimeSource};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of SCAN failure
    pub scan_fail_prob: f64,
    /// Probability of TYPE failure
    pub type_fail_prob: f64,
    /// Probability of a value read failing
    pub read_fail_prob: f64,
    /// Probability of a TTL read failing
    pub ttl_fail_prob: f64,
    /// Probability of a destination write failing
    pub write_fail_prob: f64,
    /// Probability of EXPIRE failing
    pub expire_fail_prob: f64,
    /// Probability of DELETE failing
    pub delete_fail_prob: f64,
    /// Probability of any operation timing out
    pub timeout_prob: f64,
    /// Probability that a key is deleted right before its value is read
    pub key_vanish_prob: f64,
    /// Probability that a key is overwritten with a string right before its value is read
    pub type_change_prob: f64,
    /// Simulated read latency range in microseconds (min, max)
    pub read_latency_us: (u64, u64),
    /// Simulated write latency range in microseconds (min, max)
    pub write_latency_us: (u64, u64),
    /// Keys whose writes always fail with a transient error
    pub failing_write_keys: HashSet<Key>,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            scan_fail_prob: 0.02,    // 2%
            type_fail_prob: 0.01,    // 1%
            read_fail_prob: 0.02,    // 2%
            ttl_fail_prob: 0.01,     // 1%
            write_fail_prob: 0.02,   // 2%
            expire_fail_prob: 0.01,  // 1%
            delete_fail_prob: 0.01,  // 1%
            timeout_prob: 0.005,     // 0.5%
            key_vanish_prob: 0.01,   // 1%
            type_change_prob: 0.005, // 0.5%
            read_latency_us: (0, 0),
            write_latency_us: (0, 0),
            failing_write_keys: HashSet::new(),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            scan_fail_prob: 0.10,
            type_fail_prob: 0.05,
            read_fail_prob: 0.10,
            ttl_fail_prob: 0.05,
            write_fail_prob: 0.10,
            expire_fail_prob: 0.05,
            delete_fail_prob: 0.05,
            timeout_prob: 0.02,
            key_vanish_prob: 0.03,
            type_change_prob: 0.02,
            ..Self::default()
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            scan_fail_prob: 0.0,
            type_fail_prob: 0.0,
            read_fail_prob: 0.0,
            ttl_fail_prob: 0.0,
            write_fail_prob: 0.0,
            expire_fail_prob: 0.0,
            delete_fail_prob: 0.0,
            timeout_prob: 0.0,
            key_vanish_prob: 0.0,
            type_change_prob: 0.0,
            read_latency_us: (0, 0),
            write_latency_us: (0, 0),
            failing_write_keys: HashSet::new(),
        }
    }

    /// Every write to `key` fails transiently
    pub fn with_failing_writes(mut self, key: impl Into<Key>) -> Self {
        self.failing_write_keys.insert(key.into());
        self
    }

    /// Destination slower than the source
    pub fn with_write_latency(mut self, min: Duration, max: Duration) -> Self {
        self.write_latency_us = (min.as_micros() as u64, max.as_micros() as u64);
        self
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub scan_attempts: u64,
    pub scan_failures: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
    pub write_attempts: u64,
    pub write_failures: u64,
    pub timeouts: u64,
    pub vanished_keys: u64,
    pub type_changes: u64,
}

struct SimulatedStoreInner {
    rng: SimulatedRng,
    stats: SimulatedStoreStats,
    faults: BuggifyStats,
    /// Keys deleted or overwritten by injected faults
    mutated: HashSet<Key>,
}

/// In-memory store that injects faults
pub struct SimulatedStore<T: TimeSource> {
    inner_store: InMemoryStore<T>,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<T: TimeSource> Clone for SimulatedStore<T> {
    fn clone(&self) -> Self {
        SimulatedStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Read,
    Write,
}

impl<T: TimeSource> SimulatedStore<T> {
    pub fn new(inner_store: InMemoryStore<T>, rng: SimulatedRng, config: SimulatedStoreConfig) -> Self {
        SimulatedStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
                faults: BuggifyStats::new(),
                mutated: HashSet::new(),
            })),
        }
    }

    /// The wrapped store, for setup and verification without faults
    pub fn inner(&self) -> &InMemoryStore<T> {
        &self.inner_store
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Keys the store itself deleted or overwritten to simulate concurrent writers
    pub fn mutated_keys(&self) -> HashSet<Key> {
        self.state.lock().mutated.clone()
    }

    /// Checks and triggers per fault id
    pub fn fault_stats(&self) -> BuggifyStats {
        self.state.lock().faults.clone()
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.stats = SimulatedStoreStats::default();
        state.faults = BuggifyStats::new();
    }

    fn inject(&self, fault_id: &str, probability: f64) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        crate::buggify!(&mut state.rng, &mut state.faults, fault_id, probability)
    }

    fn record(&self, f: impl FnOnce(&mut SimulatedStoreStats)) {
        f(&mut self.state.lock().stats);
    }

    async fn delay(&self, side: Side) {
        let (min, max) = match side {
            Side::Read => self.config.read_latency_us,
            Side::Write => self.config.write_latency_us,
        };
        if max == 0 {
            return;
        }
        let micros = self.state.lock().rng.gen_range(min, max.max(min + 1));
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }

    /// Common prologue: latency, timeout, then the operation-specific fault.
    async fn preflight(
        &self,
        side: Side,
        fault_id: &str,
        probability: f64,
    ) -> Result<(), StoreError> {
        self.delay(side).await;
        if self.inject(faults::store::TIMEOUT, self.config.timeout_prob) {
            self.record(|s| s.timeouts += 1);
            return Err(StoreError::Transient("simulated timeout".to_string()));
        }
        if self.inject(fault_id, probability) {
            return Err(StoreError::Transient(format!("simulated {}", fault_id)));
        }
        Ok(())
    }

    async fn before_value_read(&self, key: &Key) -> Result<(), StoreError> {
        self.record(|s| s.read_attempts += 1);
        if let Err(e) = self
            .preflight(Side::Read, faults::source::READ_FAIL, self.config.read_fail_prob)
            .await
        {
            self.record(|s| s.read_failures += 1);
            return Err(e);
        }
        if self.inject(faults::source::KEY_VANISH, self.config.key_vanish_prob) {
            self.inner_store.remove(key);
            let mut state = self.state.lock();
            state.stats.vanished_keys += 1;
            state.mutated.insert(key.clone());
        } else if self.inject(faults::source::TYPE_CHANGE, self.config.type_change_prob) {
            self.inner_store.set_string(key.clone(), Bytes::from_static(b"overwritten"));
            let mut state = self.state.lock();
            state.stats.type_changes += 1;
            state.mutated.insert(key.clone());
        }
        Ok(())
    }

    async fn before_write(&self, key: &Key, fault_id: &str, probability: f64) -> Result<(), StoreError> {
        self.record(|s| s.write_attempts += 1);
        let result = if self.config.failing_write_keys.contains(key) {
            self.delay(Side::Write).await;
            Err(StoreError::Transient(format!("write to {} rejected", key)))
        } else {
            self.preflight(Side::Write, fault_id, probability).await
        };
        if result.is_err() {
            self.record(|s| s.write_failures += 1);
        }
        result
    }
}

impl<T: TimeSource> SourceStore for SimulatedStore<T> {
    fn scan<'a>(
        &'a self,
        cursor: ScanCursor,
        count: usize,
        pattern: Option<&'a str>,
    ) -> StoreFuture<'a, ScanPage> {
        Box::pin(async move {
            self.record(|s| s.scan_attempts += 1);
            if let Err(e) = self
                .preflight(Side::Read, faults::source::SCAN_FAIL, self.config.scan_fail_prob)
                .await
            {
                self.record(|s| s.scan_failures += 1);
                return Err(e);
            }
            self.inner_store.scan(cursor, count, pattern).await
        })
    }

    fn type_of<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ValueType> {
        Box::pin(async move {
            self.preflight(Side::Read, faults::source::TYPE_FAIL, self.config.type_fail_prob)
                .await?;
            self.inner_store.type_of(key).await
        })
    }

    fn read_string<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            self.before_value_read(key).await?;
            self.inner_store.read_string(key).await
        })
    }

    fn read_list<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            self.before_value_read(key).await?;
            self.inner_store.read_list(key).await
        })
    }

    fn read_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            self.before_value_read(key).await?;
            self.inner_store.read_set(key).await
        })
    }

    fn read_sorted_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<ScoredMember>> {
        Box::pin(async move {
            self.before_value_read(key).await?;
            self.inner_store.read_sorted_set(key).await
        })
    }

    fn read_hash<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<(Bytes, Bytes)>> {
        Box::pin(async move {
            self.before_value_read(key).await?;
            self.inner_store.read_hash(key).await
        })
    }

    fn ttl<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            self.preflight(Side::Read, faults::source::TTL_FAIL, self.config.ttl_fail_prob)
                .await?;
            self.inner_store.ttl(key).await
        })
    }
}

impl<T: TimeSource> DestinationStore for SimulatedStore<T> {
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::WRITE_FAIL, self.config.write_fail_prob)
                .await?;
            self.inner_store.write_string(key, value, ttl).await
        })
    }

    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::WRITE_FAIL, self.config.write_fail_prob)
                .await?;
            self.inner_store.append_list(key, values).await
        })
    }

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::WRITE_FAIL, self.config.write_fail_prob)
                .await?;
            self.inner_store.add_set_members(key, members).await
        })
    }

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::WRITE_FAIL, self.config.write_fail_prob)
                .await?;
            self.inner_store.add_sorted_set_members(key, members).await
        })
    }

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::WRITE_FAIL, self.config.write_fail_prob)
                .await?;
            self.inner_store.set_hash_fields(key, fields).await
        })
    }

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::EXPIRE_FAIL, self.config.expire_fail_prob)
                .await?;
            self.inner_store.expire(key, ttl).await
        })
    }

    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key, faults::destination::DELETE_FAIL, self.config.delete_fail_prob)
                .await?;
            self.inner_store.delete(key).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ProductionTimeSource;

    fn store(config: SimulatedStoreConfig) -> SimulatedStore<ProductionTimeSource> {
        SimulatedStore::new(InMemoryStore::new(), SimulatedRng::new(42), config)
    }

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let sim = store(SimulatedStoreConfig::no_faults());
        sim.inner().set_string("k", "v");

        let key = Key::from("k");
        assert_eq!(sim.type_of(&key).await.unwrap(), ValueType::String);
        assert_eq!(sim.read_string(&key).await.unwrap(), Bytes::from_static(b"v"));
        assert_eq!(sim.stats().read_failures, 0);
    }

    #[tokio::test]
    async fn test_failing_write_keys_always_fail() {
        let sim = store(SimulatedStoreConfig::no_faults().with_failing_writes("poison"));
        let key = Key::from("poison");
        let value = Bytes::from_static(b"x");

        for _ in 0..5 {
            let err = sim.write_string(&key, &value, None).await.unwrap_err();
            assert!(matches!(err, StoreError::Transient(_)));
        }
        assert_eq!(sim.stats().write_failures, 5);
        assert!(!sim.inner().contains(&key));
    }

    #[tokio::test]
    async fn test_vanish_turns_read_into_not_found() {
        let config = SimulatedStoreConfig {
            key_vanish_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let sim = store(config);
        sim.inner().set_list("l", ["a"]);

        let err = sim.read_list(&Key::from("l")).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
        assert_eq!(sim.stats().vanished_keys, 1);
        assert!(sim.mutated_keys().contains(&Key::from("l")));
    }

    #[tokio::test]
    async fn test_high_chaos_injects_failures() {
        let sim = store(SimulatedStoreConfig::high_chaos());
        sim.inner().set_string("k", "v");
        let key = Key::from("k");

        let mut failures = 0;
        for _ in 0..500 {
            if sim.ttl(&key).await.is_err() {
                failures += 1;
            }
        }
        assert!(failures > 0, "high chaos should inject TTL failures");
    }

    #[tokio::test]
    async fn test_fault_stats_count_each_site() {
        let config = SimulatedStoreConfig {
            scan_fail_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let sim = store(config);

        for _ in 0..3 {
            assert!(sim.scan(ScanCursor::START, 10, None).await.is_err());
        }
        let faults_seen = sim.fault_stats();
        assert_eq!(faults_seen.triggered(faults::source::SCAN_FAIL), 3);
        assert_eq!(faults_seen.checks.get(faults::store::TIMEOUT), Some(&3));

        sim.reset_stats();
        assert_eq!(sim.fault_stats().total_triggered(), 0);
    }
}
