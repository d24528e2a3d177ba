//! Deterministic Simulation Testing for migrations
//!
//! Shadow-state harness: a seeded workload populates a source store with
//! every value type (plus TTLs, binary keys and unsupported types), then one
//! or more migration runs copy it to a destination through fault-injecting
//! stores. Runs may be crashed mid-way, either cancelled (final checkpoint
//! written) or dropped outright (only periodic checkpoints survive), and
//! resumed from their checkpoint. After the final run the harness checks:
//!
//! - every enumerated key has exactly one terminal state in the checkpoint
//! - every Succeeded key reads back equal to the source
//! - keys the stores never disturbed are neither Skipped nor missing
//! - unsupported keys are Skipped and never written
//! - a resumed run never rewrites a key completed by an earlier run
//! - the exit code matches the recorded failures
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = MigrationDSTHarness::new(MigrationDSTConfig::chaos(seed));
//!     harness.run().await;
//!     harness.check_invariants();
//! }
//! ```

use super::checkpoint::{InMemoryCheckpointStore, RunCheckpoint};
use super::orchestrator::{MigrationOrchestrator, RunOutcome, RunStatus};
use super::task::SkipReason;
use crate::config::MigrationConfig;
use crate::data::{Key, ScoredMember, ValueType};
use crate::io::{Rng, SimulatedRng, SimulatedTimeSource};
use crate::store::{
    DestinationStore, InMemoryStore, SimulatedStore, SimulatedStoreConfig, SimulatedStoreStats,
    StoreFuture,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on crash/resume cycles per seed
const MAX_RUNS: u64 = 6;

async fn wait_for_writes<D: DestinationStore>(log: &WriteLog<D>, count: usize) {
    while log.written_count() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[derive(Debug, Clone)]
pub struct MigrationDSTConfig {
    pub seed: u64,
    /// Keys in the generated keyspace
    pub key_count: usize,
    /// Largest container generated
    pub max_elements: u64,
    /// Fraction of keys with an unsupported type
    pub unsupported_prob: f64,
    /// Fraction of keys with a TTL
    pub ttl_prob: f64,
    /// Chance that a run is cancelled part-way and resumed
    pub crash_prob: f64,
    /// Share of crashes that drop the run without a final checkpoint
    pub hard_crash_prob: f64,
    pub source_faults: SimulatedStoreConfig,
    pub destination_faults: SimulatedStoreConfig,
    pub migration: MigrationConfig,
}

impl Default for MigrationDSTConfig {
    fn default() -> Self {
        MigrationDSTConfig {
            seed: 0,
            key_count: 200,
            max_elements: 8,
            unsupported_prob: 0.05,
            ttl_prob: 0.2,
            crash_prob: 0.2,
            hard_crash_prob: 0.5,
            source_faults: SimulatedStoreConfig::default(),
            destination_faults: SimulatedStoreConfig::default(),
            migration: MigrationConfig::test(),
        }
    }
}

impl MigrationDSTConfig {
    pub fn new(seed: u64) -> Self {
        MigrationDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults, no crashes
    pub fn calm(seed: u64) -> Self {
        MigrationDSTConfig {
            seed,
            crash_prob: 0.0,
            source_faults: SimulatedStoreConfig::no_faults(),
            destination_faults: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        MigrationDSTConfig {
            seed,
            crash_prob: 0.3,
            ..Default::default()
        }
    }

    /// Aggressive faults on both sides and frequent crashes
    pub fn chaos(seed: u64) -> Self {
        let mut migration = MigrationConfig::test();
        migration.max_attempts = 5;
        MigrationDSTConfig {
            seed,
            crash_prob: 0.5,
            source_faults: SimulatedStoreConfig::high_chaos(),
            destination_faults: SimulatedStoreConfig::high_chaos(),
            migration,
            ..Default::default()
        }
    }
}

/// Result of one seed
#[derive(Debug, Clone)]
pub struct MigrationDSTResult {
    pub seed: u64,
    pub keys: usize,
    /// Orchestrator runs, including resumed ones
    pub runs: u64,
    /// Runs that were cancelled or aborted part-way
    pub crashes: u64,
    /// Crashes where the run was dropped mid-flight
    pub hard_crashes: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retries: u64,
    pub exit_code: Option<i32>,
    pub source_stats: SimulatedStoreStats,
    pub destination_stats: SimulatedStoreStats,
    /// Injected faults that fired, both stores
    pub faults_injected: u64,
    pub invariant_violations: Vec<String>,
}

impl MigrationDSTResult {
    pub fn new(seed: u64) -> Self {
        MigrationDSTResult {
            seed,
            keys: 0,
            runs: 0,
            crashes: 0,
            hard_crashes: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            retries: 0,
            exit_code: None,
            source_stats: SimulatedStoreStats::default(),
            destination_stats: SimulatedStoreStats::default(),
            faults_injected: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} keys, {} runs ({} crashes, {} hard), {} ok, {} failed, {} skipped, {} retries, {} faults, {} violations",
            self.seed,
            self.keys,
            self.runs,
            self.crashes,
            self.hard_crashes,
            self.succeeded,
            self.failed,
            self.skipped,
            self.retries,
            self.faults_injected,
            self.invariant_violations.len()
        )
    }
}

/// Destination wrapper that records which keys each run touched
pub struct WriteLog<D> {
    inner: D,
    written: Mutex<HashSet<Key>>,
}

impl<D: DestinationStore> WriteLog<D> {
    pub fn new(inner: D) -> Self {
        WriteLog {
            inner,
            written: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn written(&self) -> HashSet<Key> {
        self.written.lock().clone()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn clear(&self) {
        self.written.lock().clear();
    }

    fn touch(&self, key: &Key) {
        self.written.lock().insert(key.clone());
    }
}

impl<D: DestinationStore> DestinationStore for WriteLog<D> {
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.write_string(key, value, ttl)
    }

    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.append_list(key, values)
    }

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.add_set_members(key, members)
    }

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.add_sorted_set_members(key, members)
    }

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.set_hash_fields(key, fields)
    }

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.expire(key, ttl)
    }

    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
        self.touch(key);
        self.inner.delete(key)
    }
}

type DSTStore = SimulatedStore<SimulatedTimeSource>;

pub struct MigrationDSTHarness {
    config: MigrationDSTConfig,
    rng: SimulatedRng,
    time: SimulatedTimeSource,
    source: Arc<DSTStore>,
    destination: Arc<WriteLog<DSTStore>>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    /// Supported keys as generated
    supported: BTreeSet<Key>,
    unsupported: BTreeSet<Key>,
    final_outcome: Option<RunOutcome>,
    result: MigrationDSTResult,
}

impl MigrationDSTHarness {
    pub fn new(config: MigrationDSTConfig) -> Self {
        let time = SimulatedTimeSource::new(1_700_000_000_000);
        let source = SimulatedStore::new(
            InMemoryStore::with_time_source(time.clone()),
            SimulatedRng::new(config.seed.wrapping_add(1)),
            config.source_faults.clone(),
        );
        let destination = SimulatedStore::new(
            InMemoryStore::with_time_source(time.clone()),
            SimulatedRng::new(config.seed.wrapping_add(2)),
            config.destination_faults.clone(),
        );

        let mut harness = MigrationDSTHarness {
            rng: SimulatedRng::new(config.seed),
            result: MigrationDSTResult::new(config.seed),
            config,
            time,
            source: Arc::new(source),
            destination: Arc::new(WriteLog::new(destination)),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            supported: BTreeSet::new(),
            unsupported: BTreeSet::new(),
            final_outcome: None,
        };
        harness.populate();
        harness
    }

    fn populate(&mut self) {
        let store = self.source.inner().clone();
        for i in 0..self.config.key_count {
            let key = if i % 17 == 0 {
                Key::from(vec![b'b', 0xff, (i % 251) as u8, b':', (i / 251) as u8])
            } else {
                Key::from(format!("dst:{}", i))
            };

            if self.rng.gen_bool(self.config.unsupported_prob) {
                store.set_opaque(key.clone(), "stream");
                self.unsupported.insert(key);
                continue;
            }

            let n = self.rng.gen_range(1, self.config.max_elements + 1);
            match self.rng.gen_range(0, 5) {
                0 => store.set_string(key.clone(), format!("value-{}", self.rng.next_u64())),
                1 => store.set_list(key.clone(), (0..n).map(|j| format!("item-{}", j % 3))),
                2 => store.set_set(key.clone(), (0..n).map(|j| format!("member-{}", j))),
                3 => {
                    let members: Vec<(String, f64)> = (0..n)
                        .map(|j| {
                            let score = self.rng.gen_range(0, 4000) as f64 / 4.0 - 500.0;
                            (format!("m{}", j), score)
                        })
                        .collect();
                    store.set_sorted_set(key.clone(), members)
                }
                _ => store.set_hash(
                    key.clone(),
                    (0..n).map(|j| (format!("field-{}", j), format!("v{}", self.rng.next_u64()))),
                ),
            }
            if self.rng.gen_bool(self.config.ttl_prob) {
                let ttl = Duration::from_millis(self.rng.gen_range(60_000, 3_600_000));
                store.set_expiry(&key, ttl);
            }
            self.supported.insert(key);
        }
        self.result.keys = self.supported.len() + self.unsupported.len();
    }

    /// Run until a run completes, crashing and resuming along the way
    pub async fn run(&mut self) {
        let mut resume = false;
        for run in 0..MAX_RUNS {
            let mut orch = MigrationOrchestrator::with_io(
                self.source.clone(),
                self.destination.clone(),
                self.config.migration.clone(),
                self.time.clone(),
                SimulatedRng::new(self.config.seed.wrapping_mul(31).wrapping_add(run)),
            )
            .with_checkpoint_store(self.checkpoints.clone());
            if resume {
                orch = orch.resume_from(self.checkpoints.clone());
            }

            let completed_before: HashSet<Key> = self
                .checkpoints
                .latest()
                .map(|c| c.completed.into_iter().collect())
                .unwrap_or_default();
            self.destination.clear();

            let crash = run + 1 < MAX_RUNS && self.rng.gen_bool(self.config.crash_prob);
            let hard = crash && self.rng.gen_bool(self.config.hard_crash_prob);
            let threshold = self.rng.gen_range(1, self.config.key_count as u64 / 2 + 2) as usize;

            let outcome = if hard {
                let destination = self.destination.clone();
                tokio::select! {
                    outcome = orch.run() => Some(outcome),
                    _ = wait_for_writes(&*destination, threshold) => None,
                }
            } else {
                let watcher = crash.then(|| {
                    let destination = self.destination.clone();
                    let cancel = orch.cancellation_token();
                    tokio::spawn(async move {
                        wait_for_writes(&*destination, threshold).await;
                        cancel.cancel();
                    })
                });
                let outcome = orch.run().await;
                if let Some(w) = watcher {
                    w.abort();
                }
                Some(outcome)
            };
            self.result.runs += 1;

            let Some(outcome) = outcome else {
                // Dropped mid-run; resume from whatever the periodic checkpoints saved
                self.result.crashes += 1;
                self.result.hard_crashes += 1;
                resume = self.checkpoints.latest().is_some();
                continue;
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.violation(format!("run {} failed to start: {}", run, e));
                    return;
                }
            };

            let rewritten: Vec<String> = self
                .destination
                .written()
                .intersection(&completed_before)
                .map(|k| k.to_string())
                .collect();
            if !rewritten.is_empty() {
                self.violation(format!(
                    "run {} rewrote {} keys completed by an earlier run: {:?}",
                    run,
                    rewritten.len(),
                    rewritten
                ));
            }

            self.result.retries += outcome.summary.retries;
            if outcome.status == RunStatus::Completed {
                self.final_outcome = Some(outcome);
                break;
            }
            self.result.crashes += 1;
            resume = true;
        }
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    pub fn check_invariants(&mut self) {
        self.result.source_stats = self.source.stats();
        self.result.destination_stats = self.destination.inner().stats();
        self.result.faults_injected = self.source.fault_stats().total_triggered()
            + self.destination.inner().fault_stats().total_triggered();

        let Some(outcome) = self.final_outcome.clone() else {
            self.violation(format!("no run completed within {} runs", MAX_RUNS));
            return;
        };
        let Some(checkpoint) = self.checkpoints.latest() else {
            self.violation("no checkpoint was written".to_string());
            return;
        };

        self.result.succeeded = checkpoint.completed.len() as u64;
        self.result.failed = checkpoint.failed.len() as u64;
        self.result.skipped = checkpoint.skipped.len() as u64;
        self.result.exit_code = Some(outcome.exit_code());

        self.check_terminal_states(&checkpoint);
        self.check_values(&checkpoint);

        if !checkpoint.enumeration_complete {
            self.violation("completed run left enumeration incomplete".to_string());
        }
        let expected_exit = if checkpoint.failed.is_empty() { 0 } else { 1 };
        if outcome.exit_code() != expected_exit {
            self.violation(format!(
                "exit code {} with {} failed keys",
                outcome.exit_code(),
                checkpoint.failed.len()
            ));
        }
        if outcome.summary.failed != checkpoint.failed.len() as u64 {
            self.violation("summary and checkpoint disagree on failures".to_string());
        }
        let faults_enabled = self.config.source_faults.type_fail_prob > 0.0
            || self.config.destination_faults.write_fail_prob > 0.0;
        if !faults_enabled && !checkpoint.failed.is_empty() {
            self.violation(format!(
                "{} keys failed without fault injection",
                checkpoint.failed.len()
            ));
        }
    }

    fn check_terminal_states(&mut self, checkpoint: &RunCheckpoint) {
        let mut seen = HashSet::new();
        let keys = checkpoint
            .completed
            .iter()
            .chain(checkpoint.skipped.iter().map(|s| &s.key))
            .chain(checkpoint.failed.iter().map(|f| &f.key));
        let mut duplicates = Vec::new();
        for key in keys {
            if !seen.insert(key.clone()) {
                duplicates.push(key.to_string());
            }
        }
        if !duplicates.is_empty() {
            self.violation(format!("keys with more than one terminal state: {:?}", duplicates));
        }

        let mutated = self.source.mutated_keys();
        for key in self.supported.clone() {
            if mutated.contains(&key) {
                continue;
            }
            if !seen.contains(&key) {
                self.violation(format!("key {} has no terminal state", key));
            } else if checkpoint.skipped.iter().any(|s| s.key == key) {
                self.violation(format!("undisturbed key {} was skipped", key));
            }
        }
        for key in self.unsupported.clone() {
            let skipped = checkpoint
                .skipped
                .iter()
                .any(|s| s.key == key && matches!(s.reason, SkipReason::UnsupportedType(_)));
            if !skipped {
                self.violation(format!("unsupported key {} not skipped", key));
            }
        }
    }

    fn check_values(&mut self, checkpoint: &RunCheckpoint) {
        let mutated = self.source.mutated_keys();
        let source = self.source.inner().clone();
        let destination = self.destination.inner().inner().clone();

        for key in &checkpoint.completed {
            if mutated.contains(key) {
                continue;
            }
            let expected = source.snapshot(key);
            let actual = destination.snapshot(key);
            if expected != actual {
                self.violation(format!(
                    "key {} differs: source {:?}, destination {:?}",
                    key, expected, actual
                ));
            }
        }
        for key in &self.unsupported.clone() {
            if destination.contains(key) {
                self.violation(format!("unsupported key {} was written", key));
            }
        }
    }

    /// Keys copied per type, from the final run's summary
    pub fn copied_of_type(&self, value_type: &ValueType) -> u64 {
        self.final_outcome
            .as_ref()
            .and_then(|o| o.summary.by_type.get(value_type.name()).copied())
            .unwrap_or(0)
    }

    pub fn result(&self) -> &MigrationDSTResult {
        &self.result
    }

    pub fn into_result(self) -> MigrationDSTResult {
        self.result
    }
}

/// Run a batch of seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> MigrationDSTConfig,
) -> Vec<MigrationDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = MigrationDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run().await;
        harness.check_invariants();
        results.push(harness.into_result());
    }
    results
}

pub fn summarize_batch(results: &[MigrationDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_runs: u64 = results.iter().map(|r| r.runs).sum();
    let total_crashes: u64 = results.iter().map(|r| r.crashes).sum();
    let total_failed: u64 = results.iter().map(|r| r.failed).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} runs, {} crashes, {} failed keys",
        passed, total, total_runs, total_crashes, total_failed
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dst_harness_calm() {
        let mut harness = MigrationDSTHarness::new(MigrationDSTConfig::calm(42));
        harness.run().await;
        harness.check_invariants();

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert_eq!(result.failed, 0);
        assert_eq!(result.runs, 1);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.faults_injected, 0);
    }

    #[tokio::test]
    async fn test_dst_harness_with_faults() {
        let mut harness = MigrationDSTHarness::new(MigrationDSTConfig::moderate(123));
        harness.run().await;
        harness.check_invariants();

        let result = harness.result();
        println!("{}", result.summary());
        assert!(result.is_success(), "{:?}", result.invariant_violations);
    }

    #[tokio::test]
    async fn test_dst_deterministic_workload() {
        let seed = 12345;
        let mut first = MigrationDSTHarness::new(MigrationDSTConfig::calm(seed));
        first.run().await;
        let mut second = MigrationDSTHarness::new(MigrationDSTConfig::calm(seed));
        second.run().await;

        assert_eq!(first.supported, second.supported);
        assert_eq!(first.unsupported, second.unsupported);
        for t in [ValueType::String, ValueType::List, ValueType::SortedSet] {
            assert_eq!(first.copied_of_type(&t), second.copied_of_type(&t));
        }
    }

    #[tokio::test]
    async fn test_dst_batch_calm() {
        let results = run_dst_batch(1000, 5, MigrationDSTConfig::calm).await;
        println!("{}", summarize_batch(&results));
        assert!(results.iter().all(|r| r.is_success()), "All calm runs should pass");
    }

    #[test]
    fn test_summarize_reports_failed_seeds() {
        let mut bad = MigrationDSTResult::new(7);
        bad.invariant_violations.push("boom".into());
        let summary = summarize_batch(&[MigrationDSTResult::new(6), bad]);
        assert!(summary.contains("1/2 passed"));
        assert!(summary.contains("Failed seeds: [7]"));
    }
}
