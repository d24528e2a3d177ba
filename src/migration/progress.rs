//! Progress Tracker
//!
//! Records every task outcome behind one lock, so concurrent workers can
//! never lose or double-count a result. The tracker also:
//!
//! - claims keys as they are queued, so a key the cursor re-visits is never
//!   queued twice or processed by two workers at once
//! - tracks enumeration batches to derive a *safe* resume cursor: the start
//!   of the oldest batch that still has unresolved keys, so anything queued
//!   or in flight at crash time is re-enumerated on resume
//! - writes checkpoints incrementally: keys resolved since the last write
//!   go out as a `CheckpointDelta`, and a full `RunCheckpoint` base is
//!   written only when the journal has grown as large as the base
//! - builds the final `RunSummary`
//!
//! ```text
//! enumerator ──begin_batch/claim/end_batch──▶ ┌──────────────┐ ──checkpoint()──▶ CheckpointStore
//! workers ────mark_in_flight/record─────────▶ │ TrackerState │
//!                                             └──────────────┘ ──summary()────▶ RunSummary
//! ```

use super::checkpoint::{
    CheckpointDelta, CheckpointStore, KeyFailure, RunCheckpoint, SkippedKey, CHECKPOINT_VERSION,
};
use super::error::CheckpointError;
use super::task::{Outcome, SkipReason, TaskOutcome, TaskState};
use crate::data::{Key, ValueType};
use crate::io::{ProductionTimeSource, TimeSource};
use crate::store::ScanCursor;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// The journal is never compacted before it holds this many keys
pub const MIN_COMPACTION_KEYS: u64 = 1_024;

/// Result of offering an enumerated key to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Newly claimed; the caller must queue it
    Claimed,
    /// Already has a terminal outcome
    AlreadyDone,
    /// Already queued or in flight
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy)]
struct BatchState {
    start: ScanCursor,
    /// Claimed keys without a terminal outcome
    outstanding: usize,
    /// The enumerator has handed over every key of this batch
    sealed: bool,
}

#[derive(Debug)]
struct TrackerState {
    claimed: HashMap<Key, TaskState>,
    succeeded: HashSet<Key>,
    skipped: HashMap<Key, SkipReason>,
    failed: HashMap<Key, KeyFailure>,
    batches: BTreeMap<u64, BatchState>,
    next_batch: u64,
    /// Next cursor of the most recently sealed batch
    enumerated_through: ScanCursor,
    enumeration_complete: bool,
    scanned: u64,
    scanned_this_run: u64,
    succeeded_this_run: u64,
    previously_completed: u64,
    by_type: BTreeMap<String, u64>,
    retries: u64,
    since_checkpoint: u64,
    started_at_ms: u64,
    journal: JournalState,
}

/// What the checkpoint store holds relative to the tracker
#[derive(Debug, Default)]
struct JournalState {
    /// Resolved since the last write
    completed: Vec<Key>,
    skipped: Vec<SkippedKey>,
    failed: Vec<KeyFailure>,
    /// Generation of the base in the store
    generation: u64,
    /// Keys in the stored base
    base_keys: u64,
    /// Keys appended to the journal since that base
    journal_keys: u64,
    /// The next write must be a full base
    needs_base: bool,
}

impl JournalState {
    fn unsaved(&self) -> u64 {
        (self.completed.len() + self.skipped.len() + self.failed.len()) as u64
    }

    fn should_compact(&self) -> bool {
        self.needs_base
            || self.journal_keys + self.unsaved() >= self.base_keys.max(MIN_COMPACTION_KEYS)
    }

    fn clear_unsaved(&mut self) {
        self.completed.clear();
        self.skipped.clear();
        self.failed.clear();
    }
}

enum CheckpointWrite {
    Base(RunCheckpoint),
    Delta(CheckpointDelta),
}

/// Counters for periodic progress lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub scanned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: u64,
    pub pending: u64,
    pub retries: u64,
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Keys returned by enumeration in this run
    pub scanned: u64,
    /// Keys copied in this run (classified, in a dry run)
    pub succeeded: u64,
    /// Keys copied by earlier runs of the same checkpoint
    pub previously_completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Every Failed key with its last error, ordered by key
    pub failures: Vec<KeyFailure>,
    /// Every Skipped key with its reason, ordered by key
    pub skipped_keys: Vec<SkippedKey>,
    /// Copied keys per value type, across runs
    pub by_type: BTreeMap<String, u64>,
    pub retries: u64,
    pub duration: Duration,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Skipped key counts keyed by the reason's display form
    pub fn skipped_by_reason(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped_keys {
            *counts.entry(skipped.reason.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "classified" } else { "copied" };
        writeln!(
            f,
            "scanned {} keys: {} {}, {} failed, {} skipped ({} completed previously) in {:.1}s",
            self.scanned,
            self.succeeded,
            verb,
            self.failed,
            self.skipped,
            self.previously_completed,
            self.duration.as_secs_f64()
        )?;
        if !self.by_type.is_empty() {
            let types: Vec<String> = self
                .by_type
                .iter()
                .map(|(t, n)| format!("{}={}", t, n))
                .collect();
            writeln!(f, "by type: {}", types.join(", "))?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "FAILED {} after {} attempt(s): {}",
                failure.key, failure.attempts, failure.error
            )?;
        }
        let skipped = self.skipped_by_reason();
        if !skipped.is_empty() {
            let reasons: Vec<String> = skipped
                .iter()
                .map(|(reason, n)| format!("{}={}", reason, n))
                .collect();
            writeln!(f, "skipped: {}", reasons.join(", "))?;
        }
        Ok(())
    }
}

/// Thread-safe progress tracker shared by the enumerator, workers and
/// checkpointer.
pub struct ProgressTracker<T: TimeSource = ProductionTimeSource> {
    state: Mutex<TrackerState>,
    store: Option<Arc<dyn CheckpointStore>>,
    /// Serializes saves so an older snapshot never overwrites a newer one
    save_lock: tokio::sync::Mutex<()>,
    /// Signalled once `checkpoint_every` outcomes accumulate
    checkpoint_due: Notify,
    checkpoint_every: u64,
    time: T,
    dry_run: bool,
}

impl ProgressTracker<ProductionTimeSource> {
    pub fn new() -> Self {
        Self::with_time_source(ProductionTimeSource)
    }
}

impl Default for ProgressTracker<ProductionTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> ProgressTracker<T> {
    pub fn with_time_source(time: T) -> Self {
        let started_at_ms = time.now_millis();
        ProgressTracker {
            state: Mutex::new(TrackerState {
                claimed: HashMap::new(),
                succeeded: HashSet::new(),
                skipped: HashMap::new(),
                failed: HashMap::new(),
                batches: BTreeMap::new(),
                next_batch: 0,
                enumerated_through: ScanCursor::START,
                enumeration_complete: false,
                scanned: 0,
                scanned_this_run: 0,
                succeeded_this_run: 0,
                previously_completed: 0,
                by_type: BTreeMap::new(),
                retries: 0,
                since_checkpoint: 0,
                started_at_ms,
                journal: JournalState {
                    needs_base: true,
                    ..Default::default()
                },
            }),
            store: None,
            save_lock: tokio::sync::Mutex::new(()),
            checkpoint_due: Notify::new(),
            checkpoint_every: u64::MAX,
            time,
            dry_run: false,
        }
    }

    /// Persist checkpoints to `store`
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Request a checkpoint after every `n` terminal outcomes
    pub fn checkpoint_every(mut self, n: u64) -> Self {
        self.checkpoint_every = n.max(1);
        self
    }

    /// Dry runs count outcomes but never persist
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Seed state from an earlier run's checkpoint.
    ///
    /// Keys that were queued or in flight when that checkpoint was taken
    /// have no record in it and are therefore Pending again. With
    /// `retry_failed`, previously Failed keys are forgotten and the scan
    /// restarts from the beginning so they are enumerated again.
    pub fn resume_from(self, checkpoint: RunCheckpoint, retry_failed: bool) -> Self {
        {
            let mut state = self.state.lock();
            state.previously_completed = checkpoint.completed.len() as u64;
            state.succeeded = checkpoint.completed.into_iter().collect();
            state.skipped = checkpoint
                .skipped
                .into_iter()
                .map(|s| (s.key, s.reason))
                .collect();
            state.scanned = checkpoint.scanned;
            state.by_type = checkpoint.by_type;
            state.journal.generation = checkpoint.generation;
            if checkpoint.started_at_ms > 0 {
                state.started_at_ms = checkpoint.started_at_ms;
            }

            if retry_failed && !checkpoint.failed.is_empty() {
                state.enumerated_through = ScanCursor::START;
                state.enumeration_complete = false;
            } else {
                state.failed = checkpoint
                    .failed
                    .into_iter()
                    .map(|f| (f.key.clone(), f))
                    .collect();
                state.enumerated_through = checkpoint.cursor;
                state.enumeration_complete = checkpoint.enumeration_complete;
            }
        }
        self
    }

    /// Cursor the enumerator should start from
    pub fn resume_cursor(&self) -> ScanCursor {
        self.state.lock().enumerated_through
    }

    /// True when a resumed checkpoint had already finished the keyspace
    pub fn is_enumeration_complete(&self) -> bool {
        self.state.lock().enumeration_complete
    }

    /// Open a batch starting at `start`; returns its sequence number
    pub fn begin_batch(&self, start: ScanCursor) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_batch;
        state.next_batch += 1;
        state.batches.insert(
            seq,
            BatchState {
                start,
                outstanding: 0,
                sealed: false,
            },
        );
        seq
    }

    /// Offer an enumerated key belonging to batch `batch`
    pub fn claim(&self, key: &Key, batch: u64) -> Claim {
        let mut state = self.state.lock();
        state.scanned += 1;
        state.scanned_this_run += 1;

        if state.succeeded.contains(key) || state.skipped.contains_key(key) || state.failed.contains_key(key) {
            return Claim::AlreadyDone;
        }
        if state.claimed.contains_key(key) {
            return Claim::AlreadyQueued;
        }
        state.claimed.insert(key.clone(), TaskState::Pending);
        if let Some(b) = state.batches.get_mut(&batch) {
            b.outstanding += 1;
        }
        Claim::Claimed
    }

    /// Every key of `batch` has been claimed; `next` is where the following
    /// batch starts (`START` when the keyspace is exhausted).
    pub fn end_batch(&self, batch: u64, next: ScanCursor) {
        let mut state = self.state.lock();
        state.enumerated_through = next;
        if next.is_start() {
            state.enumeration_complete = true;
        }
        let finished = match state.batches.get_mut(&batch) {
            Some(b) => {
                b.sealed = true;
                b.outstanding == 0
            }
            None => false,
        };
        if finished {
            state.batches.remove(&batch);
        }
    }

    pub fn mark_in_flight(&self, key: &Key) {
        if let Some(s) = self.state.lock().claimed.get_mut(key) {
            *s = TaskState::InFlight;
        }
    }

    /// Back to Pending while waiting out a retry backoff
    pub fn mark_pending_retry(&self, key: &Key) {
        let mut state = self.state.lock();
        if let Some(s) = state.claimed.get_mut(key) {
            *s = TaskState::Pending;
        }
        state.retries += 1;
    }

    /// Record a terminal outcome. Returns false, and changes nothing, if the
    /// key already has one.
    pub fn record(&self, outcome: TaskOutcome) -> bool {
        let mut state = self.state.lock();
        let TaskOutcome {
            key,
            batch,
            attempts,
            outcome,
        } = outcome;

        if state.succeeded.contains(&key) || state.skipped.contains_key(&key) || state.failed.contains_key(&key) {
            debug!(key = %key, "Ignoring duplicate outcome");
            return false;
        }
        let was_claimed = state.claimed.remove(&key).is_some();

        match outcome {
            Outcome::Succeeded(value_type) => {
                *state.by_type.entry(value_type.name().to_string()).or_insert(0) += 1;
                state.succeeded_this_run += 1;
                state.journal.completed.push(key.clone());
                state.succeeded.insert(key);
            }
            Outcome::Skipped(reason) => {
                state.journal.skipped.push(SkippedKey {
                    key: key.clone(),
                    reason: reason.clone(),
                });
                state.skipped.insert(key, reason);
            }
            Outcome::Failed(error) => {
                let failure = KeyFailure {
                    key: key.clone(),
                    error: error.to_string(),
                    attempts,
                };
                state.journal.failed.push(failure.clone());
                state.failed.insert(key, failure);
            }
        }
        state.since_checkpoint += 1;
        if state.since_checkpoint == self.checkpoint_every {
            self.checkpoint_due.notify_one();
        }

        if was_claimed {
            let finished = match state.batches.get_mut(&batch) {
                Some(b) => {
                    b.outstanding = b.outstanding.saturating_sub(1);
                    b.sealed && b.outstanding == 0
                }
                None => false,
            };
            if finished {
                state.batches.remove(&batch);
            }
        }
        true
    }

    /// Current state of a key, `None` if the tracker has never seen it
    pub fn state_of(&self, key: &Key) -> Option<TaskState> {
        let state = self.state.lock();
        if state.succeeded.contains(key) {
            Some(TaskState::Succeeded)
        } else if state.skipped.contains_key(key) {
            Some(TaskState::Skipped)
        } else if state.failed.contains_key(key) {
            Some(TaskState::Failed)
        } else {
            state.claimed.get(key).copied()
        }
    }

    pub fn is_terminal(&self, key: &Key) -> bool {
        self.state_of(key).is_some_and(|s| s.is_terminal())
    }

    /// Terminal outcomes recorded since the last checkpoint
    pub fn outcomes_since_checkpoint(&self) -> u64 {
        self.state.lock().since_checkpoint
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        let in_flight = state
            .claimed
            .values()
            .filter(|s| **s == TaskState::InFlight)
            .count() as u64;
        ProgressSnapshot {
            scanned: state.scanned_this_run,
            succeeded: state.succeeded_this_run,
            failed: state.failed.len() as u64,
            skipped: state.skipped.len() as u64,
            in_flight,
            pending: state.claimed.len() as u64 - in_flight,
            retries: state.retries,
        }
    }

    /// Build the full checkpoint that reflects the current state
    pub fn snapshot(&self) -> RunCheckpoint {
        let now = self.time.now_millis();
        let state = self.state.lock();
        Self::full_checkpoint(&state, state.journal.generation, now)
    }

    /// Cursor to persist: start of the oldest batch with unresolved keys
    fn safe_cursor(state: &TrackerState) -> (ScanCursor, bool) {
        let cursor = match state.batches.values().next() {
            Some(oldest) => oldest.start,
            None => state.enumerated_through,
        };
        (cursor, state.enumeration_complete && state.batches.is_empty())
    }

    fn full_checkpoint(state: &TrackerState, generation: u64, now: u64) -> RunCheckpoint {
        let (cursor, enumeration_complete) = Self::safe_cursor(state);
        let mut completed: Vec<Key> = state.succeeded.iter().cloned().collect();
        completed.sort();
        let mut skipped: Vec<SkippedKey> = state
            .skipped
            .iter()
            .map(|(key, reason)| SkippedKey {
                key: key.clone(),
                reason: reason.clone(),
            })
            .collect();
        skipped.sort_by(|a, b| a.key.cmp(&b.key));
        let mut failed: Vec<KeyFailure> = state.failed.values().cloned().collect();
        failed.sort_by(|a, b| a.key.cmp(&b.key));

        RunCheckpoint {
            version: CHECKPOINT_VERSION,
            generation,
            cursor,
            enumeration_complete,
            completed,
            skipped,
            failed,
            scanned: state.scanned,
            by_type: state.by_type.clone(),
            started_at_ms: state.started_at_ms,
            updated_at_ms: now,
        }
    }

    /// Resolves once enough outcomes have accumulated for a count-based checkpoint
    pub async fn checkpoint_requested(&self) {
        self.checkpoint_due.notified().await
    }

    /// Take what the next write should contain, clearing the unsaved keys
    fn prepare_write(&self) -> CheckpointWrite {
        let now = self.time.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.since_checkpoint = 0;

        let write = if state.journal.should_compact() {
            CheckpointWrite::Base(Self::full_checkpoint(
                state,
                state.journal.generation + 1,
                now,
            ))
        } else {
            let (cursor, enumeration_complete) = Self::safe_cursor(state);
            CheckpointWrite::Delta(CheckpointDelta {
                generation: state.journal.generation,
                cursor,
                enumeration_complete,
                completed: std::mem::take(&mut state.journal.completed),
                skipped: std::mem::take(&mut state.journal.skipped),
                failed: std::mem::take(&mut state.journal.failed),
                scanned: state.scanned,
                by_type: state.by_type.clone(),
                updated_at_ms: now,
            })
        };
        state.journal.clear_unsaved();
        write
    }

    /// Persist the current state. A no-op without a checkpoint store or in a
    /// dry run.
    ///
    /// If a write fails, the keys it carried are covered by forcing the
    /// next write to be a full base.
    pub async fn checkpoint(&self) -> Result<(), CheckpointError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.dry_run {
            return Ok(());
        }
        let _guard = self.save_lock.lock().await;
        match self.prepare_write() {
            CheckpointWrite::Base(checkpoint) => {
                let result = store.save(&checkpoint).await;
                let mut state = self.state.lock();
                match &result {
                    Ok(()) => {
                        state.journal.generation = checkpoint.generation;
                        state.journal.base_keys = checkpoint.key_count() as u64;
                        state.journal.journal_keys = 0;
                        state.journal.needs_base = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Checkpoint base write failed");
                        state.journal.needs_base = true;
                    }
                }
                result
            }
            CheckpointWrite::Delta(delta) => {
                let result = store.append(&delta).await;
                let mut state = self.state.lock();
                match &result {
                    Ok(()) => state.journal.journal_keys += delta.key_count() as u64,
                    Err(e) => {
                        warn!(error = %e, "Checkpoint journal append failed");
                        state.journal.needs_base = true;
                    }
                }
                result
            }
        }
    }

    pub fn summary(&self, duration: Duration) -> RunSummary {
        let checkpoint = self.snapshot();
        let state = self.state.lock();
        RunSummary {
            scanned: state.scanned_this_run,
            succeeded: state.succeeded_this_run,
            previously_completed: state.previously_completed,
            failed: checkpoint.failed.len() as u64,
            skipped: checkpoint.skipped.len() as u64,
            failures: checkpoint.failed,
            skipped_keys: checkpoint.skipped,
            by_type: checkpoint.by_type,
            retries: state.retries,
            duration,
            dry_run: self.dry_run,
        }
    }

    pub fn count_by_type(&self, value_type: &ValueType) -> u64 {
        self.state
            .lock()
            .by_type
            .get(value_type.name())
            .copied()
            .unwrap_or(0)
    }
}
