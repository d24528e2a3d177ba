//! Migration Worker Pool
//!
//! N workers share one bounded queue fed by the key enumerator. A worker
//! handles one task at a time (read, write, report) and only checks for
//! cancellation between tasks, so a multi-step write is never abandoned
//! halfway.
//!
//! ```text
//!              ┌─────────── bounded queue (C) ───────────┐
//! enumerator ──┤ TaskSink::send  (suspends when full)    ├──▶ worker 1..N ──▶ tracker
//!              └──────────────▲──────────────────────────┘         │
//!                             └──── retry after backoff ◀──────────┘
//! ```
//!
//! ## Termination
//!
//! Every queued task is counted as pending until it reaches a terminal
//! outcome (or is dropped by cancellation). Once the sink is closed and the
//! pending count reaches zero the queue is drained and workers exit. The
//! channel itself never closes because delayed retries hold a sender.

use super::error::{Disposition, MigrationError};
use super::progress::ProgressTracker;
use super::retry::RetryPolicy;
use super::task::{MigrationTask, Outcome, SkipReason, TaskOutcome};
use super::transcoder::TypeTranscoder;
use crate::data::{Key, ValueType};
use crate::io::{ProductionRng, ProductionTimeSource, Rng, TimeSource};
use crate::store::{DestinationStore, SourceStore};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
struct QueueState {
    pending: Arc<AtomicUsize>,
    peak_pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    drained: CancellationToken,
}

impl QueueState {
    fn finish_one(&self) {
        let before = self.pending.fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.closed.load(Ordering::SeqCst) {
            self.drained.cancel();
        }
    }
}

/// Producer end of the work queue
#[derive(Debug)]
pub struct TaskSink {
    tx: mpsc::Sender<MigrationTask>,
    state: QueueState,
}

/// Consumer end of the work queue, shared by all workers
#[derive(Debug)]
pub struct TaskSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<MigrationTask>>,
    retry_tx: mpsc::Sender<MigrationTask>,
    state: QueueState,
}

/// Bounded work queue holding at most `capacity` tasks
pub fn task_queue(capacity: usize) -> (TaskSink, TaskSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let state = QueueState {
        pending: Arc::new(AtomicUsize::new(0)),
        peak_pending: Arc::new(AtomicUsize::new(0)),
        closed: Arc::new(AtomicBool::new(false)),
        drained: CancellationToken::new(),
    };
    (
        TaskSink {
            tx: tx.clone(),
            state: state.clone(),
        },
        TaskSource {
            rx: tokio::sync::Mutex::new(rx),
            retry_tx: tx,
            state,
        },
    )
}

impl TaskSink {
    /// Queue a task, waiting while the queue is full. False if the pool is gone.
    pub async fn send(&self, task: MigrationTask) -> bool {
        let pending = self.state.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_pending.fetch_max(pending, Ordering::Relaxed);
        if self.tx.send(task).await.is_err() {
            self.state.finish_one();
            return false;
        }
        true
    }

    /// No more tasks will be sent
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if self.state.pending.load(Ordering::SeqCst) == 0 {
            self.state.drained.cancel();
        }
    }

    /// Tasks sitting in the queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Tasks queued, in flight, or waiting to be retried
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Resolves once the sink is closed and every task has finished
    pub async fn drained(&self) {
        self.state.drained.cancelled().await
    }
}

impl TaskSource {
    async fn recv(&self) -> Option<MigrationTask> {
        self.rx.lock().await.recv().await
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Attempts made, across all keys
    pub attempts: u64,
    pub retries_scheduled: u64,
    pub panics: u64,
    /// Most value snapshots held in memory at once
    pub peak_snapshots_in_memory: u64,
    /// Most tasks queued, in flight, or awaiting retry at once
    pub peak_pending: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    attempts: AtomicU64,
    retries_scheduled: AtomicU64,
    panics: AtomicU64,
    snapshots_in_memory: AtomicU64,
    peak_snapshots_in_memory: AtomicU64,
}

/// Counts a snapshot as held in memory until dropped
struct HeldSnapshot<'a>(&'a PoolCounters);

impl<'a> HeldSnapshot<'a> {
    fn new(counters: &'a PoolCounters) -> Self {
        let held = counters.snapshots_in_memory.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .peak_snapshots_in_memory
            .fetch_max(held, Ordering::SeqCst);
        HeldSnapshot(counters)
    }
}

impl Drop for HeldSnapshot<'_> {
    fn drop(&mut self) {
        self.0.snapshots_in_memory.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MigrationWorkerPool<S, D, T: TimeSource = ProductionTimeSource, R: Rng = ProductionRng> {
    source: Arc<S>,
    destination: Arc<D>,
    transcoder: TypeTranscoder<T>,
    tracker: Arc<ProgressTracker<T>>,
    retry: RetryPolicy,
    concurrency: usize,
    dry_run: bool,
    rng: Mutex<R>,
    counters: PoolCounters,
}

impl<S, D, T, R> MigrationWorkerPool<S, D, T, R>
where
    S: SourceStore,
    D: DestinationStore,
    T: TimeSource,
    R: Rng,
{
    pub fn new(
        source: Arc<S>,
        destination: Arc<D>,
        transcoder: TypeTranscoder<T>,
        tracker: Arc<ProgressTracker<T>>,
        retry: RetryPolicy,
        concurrency: usize,
        rng: R,
    ) -> Self {
        MigrationWorkerPool {
            source,
            destination,
            transcoder,
            tracker,
            retry,
            concurrency: concurrency.max(1),
            dry_run: false,
            rng: Mutex::new(rng),
            counters: PoolCounters::default(),
        }
    }

    /// Classify keys only; nothing is written
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run the workers until the queue is drained or `cancel` fires.
    ///
    /// Dropping the returned future aborts every worker.
    pub async fn run(self: Arc<Self>, tasks: TaskSource, cancel: CancellationToken) -> PoolStats {
        let tasks = Arc::new(tasks);
        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            workers.spawn(self.clone().worker_loop(id, tasks.clone(), cancel.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }
        let mut stats = self.stats();
        stats.peak_pending = tasks.state.peak_pending.load(Ordering::Relaxed) as u64;
        stats
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries_scheduled: self.counters.retries_scheduled.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
            peak_snapshots_in_memory: self
                .counters
                .peak_snapshots_in_memory
                .load(Ordering::SeqCst),
            peak_pending: 0,
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize, tasks: Arc<TaskSource>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = tasks.state.drained.cancelled() => None,
                task = tasks.recv() => task,
            };
            let Some(task) = next else {
                break;
            };
            self.handle(task, &tasks, &cancel).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn handle(&self, mut task: MigrationTask, tasks: &TaskSource, cancel: &CancellationToken) {
        task.attempt += 1;
        self.tracker.mark_in_flight(&task.key);
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let result = match AssertUnwindSafe(self.attempt(&task.key)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.counters.panics.fetch_add(1, Ordering::Relaxed);
                error!(key = %task.key, panic = %message, "Worker panicked while processing key");
                Err(MigrationError::WorkerPanic(message))
            }
        };

        let outcome = match result {
            Ok(value_type) => Outcome::Succeeded(value_type),
            Err(e) => match e.disposition() {
                Disposition::Skip => {
                    let reason = match e {
                        MigrationError::UnsupportedType(name) => SkipReason::UnsupportedType(name),
                        _ => SkipReason::Vanished,
                    };
                    debug!(key = %task.key, reason = %reason, "Skipping key");
                    Outcome::Skipped(reason)
                }
                Disposition::Retry if self.retry.should_retry(task.attempt) => {
                    if cancel.is_cancelled() {
                        // Left unrecorded: Pending again on resume
                        tasks.state.finish_one();
                    } else {
                        self.schedule_retry(task, e, tasks, cancel);
                    }
                    return;
                }
                _ => {
                    error!(
                        key = %task.key,
                        attempts = task.attempt,
                        error = %e,
                        "Key failed"
                    );
                    Outcome::Failed(e)
                }
            },
        };

        self.tracker.record(TaskOutcome::new(&task, outcome));
        tasks.state.finish_one();
    }

    async fn attempt(&self, key: &Key) -> Result<ValueType, MigrationError> {
        if self.dry_run {
            let value_type = self.transcoder.classify(&self.source, key).await?;
            debug!(key = %key, value_type = %value_type, "Classified key");
            return Ok(value_type);
        }

        let snapshot = self.transcoder.read(&self.source, key).await?;
        let _held = HeldSnapshot::new(&self.counters);
        let value_type = snapshot.value_type();
        debug!(key = %key, value_type = %value_type, "Copying key");
        self.transcoder
            .write(&self.destination, key, &snapshot)
            .await?;
        debug!(key = %key, "Copied key");
        Ok(value_type)
    }

    fn schedule_retry(
        &self,
        mut task: MigrationTask,
        error: MigrationError,
        tasks: &TaskSource,
        cancel: &CancellationToken,
    ) {
        let delay = self.retry.delay_for(task.attempt, &mut *self.rng.lock());
        warn!(
            key = %task.key,
            attempt = task.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying key"
        );
        self.tracker.mark_pending_retry(&task.key);
        self.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        task.last_error = Some(error);

        let retry_tx = tasks.retry_tx.clone();
        let state = tasks.state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let requeued = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = async {
                    tokio::time::sleep(delay).await;
                    retry_tx.send(task).await.is_ok()
                } => sent,
            };
            if !requeued {
                state.finish_one();
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ScoredMember;
    use crate::io::{SimulatedRng, SimulatedTimeSource};
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig, StoreFuture};
    use crate::migration::task::TaskState;
    use bytes::Bytes;
    use std::time::Duration;

    type Src = InMemoryStore<SimulatedTimeSource>;

    fn pool<D: DestinationStore>(
        source: Arc<Src>,
        destination: Arc<D>,
        concurrency: usize,
    ) -> (
        Arc<MigrationWorkerPool<Src, D, SimulatedTimeSource, SimulatedRng>>,
        Arc<ProgressTracker<SimulatedTimeSource>>,
    ) {
        let time = source.time_source().clone();
        let tracker = Arc::new(ProgressTracker::with_time_source(time.clone()));
        let pool = MigrationWorkerPool::new(
            source,
            destination,
            TypeTranscoder::with_time_source(time),
            tracker.clone(),
            RetryPolicy::test(),
            concurrency,
            SimulatedRng::new(9),
        );
        (Arc::new(pool), tracker)
    }

    async fn run_keys<D: DestinationStore>(
        pool: Arc<MigrationWorkerPool<Src, D, SimulatedTimeSource, SimulatedRng>>,
        tracker: &ProgressTracker<SimulatedTimeSource>,
        keys: &[&str],
        capacity: usize,
    ) -> PoolStats {
        let (sink, source) = task_queue(capacity);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool.run(source, cancel));
        let batch = tracker.begin_batch(crate::store::ScanCursor::START);
        for k in keys {
            let key = Key::from(*k);
            tracker.claim(&key, batch);
            assert!(sink.send(MigrationTask::new(key, batch)).await);
        }
        tracker.end_batch(batch, crate::store::ScanCursor::START);
        sink.close();
        handle.await.unwrap()
    }

    fn src() -> Arc<Src> {
        Arc::new(InMemoryStore::with_time_source(SimulatedTimeSource::new(1_000)))
    }

    #[tokio::test]
    async fn test_pool_copies_and_classifies() {
        let source = src();
        source.set_string("s", "v");
        source.set_sorted_set("z", [("a", 1.0)]);
        source.set_opaque("stream", "stream");
        let destination = Arc::new(InMemoryStore::new());
        let (pool, tracker) = pool(source, destination.clone(), 4);

        run_keys(pool, &tracker, &["s", "z", "stream", "missing"], 8).await;

        assert_eq!(tracker.state_of(&Key::from("s")), Some(TaskState::Succeeded));
        assert_eq!(tracker.state_of(&Key::from("z")), Some(TaskState::Succeeded));
        assert_eq!(tracker.state_of(&Key::from("stream")), Some(TaskState::Skipped));
        assert_eq!(tracker.state_of(&Key::from("missing")), Some(TaskState::Skipped));
        assert!(destination.contains(&Key::from("s")));
        assert!(!destination.contains(&Key::from("stream")));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_exhausted() {
        let source = src();
        source.set_string("poison", "v");
        source.set_string("fine", "v");
        let config = SimulatedStoreConfig::no_faults().with_failing_writes("poison");
        let destination = Arc::new(SimulatedStore::new(
            InMemoryStore::new(),
            SimulatedRng::new(5),
            config,
        ));
        let (pool, tracker) = pool(source, destination.clone(), 2);

        let stats = run_keys(pool, &tracker, &["poison", "fine"], 4).await;

        let summary = tracker.summary(Duration::ZERO);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].key, Key::from("poison"));
        assert_eq!(summary.failures[0].attempts, 3);
        assert_eq!(stats.retries_scheduled, 2);
        assert_eq!(stats.attempts, 4);
        assert!(destination.inner().contains(&Key::from("fine")));
    }

    #[tokio::test]
    async fn test_malformed_value_fails_without_retry() {
        let source = src();
        source.set_sorted_set("bad", [("m", f64::NAN)]);
        source.set_string("fine", "v");
        let destination = Arc::new(InMemoryStore::new());
        let (pool, tracker) = pool(source, destination.clone(), 2);

        let stats = run_keys(pool, &tracker, &["bad", "fine"], 4).await;

        assert_eq!(tracker.state_of(&Key::from("bad")), Some(TaskState::Failed));
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.retries_scheduled, 0);
        let summary = tracker.summary(Duration::ZERO);
        assert_eq!(summary.retries, 0);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].attempts, 1);
        assert!(summary.failures[0].error.contains("NaN"), "{}", summary.failures[0].error);
        assert!(!destination.contains(&Key::from("bad")));
        assert!(destination.contains(&Key::from("fine")));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let source = src();
        source.set_list("l", ["a"]);
        let destination = Arc::new(InMemoryStore::new());
        let time = source.time_source().clone();
        let tracker = Arc::new(ProgressTracker::with_time_source(time.clone()).dry_run(true));
        let pool = MigrationWorkerPool::new(
            source,
            destination.clone(),
            TypeTranscoder::with_time_source(time),
            tracker.clone(),
            RetryPolicy::test(),
            1,
            SimulatedRng::new(1),
        )
        .dry_run(true);

        run_keys(Arc::new(pool), &tracker, &["l"], 1).await;

        assert!(destination.is_empty());
        assert_eq!(tracker.count_by_type(&ValueType::List), 1);
    }

    /// Destination that panics on one key
    struct PanickingDestination(InMemoryStore);

    impl DestinationStore for PanickingDestination {
        fn write_string<'a>(&'a self, key: &'a Key, value: &'a Bytes, ttl: Option<Duration>) -> StoreFuture<'a, ()> {
            if key.as_bytes() == b"boom" {
                panic!("corrupt key");
            }
            self.0.write_string(key, value, ttl)
        }
        fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
            self.0.append_list(key, values)
        }
        fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
            self.0.add_set_members(key, members)
        }
        fn add_sorted_set_members<'a>(&'a self, key: &'a Key, members: &'a [ScoredMember]) -> StoreFuture<'a, ()> {
            self.0.add_sorted_set_members(key, members)
        }
        fn set_hash_fields<'a>(&'a self, key: &'a Key, fields: &'a [(Bytes, Bytes)]) -> StoreFuture<'a, ()> {
            self.0.set_hash_fields(key, fields)
        }
        fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
            self.0.expire(key, ttl)
        }
        fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
            self.0.delete(key)
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let source = src();
        source.set_string("boom", "v");
        source.set_string("after", "v");
        let destination = Arc::new(PanickingDestination(InMemoryStore::new()));
        let (pool, tracker) = pool(source, destination.clone(), 1);

        let stats = run_keys(pool, &tracker, &["boom", "after"], 4).await;

        assert_eq!(stats.panics, 1);
        assert_eq!(tracker.state_of(&Key::from("boom")), Some(TaskState::Failed));
        assert_eq!(tracker.state_of(&Key::from("after")), Some(TaskState::Succeeded));
    }

    #[tokio::test]
    async fn test_snapshots_bounded_by_workers() {
        let source = src();
        let keys: Vec<String> = (0..40).map(|i| format!("k{}", i)).collect();
        for k in &keys {
            source.set_string(k.as_str(), "v");
        }
        let config = SimulatedStoreConfig::no_faults()
            .with_write_latency(Duration::from_millis(2), Duration::from_millis(4));
        let destination = Arc::new(SimulatedStore::new(
            InMemoryStore::new(),
            SimulatedRng::new(2),
            config,
        ));
        let (pool, tracker) = pool(source, destination, 3);

        let refs: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        let stats = run_keys(pool, &tracker, &refs, 5).await;

        assert!(stats.peak_snapshots_in_memory <= 3);
        assert!(stats.peak_pending <= 5 + 3 + 1, "peak pending {}", stats.peak_pending);
        assert_eq!(tracker.summary(Duration::ZERO).succeeded, 40);
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let source = src();
        source.set_string("a", "v");
        let destination = Arc::new(InMemoryStore::new());
        let (pool, _tracker) = pool(source, destination, 2);

        let (sink, tasks) = task_queue(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool.run(tasks, cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pool should stop on cancel")
            .unwrap();
        drop(sink);
    }
}
