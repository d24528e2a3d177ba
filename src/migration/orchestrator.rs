//! Migration Orchestrator
//!
//! Owns one run from start to finish:
//!
//! ```text
//! Initializing ──▶ Migrating ──▶ Draining ──▶ Completed
//!       │              │             │
//!       └──────────────┴─────────────┴──────▶ Aborted
//! ```
//!
//! - **Initializing**: validate config, load the checkpoint when resuming
//! - **Migrating**: the enumerator feeds the bounded queue while the worker
//!   pool drains it; a background task checkpoints every N outcomes or T
//!   seconds, another logs progress
//! - **Draining**: enumeration finished, waiting for in-flight and retrying
//!   tasks
//! - **Aborted**: fatal enumeration error or cancellation. In-flight tasks
//!   finish, queued ones are left for the next run, and the checkpoint is
//!   finalized so the run can be resumed.

use super::checkpoint::{CheckpointStore, FileCheckpointStore};
use super::enumerator::{KeyEnumerator, KeyFilter};
use super::error::MigrationError;
use super::progress::{ProgressTracker, RunSummary};
use super::transcoder::TypeTranscoder;
use super::worker::{task_queue, MigrationWorkerPool, PoolStats};
use crate::config::MigrationConfig;
use crate::io::{ProductionRng, ProductionTimeSource, Rng, TimeSource};
use crate::store::{DestinationStore, SourceStore};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code: completed, nothing failed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code: completed, at least one key failed
pub const EXIT_PARTIAL_FAILURE: i32 = 1;
/// Exit code: aborted or fatal error
pub const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Migrating,
    Draining,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Initializing => "initializing",
            RunState::Migrating => "migrating",
            RunState::Draining => "draining",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// Result of a run that got past initialization
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub summary: RunSummary,
    /// Why the run aborted
    pub error: Option<MigrationError>,
    pub pool_stats: PoolStats,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Aborted => EXIT_ABORTED,
            RunStatus::Completed if self.summary.has_failures() => EXIT_PARTIAL_FAILURE,
            RunStatus::Completed => EXIT_SUCCESS,
        }
    }
}

pub struct MigrationOrchestrator<S, D, T: TimeSource = ProductionTimeSource, R: Rng = ProductionRng> {
    source: Arc<S>,
    destination: Arc<D>,
    config: MigrationConfig,
    /// Where checkpoints are written
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    /// Where the checkpoint to resume from is read; `None` for a fresh run
    resume_store: Option<Arc<dyn CheckpointStore>>,
    filter: Option<KeyFilter>,
    time: T,
    rng: Mutex<R>,
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
}

impl<S: SourceStore, D: DestinationStore> MigrationOrchestrator<S, D> {
    /// Orchestrator with file checkpoints taken from `config`
    pub fn new(source: Arc<S>, destination: Arc<D>, config: MigrationConfig) -> Self {
        Self::with_io(source, destination, config, ProductionTimeSource, ProductionRng::new())
    }
}

impl<S, D, T, R> MigrationOrchestrator<S, D, T, R>
where
    S: SourceStore,
    D: DestinationStore,
    T: TimeSource,
    R: Rng,
{
    pub fn with_io(source: Arc<S>, destination: Arc<D>, config: MigrationConfig, time: T, rng: R) -> Self {
        let checkpoint_store = config
            .checkpoint_path()
            .map(|p| Arc::new(FileCheckpointStore::new(p)) as Arc<dyn CheckpointStore>);
        let resume_store = config
            .resume_from_checkpoint
            .as_ref()
            .map(|p| Arc::new(FileCheckpointStore::new(p)) as Arc<dyn CheckpointStore>);
        let (state, _) = watch::channel(RunState::Initializing);
        MigrationOrchestrator {
            source,
            destination,
            config,
            checkpoint_store,
            resume_store,
            filter: None,
            time,
            rng: Mutex::new(rng),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Write checkpoints to `store` instead of the configured file
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Resume from the checkpoint held by `store`
    pub fn resume_from(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.resume_store = Some(store);
        self
    }

    /// Replace the configured glob filter
    pub fn with_key_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Cancelling this token stops the run: no new keys are started,
    /// in-flight keys finish, and the checkpoint is finalized.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn transition(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Run state changed");
        }
    }

    /// Execute the run. `Err` only for startup failures (bad config, no
    /// checkpoint to resume from); everything after that is reported in
    /// the `RunOutcome`.
    pub async fn run(&self) -> Result<RunOutcome, MigrationError> {
        let started = tokio::time::Instant::now();
        self.transition(RunState::Initializing);

        let tracker = match self.initialize().await {
            Ok(tracker) => Arc::new(tracker),
            Err(e) => {
                error!(error = %e, "Migration failed to start");
                self.transition(RunState::Aborted);
                return Err(e);
            }
        };
        let filter = match &self.filter {
            Some(filter) => filter.clone(),
            None => self.config.key_filter()?,
        };

        self.transition(RunState::Migrating);
        let config = &self.config;
        let (sink, tasks) = task_queue(config.queue_capacity);
        let transcoder = TypeTranscoder::with_time_source(self.time.clone())
            .replace_existing(config.replace_existing);
        let (pool_rng, scan_rng) = {
            let mut rng = self.rng.lock();
            (rng.fork(), rng.fork())
        };
        let pool = Arc::new(
            MigrationWorkerPool::new(
                self.source.clone(),
                self.destination.clone(),
                transcoder,
                tracker.clone(),
                config.retry_policy(),
                config.concurrency,
                pool_rng,
            )
            .dry_run(config.dry_run),
        );
        // Fatal enumeration errors stop the workers without cancelling the run token
        let pool_cancel = self.cancel.child_token();
        let pool_handle = tokio::spawn(pool.run(tasks, pool_cancel.clone()));

        let background = CancellationToken::new();
        let checkpointer = tokio::spawn(checkpoint_loop(
            tracker.clone(),
            config.checkpoint.interval,
            background.clone(),
        ));
        let reporter = tokio::spawn(progress_loop(
            tracker.clone(),
            config.progress_log_interval,
            background.clone(),
        ));
        let _tasks = RunTasks {
            tokens: vec![pool_cancel.clone(), background.clone()],
            handles: vec![
                pool_handle.abort_handle(),
                checkpointer.abort_handle(),
                reporter.abort_handle(),
            ],
        };

        let enumeration = if tracker.is_enumeration_complete() {
            info!("Checkpoint already covers the whole keyspace");
            Ok(())
        } else {
            let mut enumerator = KeyEnumerator::with_rng(
                self.source.clone(),
                filter,
                config.scan.batch_size,
                config.scan_policy(),
                scan_rng,
            );
            enumerator
                .feed(tracker.resume_cursor(), &tracker, &sink, &self.cancel)
                .await
        };
        sink.close();

        let mut failure = match enumeration {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Key enumeration failed, aborting run");
                pool_cancel.cancel();
                Some(e)
            }
        };
        if failure.is_none() && !self.cancel.is_cancelled() {
            self.transition(RunState::Draining);
            info!(pending = sink.pending(), "Enumeration finished, draining");
        }

        let pool_stats = match pool_handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Worker pool terminated abnormally");
                PoolStats::default()
            }
        };
        background.cancel();
        let _ = checkpointer.await;
        let _ = reporter.await;

        if failure.is_none() && self.cancel.is_cancelled() {
            warn!("Run cancelled; unfinished keys will be retried on resume");
            failure = Some(MigrationError::Cancelled);
        }
        if let Err(e) = tracker.checkpoint().await {
            error!(error = %e, "Final checkpoint failed");
            failure.get_or_insert(e.into());
        }

        let summary = tracker.summary(started.elapsed());
        let status = if failure.is_some() {
            self.transition(RunState::Aborted);
            RunStatus::Aborted
        } else {
            self.transition(RunState::Completed);
            RunStatus::Completed
        };

        info!(
            scanned = summary.scanned,
            skipped = summary.skipped,
            "Fetched {} keys",
            summary.scanned
        );
        info!(
            failed = summary.failed,
            previously_completed = summary.previously_completed,
            duration_ms = summary.duration.as_millis() as u64,
            dry_run = summary.dry_run,
            "Copied {} keys",
            summary.succeeded
        );

        Ok(RunOutcome {
            status,
            summary,
            error: failure,
            pool_stats,
        })
    }

    async fn initialize(&self) -> Result<ProgressTracker<T>, MigrationError> {
        self.config.validate()?;

        let mut tracker = ProgressTracker::with_time_source(self.time.clone())
            .checkpoint_every(self.config.checkpoint.interval_keys)
            .dry_run(self.config.dry_run);
        if let Some(store) = &self.checkpoint_store {
            tracker = tracker.with_checkpoint_store(store.clone());
        }

        if let Some(store) = &self.resume_store {
            let checkpoint = store.load().await?.ok_or_else(|| {
                MigrationError::Configuration("no checkpoint found to resume from".to_string())
            })?;
            info!(
                completed = checkpoint.completed.len(),
                failed = checkpoint.failed.len(),
                cursor = %checkpoint.cursor,
                enumeration_complete = checkpoint.enumeration_complete,
                "Resuming from checkpoint"
            );
            tracker = tracker.resume_from(checkpoint, self.config.retry_failed_on_resume);
        }

        info!(
            concurrency = self.config.concurrency,
            queue_capacity = self.config.queue_capacity,
            max_attempts = self.config.max_attempts,
            dry_run = self.config.dry_run,
            "Starting migration"
        );
        Ok(tracker)
    }
}

/// Stops the tasks a run spawned when `run` returns or its future is
/// dropped, so an abandoned run leaves nothing writing behind it.
struct RunTasks {
    tokens: Vec<CancellationToken>,
    handles: Vec<AbortHandle>,
}

impl Drop for RunTasks {
    fn drop(&mut self) {
        for token in &self.tokens {
            token.cancel();
        }
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn checkpoint_loop<T: TimeSource>(
    tracker: Arc<ProgressTracker<T>>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tracker.checkpoint_requested() => {}
            _ = ticker.tick() => {}
        }
        if let Err(e) = tracker.checkpoint().await {
            warn!(error = %e, "Periodic checkpoint failed");
        }
    }
}

async fn progress_loop<T: TimeSource>(
    tracker: Arc<ProgressTracker<T>>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let p = tracker.progress();
        info!(
            scanned = p.scanned,
            succeeded = p.succeeded,
            failed = p.failed,
            skipped = p.skipped,
            in_flight = p.in_flight,
            pending = p.pending,
            retries = p.retries,
            "Migration progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Key;
    use crate::io::{SimulatedRng, SimulatedTimeSource};
    use crate::migration::checkpoint::InMemoryCheckpointStore;
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig};

    type Store = InMemoryStore<SimulatedTimeSource>;

    fn stores() -> (Arc<Store>, Arc<Store>, SimulatedTimeSource) {
        let time = SimulatedTimeSource::new(1_000_000);
        (
            Arc::new(InMemoryStore::with_time_source(time.clone())),
            Arc::new(InMemoryStore::with_time_source(time.clone())),
            time,
        )
    }

    fn orchestrator<S: SourceStore, D: DestinationStore>(
        source: Arc<S>,
        destination: Arc<D>,
        config: MigrationConfig,
        time: SimulatedTimeSource,
    ) -> MigrationOrchestrator<S, D, SimulatedTimeSource, SimulatedRng> {
        MigrationOrchestrator::with_io(source, destination, config, time, SimulatedRng::new(11))
    }

    #[tokio::test]
    async fn test_completed_run() {
        let (src, dst, time) = stores();
        for i in 0..50 {
            src.set_string(format!("s{}", i), "v");
        }
        src.set_hash("h", [("f", "v")]);

        let orch = orchestrator(src.clone(), dst.clone(), MigrationConfig::test(), time);
        let outcome = orch.run().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
        assert_eq!(outcome.summary.succeeded, 51);
        assert_eq!(outcome.summary.scanned, 51);
        assert_eq!(dst.len(), 51);
        assert_eq!(orch.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_startup() {
        let (src, dst, time) = stores();
        let config = MigrationConfig {
            concurrency: 0,
            ..MigrationConfig::test()
        };
        let orch = orchestrator(src, dst, config, time);
        assert!(matches!(
            orch.run().await,
            Err(MigrationError::Configuration(_))
        ));
        assert_eq!(orch.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails_startup() {
        let (src, dst, time) = stores();
        let orch = orchestrator(src, dst, MigrationConfig::test(), time)
            .resume_from(Arc::new(InMemoryCheckpointStore::new()));
        assert!(matches!(
            orch.run().await,
            Err(MigrationError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts() {
        let (src, dst, time) = stores();
        src.set_string("a", "v");
        let config = SimulatedStoreConfig {
            scan_fail_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let failing = Arc::new(SimulatedStore::new((*src).clone(), SimulatedRng::new(1), config));
        let orch = orchestrator(failing, dst, MigrationConfig::test(), time);

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.exit_code(), EXIT_ABORTED);
        assert!(matches!(
            outcome.error,
            Some(MigrationError::EnumerationExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_aborts_with_checkpoint() {
        let (src, dst, time) = stores();
        for i in 0..20 {
            src.set_string(format!("k{}", i), "v");
        }
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let orch = orchestrator(src, dst, MigrationConfig::test(), time)
            .with_checkpoint_store(checkpoints.clone());
        orch.cancel();

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.error, Some(MigrationError::Cancelled));
        assert_eq!(outcome.exit_code(), EXIT_ABORTED);
        assert!(checkpoints.latest().is_some());
    }

    #[tokio::test]
    async fn test_dry_run_classifies_without_writing() {
        let (src, dst, time) = stores();
        src.set_string("s", "v");
        src.set_list("l", ["a"]);
        src.set_opaque("m", "ReJSON-RL");
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let config = MigrationConfig {
            dry_run: true,
            ..MigrationConfig::test()
        };
        let orch = orchestrator(src, dst.clone(), config, time).with_checkpoint_store(checkpoints.clone());

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
        assert!(outcome.summary.dry_run);
        assert_eq!(outcome.summary.by_type.get("string"), Some(&1));
        assert_eq!(outcome.summary.by_type.get("list"), Some(&1));
        assert_eq!(outcome.summary.skipped, 1);
        assert!(dst.is_empty());
        assert_eq!(checkpoints.save_count(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions_observable() {
        let (src, dst, time) = stores();
        src.set_string("a", "v");
        let orch = orchestrator(src, dst, MigrationConfig::test(), time);
        let mut states = orch.subscribe();
        assert_eq!(*states.borrow_and_update(), RunState::Initializing);

        orch.run().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), RunState::Completed);
        assert!(orch.state().is_finished());
    }

    #[tokio::test]
    async fn test_glob_filter_restricts_keys() {
        let (src, dst, time) = stores();
        src.set_string("user:1", "a");
        src.set_string("user:2", "b");
        src.set_string("session:1", "c");
        let config = MigrationConfig {
            scan: crate::config::ScanConfig {
                pattern: Some("user:*".into()),
                batch_size: 10,
                max_attempts: 3,
            },
            ..MigrationConfig::test()
        };
        let outcome = orchestrator(src, dst.clone(), config, time).run().await.unwrap();

        assert_eq!(outcome.summary.succeeded, 2);
        assert!(dst.contains(&Key::from("user:1")));
        assert!(!dst.contains(&Key::from("session:1")));
    }
}
