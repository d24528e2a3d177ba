//! Migration Engine
//!
//! Copies every key of a source store to a destination store, preserving
//! type, content and remaining TTL, with bounded concurrency, retries and
//! resumable checkpoints.
//!
//! ```text
//! KeyEnumerator ──▶ bounded queue ──▶ MigrationWorkerPool ──▶ TypeTranscoder
//!       │                                    │
//!       └───────────── ProgressTracker ◀─────┘──▶ CheckpointStore
//!                            ▲
//!                   MigrationOrchestrator
//! ```
//!
//! - `enumerator`: cursor-based, filtered key discovery
//! - `transcoder`: type-aware read and faithful write of one key
//! - `worker`: bounded queue and worker pool
//! - `retry`: exponential backoff policy
//! - `progress`: per-key state, counters, checkpoint snapshots
//! - `checkpoint`: serializable run state, its journal records and stores
//! - `orchestrator`: run lifecycle, cancellation, exit status
//! - `dst`: deterministic simulation harness

pub mod checkpoint;
pub mod dst;
pub mod enumerator;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod task;
pub mod transcoder;
pub mod worker;

pub use checkpoint::{
    CheckpointDelta, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, KeyFailure,
    RunCheckpoint, SkippedKey, CHECKPOINT_VERSION,
};
pub use dst::{
    run_dst_batch, summarize_batch, MigrationDSTConfig, MigrationDSTHarness, MigrationDSTResult,
};
pub use enumerator::{KeyBatch, KeyEnumerator, KeyFilter};
pub use error::{CheckpointError, Disposition, MigrationError};
pub use orchestrator::{
    MigrationOrchestrator, RunOutcome, RunState, RunStatus, EXIT_ABORTED, EXIT_PARTIAL_FAILURE,
    EXIT_SUCCESS,
};
pub use progress::{ProgressSnapshot, ProgressTracker, RunSummary};
pub use retry::RetryPolicy;
pub use task::{MigrationTask, Outcome, SkipReason, TaskOutcome, TaskState};
pub use transcoder::TypeTranscoder;
pub use worker::{task_queue, MigrationWorkerPool, PoolStats, TaskSink, TaskSource};
