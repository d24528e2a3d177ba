//! Migration error taxonomy
//!
//! Per-key errors are contained in their task and decide its fate through
//! [`MigrationError::disposition`]. Only enumeration, configuration and
//! checkpoint errors end a run.

use crate::store::StoreError;
use std::path::PathBuf;

/// What the worker pool does with a task whose attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue with backoff while attempts remain
    Retry,
    /// Terminal Skipped
    Skip,
    /// Terminal Failed, no further attempts
    Fail,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MigrationError {
    /// Network or timeout error on either side; retryable
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// The key vanished from the source (deleted or expired mid-run)
    #[error("key no longer exists in source")]
    NotFound,

    #[error("unsupported value type '{0}'")]
    UnsupportedType(String),

    /// Data that cannot be transcoded; retrying won't help
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Processing the key panicked; the worker survived
    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    #[error("key enumeration failed after {attempts} attempts: {last_error}")]
    EnumerationExhausted { attempts: u32, last_error: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("run cancelled")]
    Cancelled,
}

impl MigrationError {
    pub fn disposition(&self) -> Disposition {
        match self {
            MigrationError::TransientStore(_) => Disposition::Retry,
            MigrationError::NotFound | MigrationError::UnsupportedType(_) => Disposition::Skip,
            _ => Disposition::Fail,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::EnumerationExhausted { .. }
                | MigrationError::Configuration(_)
                | MigrationError::Checkpoint(_)
        )
    }

    /// Map a destination-side store error. A key missing on the
    /// destination (e.g. PEXPIRE after a concurrent delete there) is worth
    /// rewriting, not skipping.
    pub fn from_destination(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => {
                MigrationError::TransientStore("key disappeared from destination during write".into())
            }
            other => other.into(),
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => MigrationError::TransientStore(msg),
            StoreError::NotFound => MigrationError::NotFound,
            // Type changed between TYPE and the typed read; a retry re-reads it
            StoreError::WrongType(msg) => MigrationError::TransientStore(format!("type changed: {}", msg)),
            StoreError::Malformed(msg) => MigrationError::MalformedData(msg),
        }
    }
}

impl From<CheckpointError> for MigrationError {
    fn from(e: CheckpointError) -> Self {
        MigrationError::Checkpoint(e.to_string())
    }
}

/// Error persisting or loading a run checkpoint
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported checkpoint version {found} (max supported {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}
