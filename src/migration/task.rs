//! Migration tasks and their outcomes

use super::error::MigrationError;
use crate::data::{Key, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of work: one key, carried through retries
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub key: Key,
    /// Attempts made so far
    pub attempt: u32,
    pub last_error: Option<MigrationError>,
    /// Enumeration batch the key came from
    pub batch: u64,
}

impl MigrationTask {
    pub fn new(key: Key, batch: u64) -> Self {
        MigrationTask {
            key,
            attempt: 0,
            last_error: None,
            batch,
        }
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued or waiting out a retry backoff
    Pending,
    /// A worker is reading or writing the key
    InFlight,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// Why a key was skipped rather than copied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Rejected by the key filter
    Filtered,
    /// Deleted or expired before it could be read
    Vanished,
    /// Type outside the supported set
    UnsupportedType(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Filtered => write!(f, "filtered"),
            SkipReason::Vanished => write!(f, "vanished"),
            SkipReason::UnsupportedType(t) => write!(f, "unsupported type '{}'", t),
        }
    }
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Copied (or, in a dry run, classified as copyable)
    Succeeded(ValueType),
    Skipped(SkipReason),
    Failed(MigrationError),
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Succeeded(_) => TaskState::Succeeded,
            Outcome::Skipped(_) => TaskState::Skipped,
            Outcome::Failed(_) => TaskState::Failed,
        }
    }
}

/// Reported to the progress tracker exactly once per key
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub key: Key,
    pub batch: u64,
    pub attempts: u32,
    pub outcome: Outcome,
}

impl TaskOutcome {
    pub fn new(task: &MigrationTask, outcome: Outcome) -> Self {
        TaskOutcome {
            key: task.key.clone(),
            batch: task.batch,
            attempts: task.attempt,
            outcome,
        }
    }
}
