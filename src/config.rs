//! Migration run configuration
//!
//! Loaded from TOML (every field optional), then overridden from the
//! environment, then validated before anything connects to a store.
//!
//! ```toml
//! concurrency = 32
//! max_attempts = 5
//!
//! [retry]
//! base_delay = 200   # milliseconds
//! max_delay = 5000
//!
//! [scan]
//! batch_size = 500
//! pattern = "user:*"
//!
//! [checkpoint]
//! path = "/var/lib/kv-migrate/run.json"
//! interval_keys = 1000
//! interval = 5000
//! ```

use crate::migration::enumerator::KeyFilter;
use crate::migration::error::MigrationError;
use crate::migration::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Capacity of the bounded work queue
    pub queue_capacity: usize,
    /// Attempts per key before it is marked Failed
    pub max_attempts: u32,
    pub retry: BackoffConfig,
    pub scan: ScanConfig,
    pub checkpoint: CheckpointConfig,
    /// Checkpoint to resume from
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Delete each destination key before writing it
    pub replace_existing: bool,
    /// On resume, attempt previously Failed keys again
    pub retry_failed_on_resume: bool,
    /// Enumerate and classify only
    pub dry_run: bool,
    #[serde(with = "duration_millis")]
    pub progress_log_interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            concurrency: 10,
            queue_capacity: 1000,
            max_attempts: 3,
            retry: BackoffConfig::default(),
            scan: ScanConfig::default(),
            checkpoint: CheckpointConfig::default(),
            resume_from_checkpoint: None,
            replace_existing: true,
            retry_failed_on_resume: false,
            dry_run: false,
            progress_log_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// COUNT hint per SCAN call
    pub batch_size: usize,
    /// Attempts per page before the run aborts
    pub max_attempts: u32,
    /// Glob restricting which keys are migrated
    pub pattern: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            batch_size: 100,
            max_attempts: 5,
            pattern: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint file; `None` disables persistence
    pub path: Option<PathBuf>,
    /// Checkpoint after this many terminal outcomes
    pub interval_keys: u64,
    /// Checkpoint at least this often
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            path: None,
            interval_keys: 1000,
            interval: Duration::from_secs(5),
        }
    }
}

impl MigrationConfig {
    /// Small, fast settings for tests
    pub fn test() -> Self {
        MigrationConfig {
            concurrency: 4,
            queue_capacity: 16,
            retry: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            scan: ScanConfig {
                batch_size: 10,
                ..Default::default()
            },
            checkpoint: CheckpointConfig {
                path: None,
                interval_keys: 10,
                interval: Duration::from_millis(50),
            },
            progress_log_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, MigrationError> {
        toml::from_str(s).map_err(|e| MigrationError::Configuration(format!("invalid config: {}", e)))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `KV_MIGRATE_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), MigrationError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), MigrationError> {
        if let Some(v) = lookup("KV_MIGRATE_CONCURRENCY") {
            self.concurrency = parse_env("KV_MIGRATE_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("KV_MIGRATE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("KV_MIGRATE_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("KV_MIGRATE_MAX_ATTEMPTS") {
            self.max_attempts = parse_env("KV_MIGRATE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("KV_MIGRATE_CHECKPOINT") {
            self.checkpoint.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KV_MIGRATE_MATCH") {
            self.scan.pattern = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        let invalid = |msg: &str| Err(MigrationError::Configuration(msg.to_string()));
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.scan.batch_size == 0 {
            return invalid("scan.batch_size must be at least 1");
        }
        if self.scan.max_attempts == 0 {
            return invalid("scan.max_attempts must be at least 1");
        }
        if self.checkpoint.interval_keys == 0 || self.checkpoint.interval.is_zero() {
            return invalid("checkpoint intervals must be non-zero");
        }
        if self.retry.max_delay < self.retry.base_delay {
            return invalid("retry.max_delay must not be less than retry.base_delay");
        }
        self.key_filter()?;
        Ok(())
    }

    /// Per-key retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry.base_delay,
            max_delay: self.retry.max_delay,
            jitter: self.retry.jitter,
        }
    }

    /// Retry policy for key enumeration pages
    pub fn scan_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.scan.max_attempts,
            ..self.retry_policy()
        }
    }

    pub fn key_filter(&self) -> Result<KeyFilter, MigrationError> {
        match &self.scan.pattern {
            Some(pattern) => KeyFilter::glob(pattern),
            None => Ok(KeyFilter::all()),
        }
    }

    /// Where checkpoints are written: the configured path, or the file
    /// being resumed from
    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint
            .path
            .as_deref()
            .or(self.resume_from_checkpoint.as_deref())
    }
}

fn parse_env<V: std::str::FromStr>(name: &str, value: &str) -> Result<V, MigrationError>
where
    V::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| MigrationError::Configuration(format!("{}={:?}: {}", name, value, e)))
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
