//! Run checkpoints
//!
//! A `RunCheckpoint` is the durable record of a run's progress: the scan
//! cursor to resume from, every key that reached a terminal state, and
//! timestamps. It is written as pretty-printed JSON so an operator can
//! inspect it; unknown fields are ignored and missing fields default, so a
//! checkpoint written by another version of the tool still loads.
//!
//! ## Base and journal
//!
//! A store holds a *base* `RunCheckpoint` plus a journal of
//! `CheckpointDelta` records, each carrying only the keys that reached a
//! terminal state since the previous write along with the current cursor
//! and counters. `load` replays the journal over the base. The tracker
//! compacts (writes a fresh base and empties the journal) once the journal
//! holds as many keys as the base, so total checkpoint I/O stays linear in
//! the number of keys.
//!
//! ```text
//! run.json            base, generation N
//! run.json.journal    {"generation":N,...}\n{"generation":N,...}\n
//! ```
//!
//! Journal records tagged with another generation are stale leftovers of a
//! compaction that crashed before the journal was emptied, and are ignored.
//!
//! ## Atomicity
//!
//! `FileCheckpointStore` writes the base to `<path>.tmp` and renames it over
//! the target, so a crash mid-write leaves the previous base intact. Replay
//! stops at the first journal line that does not decode, which is where an
//! append was torn by a crash.

use super::error::CheckpointError;
use super::task::SkipReason;
use crate::data::Key;
use crate::store::ScanCursor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Highest checkpoint format version this build reads
pub const CHECKPOINT_VERSION: u32 = 1;

/// A key that ended Failed, with the error from its last attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: Key,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedKey {
    pub key: Key,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCheckpoint {
    pub version: u32,
    /// Bumped on every compaction; journal records must match it
    pub generation: u64,
    /// Cursor to resume enumeration from
    pub cursor: ScanCursor,
    /// Every key was enumerated and resolved
    pub enumeration_complete: bool,
    /// Keys copied successfully, across all runs
    pub completed: Vec<Key>,
    pub skipped: Vec<SkippedKey>,
    pub failed: Vec<KeyFailure>,
    /// Keys returned by enumeration, across all runs
    pub scanned: u64,
    /// Copied keys per value type
    pub by_type: BTreeMap<String, u64>,
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Default for RunCheckpoint {
    fn default() -> Self {
        RunCheckpoint {
            version: CHECKPOINT_VERSION,
            generation: 0,
            cursor: ScanCursor::START,
            enumeration_complete: false,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            scanned: 0,
            by_type: BTreeMap::new(),
            started_at_ms: 0,
            updated_at_ms: 0,
        }
    }
}

impl RunCheckpoint {
    pub fn to_json(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: RunCheckpoint = serde_json::from_slice(data)?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(checkpoint)
    }

    /// Fold a journal record into this checkpoint. Returns false, changing
    /// nothing, when the record belongs to another generation.
    pub fn apply(&mut self, delta: CheckpointDelta) -> bool {
        if delta.generation != self.generation {
            return false;
        }
        self.cursor = delta.cursor;
        self.enumeration_complete = delta.enumeration_complete;
        self.completed.extend(delta.completed);
        self.skipped.extend(delta.skipped);
        self.failed.extend(delta.failed);
        self.scanned = delta.scanned;
        self.by_type = delta.by_type;
        self.updated_at_ms = delta.updated_at_ms;
        true
    }

    /// Number of keys with a terminal record
    pub fn key_count(&self) -> usize {
        self.completed.len() + self.skipped.len() + self.failed.len()
    }
}

/// One journal record: the keys resolved since the previous checkpoint
/// write, and the cursor and counters as of this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointDelta {
    pub generation: u64,
    pub cursor: ScanCursor,
    pub enumeration_complete: bool,
    pub completed: Vec<Key>,
    pub skipped: Vec<SkippedKey>,
    pub failed: Vec<KeyFailure>,
    pub scanned: u64,
    pub by_type: BTreeMap<String, u64>,
    pub updated_at_ms: u64,
}

impl Default for CheckpointDelta {
    fn default() -> Self {
        CheckpointDelta {
            generation: 0,
            cursor: ScanCursor::START,
            enumeration_complete: false,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            scanned: 0,
            by_type: BTreeMap::new(),
            updated_at_ms: 0,
        }
    }
}

impl CheckpointDelta {
    pub fn key_count(&self) -> usize {
        self.completed.len() + self.skipped.len() + self.failed.len()
    }

    /// Single-line JSON terminated by a newline
    pub fn to_line(&self) -> Result<Vec<u8>, CheckpointError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Replay journal `lines` over `base`, stopping at the first line that does
/// not decode.
fn replay<'a>(mut base: RunCheckpoint, lines: impl IntoIterator<Item = &'a [u8]>) -> RunCheckpoint {
    let mut stale = 0usize;
    for line in lines {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CheckpointDelta>(line) {
            Ok(delta) => {
                if !base.apply(delta) {
                    stale += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, "Checkpoint journal ends in a torn record; ignoring the rest");
                break;
            }
        }
    }
    if stale > 0 {
        debug!(stale, generation = base.generation, "Ignored journal records from another generation");
    }
    base
}

pub type CheckpointFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CheckpointError>> + Send + 'a>>;

/// Durable home for a run's checkpoint
pub trait CheckpointStore: Send + Sync + 'static {
    /// Replace the base checkpoint and discard the journal
    fn save<'a>(&'a self, checkpoint: &'a RunCheckpoint) -> CheckpointFuture<'a, ()>;

    /// Append a record to the journal of the current base
    fn append<'a>(&'a self, delta: &'a CheckpointDelta) -> CheckpointFuture<'a, ()>;

    /// The base with its journal replayed; `None` when no base has been
    /// written yet
    fn load(&self) -> CheckpointFuture<'_, Option<RunCheckpoint>>;
}

/// JSON checkpoint file on local disk, with its journal at `<path>.journal`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.sibling(".journal")
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a RunCheckpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            let data = checkpoint.to_json()?;
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| self.io_error(e))?;
                }
            }
            let tmp = self.temp_path();
            tokio::fs::write(&tmp, &data)
                .await
                .map_err(|e| self.io_error(e))?;
            tokio::fs::rename(&tmp, &self.path)
                .await
                .map_err(|e| self.io_error(e))?;
            match tokio::fs::remove_file(self.journal_path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error(e)),
            }
            debug!(
                path = %self.path.display(),
                generation = checkpoint.generation,
                keys = checkpoint.key_count(),
                cursor = %checkpoint.cursor,
                "Checkpoint compacted"
            );
            Ok(())
        })
    }

    fn append<'a>(&'a self, delta: &'a CheckpointDelta) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            let line = delta.to_line()?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.journal_path())
                .await
                .map_err(|e| self.io_error(e))?;
            file.write_all(&line).await.map_err(|e| self.io_error(e))?;
            file.sync_data().await.map_err(|e| self.io_error(e))?;
            debug!(
                keys = delta.key_count(),
                cursor = %delta.cursor,
                "Checkpoint journal appended"
            );
            Ok(())
        })
    }

    fn load(&self) -> CheckpointFuture<'_, Option<RunCheckpoint>> {
        Box::pin(async move {
            let base = match tokio::fs::read(&self.path).await {
                Ok(data) => RunCheckpoint::from_json(&data)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(self.io_error(e)),
            };
            let journal = match tokio::fs::read(self.journal_path()).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(self.io_error(e)),
            };
            Ok(Some(replay(base, journal.split(|b| *b == b'\n'))))
        })
    }
}

/// Checkpoint store for tests and dry runs; keeps the encoded JSON so the
/// same serialization path as the file store is exercised.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<InMemoryCheckpointState>>,
}

#[derive(Debug, Default)]
struct InMemoryCheckpointState {
    base: Option<Vec<u8>>,
    journal: Vec<Vec<u8>>,
    saves: u64,
    bytes_written: u64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes, base saves and journal appends alike
    pub fn save_count(&self) -> u64 {
        self.inner.lock().saves
    }

    /// Total encoded bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Records appended since the last base save
    pub fn journal_len(&self) -> usize {
        self.inner.lock().journal.len()
    }

    /// Decoded latest state, base plus journal
    pub fn latest(&self) -> Option<RunCheckpoint> {
        self.decode().ok().flatten()
    }

    fn decode(&self) -> Result<Option<RunCheckpoint>, CheckpointError> {
        let inner = self.inner.lock();
        let Some(data) = &inner.base else {
            return Ok(None);
        };
        let base = RunCheckpoint::from_json(data)?;
        Ok(Some(replay(base, inner.journal.iter().map(Vec::as_slice))))
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a RunCheckpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            let data = checkpoint.to_json()?;
            let mut inner = self.inner.lock();
            inner.bytes_written += data.len() as u64;
            inner.base = Some(data);
            inner.journal.clear();
            inner.saves += 1;
            Ok(())
        })
    }

    fn append<'a>(&'a self, delta: &'a CheckpointDelta) -> CheckpointFuture<'a, ()> {
        Box::pin(async move {
            let line = delta.to_line()?;
            let mut inner = self.inner.lock();
            inner.bytes_written += line.len() as u64;
            inner.journal.push(line);
            inner.saves += 1;
            Ok(())
        })
    }

    fn load(&self) -> CheckpointFuture<'_, Option<RunCheckpoint>> {
        Box::pin(async move { self.decode() })
    }
}

impl<C: CheckpointStore> CheckpointStore for Arc<C> {
    fn save<'a>(&'a self, checkpoint: &'a RunCheckpoint) -> CheckpointFuture<'a, ()> {
        (**self).save(checkpoint)
    }

    fn append<'a>(&'a self, delta: &'a CheckpointDelta) -> CheckpointFuture<'a, ()> {
        (**self).append(delta)
    }

    fn load(&self) -> CheckpointFuture<'_, Option<RunCheckpoint>> {
        (**self).load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunCheckpoint {
        RunCheckpoint {
            cursor: ScanCursor(42),
            completed: vec![Key::from("a"), Key::from(vec![0xffu8, 0x00])],
            skipped: vec![SkippedKey {
                key: Key::from("s"),
                reason: SkipReason::UnsupportedType("stream".into()),
            }],
            failed: vec![KeyFailure {
                key: Key::from("f"),
                error: "transient store error: timeout".into(),
                attempts: 3,
            }],
            scanned: 4,
            started_at_ms: 1_000,
            updated_at_ms: 2_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = br#"{
            "version": 1,
            "cursor": 7,
            "completed": ["x"],
            "written_by": "a future release",
            "extra": {"nested": true}
        }"#;
        let checkpoint = RunCheckpoint::from_json(json).unwrap();
        assert_eq!(checkpoint.cursor, ScanCursor(7));
        assert_eq!(checkpoint.completed, vec![Key::from("x")]);
        assert!(checkpoint.failed.is_empty());
    }

    #[test]
    fn test_newer_version_rejected() {
        let json = br#"{"version": 99}"#;
        assert!(matches!(
            RunCheckpoint::from_json(json),
            Err(CheckpointError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_json_is_human_readable() {
        let text = String::from_utf8(sample().to_json().unwrap()).unwrap();
        assert!(text.contains("\"cursor\": 42"));
        assert!(text.contains("\"unsupported_type\": \"stream\""));
        assert!(text.contains("\"base64\""));
    }

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested").join("run.json"));

        assert!(store.load().await.unwrap().is_none());

        let checkpoint = sample();
        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(checkpoint));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(CheckpointError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save(&sample()).await.unwrap();
        store.save(&sample()).await.unwrap();

        assert_eq!(store.save_count(), 2);
        assert_eq!(store.latest(), Some(sample()));
    }

    fn delta(generation: u64, cursor: u64, completed: &[&str]) -> CheckpointDelta {
        CheckpointDelta {
            generation,
            cursor: ScanCursor(cursor),
            completed: completed.iter().map(|k| Key::from(*k)).collect(),
            scanned: 10 + cursor,
            updated_at_ms: 3_000 + cursor,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_store_replays_journal_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("run.json"));
        store.save(&sample()).await.unwrap();
        store.append(&delta(0, 50, &["b", "c"])).await.unwrap();
        store.append(&delta(0, 60, &["d"])).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor, ScanCursor(60));
        assert_eq!(loaded.scanned, 70);
        assert_eq!(loaded.completed.len(), 5);
        assert!(loaded.completed.contains(&Key::from("d")));
        assert_eq!(loaded.failed, sample().failed);

        // Compaction empties the journal
        store.save(&loaded).await.unwrap();
        assert!(!store.journal_path().exists());
        assert_eq!(store.load().await.unwrap(), Some(loaded));
    }

    #[tokio::test]
    async fn test_file_store_ignores_torn_tail_and_stale_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("run.json"));
        let base = RunCheckpoint {
            generation: 2,
            ..sample()
        };
        store.save(&base).await.unwrap();
        store.append(&delta(1, 90, &["old"])).await.unwrap();
        store.append(&delta(2, 70, &["new"])).await.unwrap();

        let mut torn = delta(2, 80, &["lost"]).to_line().unwrap();
        torn.truncate(torn.len() / 2);
        let mut journal = std::fs::read(store.journal_path()).unwrap();
        journal.extend_from_slice(&torn);
        std::fs::write(store.journal_path(), journal).unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor, ScanCursor(70));
        assert!(loaded.completed.contains(&Key::from("new")));
        assert!(!loaded.completed.contains(&Key::from("old")));
        assert!(!loaded.completed.contains(&Key::from("lost")));
    }

    #[tokio::test]
    async fn test_in_memory_journal_counts_bytes() {
        let store = InMemoryCheckpointStore::new();
        store.save(&RunCheckpoint::default()).await.unwrap();
        let base_bytes = store.bytes_written();

        let record = delta(0, 5, &["k"]);
        store.append(&record).await.unwrap();
        assert_eq!(store.journal_len(), 1);
        assert_eq!(
            store.bytes_written(),
            base_bytes + record.to_line().unwrap().len() as u64
        );
        assert_eq!(store.latest().unwrap().completed, vec![Key::from("k")]);

        store.save(&store.latest().unwrap()).await.unwrap();
        assert_eq!(store.journal_len(), 0);
        assert_eq!(store.save_count(), 3);
    }
}
