//! Key Enumerator
//!
//! Walks the source keyspace with cursor-based iteration (SCAN), one page
//! at a time, so memory use is bounded by the page size and the store is
//! never blocked by a single keyspace-wide listing.
//!
//! Cursor iteration over a keyspace that is being modified may return a key
//! more than once or miss keys created mid-scan; duplicates are suppressed
//! by the progress tracker, misses are accepted.

use super::error::MigrationError;
use super::progress::{Claim, ProgressTracker};
use super::retry::RetryPolicy;
use super::task::{MigrationTask, Outcome, SkipReason, TaskOutcome};
use super::worker::TaskSink;
use crate::data::Key;
use crate::io::{ProductionRng, Rng, TimeSource};
use crate::store::{ScanCursor, SourceStore};
use glob::Pattern;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Selects which keys are migrated.
///
/// The glob is also sent to the store as a MATCH hint; it is re-checked
/// client-side because a store is free to ignore the hint.
#[derive(Clone, Default)]
pub struct KeyFilter {
    pattern: Option<Pattern>,
    predicate: Option<Arc<dyn Fn(&Key) -> bool + Send + Sync>>,
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFilter")
            .field("pattern", &self.pattern.as_ref().map(|p| p.as_str()))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl KeyFilter {
    /// Accept every key
    pub fn all() -> Self {
        Self::default()
    }

    pub fn glob(pattern: &str) -> Result<Self, MigrationError> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            MigrationError::Configuration(format!("invalid key pattern '{}': {}", pattern, e))
        })?;
        Ok(KeyFilter {
            pattern: Some(pattern),
            predicate: None,
        })
    }

    /// Add an arbitrary predicate, applied after the glob
    pub fn with_predicate(mut self, predicate: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(|p| p.as_str())
    }

    pub fn matches(&self, key: &Key) -> bool {
        if let Some(pattern) = &self.pattern {
            let matched = match key.as_str() {
                Some(s) => pattern.matches(s),
                None => pattern.matches(&String::from_utf8_lossy(key.as_bytes())),
            };
            if !matched {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p(key))
    }
}

/// One page of enumerated keys
#[derive(Debug, Clone, Default)]
pub struct KeyBatch {
    pub keys: Vec<Key>,
    /// Keys the store returned that the filter rejected
    pub filtered: Vec<Key>,
    /// `None` once the keyspace is exhausted
    pub next: Option<ScanCursor>,
}

pub struct KeyEnumerator<S, R: Rng = ProductionRng> {
    source: Arc<S>,
    filter: KeyFilter,
    batch_size: usize,
    /// Retry policy for page fetches
    policy: RetryPolicy,
    rng: R,
}

impl<S: SourceStore> KeyEnumerator<S, ProductionRng> {
    pub fn new(source: Arc<S>, filter: KeyFilter, batch_size: usize, policy: RetryPolicy) -> Self {
        Self::with_rng(source, filter, batch_size, policy, ProductionRng::new())
    }
}

impl<S: SourceStore, R: Rng> KeyEnumerator<S, R> {
    pub fn with_rng(
        source: Arc<S>,
        filter: KeyFilter,
        batch_size: usize,
        policy: RetryPolicy,
        rng: R,
    ) -> Self {
        KeyEnumerator {
            source,
            filter,
            batch_size: batch_size.max(1),
            policy,
            rng,
        }
    }

    /// Fetch the page at `cursor`, retrying transient failures with
    /// backoff. Exhausting the attempts is fatal for the run.
    pub async fn next_batch(&mut self, cursor: ScanCursor) -> Result<KeyBatch, MigrationError> {
        let mut attempt = 0;
        let page = loop {
            attempt += 1;
            match self
                .source
                .scan(cursor, self.batch_size, self.filter.pattern())
                .await
            {
                Ok(page) => break page,
                Err(e) => {
                    if !self.policy.should_retry(attempt) {
                        return Err(MigrationError::EnumerationExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(attempt, &mut self.rng);
                    warn!(
                        cursor = %cursor,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Key scan failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let (keys, filtered) = page.keys.into_iter().partition(|k| self.filter.matches(k));
        Ok(KeyBatch {
            keys,
            filtered,
            next: if page.next.is_start() {
                None
            } else {
                Some(page.next)
            },
        })
    }

    /// Enumerate from `start` to the end of the keyspace, claiming each key
    /// with the tracker and pushing newly claimed keys into `sink`. Suspends
    /// while the queue is full. Returns early, without error, on cancel.
    pub async fn feed<T: TimeSource>(
        &mut self,
        start: ScanCursor,
        tracker: &ProgressTracker<T>,
        sink: &TaskSink,
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        let mut cursor = start;
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                batch = self.next_batch(cursor) => batch?,
            };
            let seq = tracker.begin_batch(cursor);
            debug!(
                cursor = %cursor,
                keys = batch.keys.len(),
                filtered = batch.filtered.len(),
                "Fetched key batch"
            );

            for key in batch.filtered {
                if tracker.claim(&key, seq) == Claim::Claimed {
                    let task = MigrationTask::new(key, seq);
                    tracker.record(TaskOutcome::new(&task, Outcome::Skipped(SkipReason::Filtered)));
                }
            }

            for key in batch.keys {
                if tracker.claim(&key, seq) != Claim::Claimed {
                    continue;
                }
                let task = MigrationTask::new(key, seq);
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = sink.send(task) => sent,
                };
                if !sent {
                    // Claimed but never queued; the open batch keeps the
                    // checkpoint cursor at or before this key.
                    return Ok(());
                }
            }

            let next = batch.next.unwrap_or(ScanCursor::START);
            tracker.end_batch(seq, next);
            match batch.next {
                Some(next) => cursor = next,
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig};
    use std::collections::HashSet;

    fn enumerator<S: SourceStore>(source: Arc<S>, filter: KeyFilter, batch: usize) -> KeyEnumerator<S, SimulatedRng> {
        KeyEnumerator::with_rng(source, filter, batch, RetryPolicy::test(), SimulatedRng::new(1))
    }

    #[test]
    fn test_glob_filter() {
        let filter = KeyFilter::glob("user:*").unwrap();
        assert!(filter.matches(&Key::from("user:1")));
        assert!(!filter.matches(&Key::from("session:1")));
        assert_eq!(filter.pattern(), Some("user:*"));
    }

    #[test]
    fn test_invalid_glob_is_configuration_error() {
        assert!(matches!(
            KeyFilter::glob("user:[").unwrap_err(),
            MigrationError::Configuration(_)
        ));
    }

    #[test]
    fn test_predicate_filter() {
        let filter = KeyFilter::all().with_predicate(|k| k.len() > 3);
        assert!(filter.matches(&Key::from("long")));
        assert!(!filter.matches(&Key::from("abc")));
    }

    #[tokio::test]
    async fn test_walks_whole_keyspace_in_pages() {
        let store = InMemoryStore::new();
        for i in 0..25 {
            store.set_string(format!("k{:02}", i), "v");
        }
        let mut e = enumerator(Arc::new(store), KeyFilter::all(), 10);

        let mut seen = HashSet::new();
        let mut cursor = ScanCursor::START;
        let mut pages = 0;
        loop {
            let batch = e.next_batch(cursor).await.unwrap();
            pages += 1;
            assert!(batch.keys.len() <= 10);
            seen.extend(batch.keys);
            match batch.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        assert_eq!(seen.len(), 25);
        assert!(pages >= 3);
    }

    #[tokio::test]
    async fn test_transient_scan_failures_are_retried() {
        let inner = InMemoryStore::new();
        inner.set_string("a", "1");
        let config = SimulatedStoreConfig {
            scan_fail_prob: 0.5,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = Arc::new(SimulatedStore::new(inner, SimulatedRng::new(3), config));
        let mut e = KeyEnumerator::with_rng(
            store.clone(),
            KeyFilter::all(),
            10,
            RetryPolicy::test().with_max_attempts(50),
            SimulatedRng::new(1),
        );

        let batch = e.next_batch(ScanCursor::START).await.unwrap();
        assert_eq!(batch.keys, vec![Key::from("a")]);
        assert!(batch.next.is_none());
    }

    #[tokio::test]
    async fn test_scan_exhaustion_is_fatal() {
        let config = SimulatedStoreConfig {
            scan_fail_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = Arc::new(SimulatedStore::new(InMemoryStore::new(), SimulatedRng::new(3), config));
        let mut e = enumerator(store, KeyFilter::all(), 10);

        match e.next_batch(ScanCursor::START).await {
            Err(MigrationError::EnumerationExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_filtered_keys_are_reported_separately() {
        let store = InMemoryStore::new();
        store.set_string("keep:1", "v");
        store.set_string("drop:1", "v");
        let filter = KeyFilter::all().with_predicate(|k| k.as_bytes().starts_with(b"keep"));
        let mut e = enumerator(Arc::new(store), filter, 100);

        let batch = e.next_batch(ScanCursor::START).await.unwrap();
        assert_eq!(batch.keys, vec![Key::from("keep:1")]);
        assert_eq!(batch.filtered, vec![Key::from("drop:1")]);
    }
}
