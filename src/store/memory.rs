//! In-memory store for unit tests and deterministic simulation
//!
//! Implements both store capabilities over an ordered map. Keys expire
//! lazily against the store's `TimeSource`, and cursors are server-side
//! handles that remember the last key returned, so a scan resumed from a
//! cursor continues after that key even when the keyspace was mutated in
//! between. A page boundary always maps to the same handle, so repeated
//! scans reuse handles instead of minting new ones, and the oldest handles
//! are evicted past `DEFAULT_CURSOR_LIMIT`.

use super::{DestinationStore, ScanCursor, ScanPage, SourceStore, StoreError, StoreFuture};
use crate::data::{Expiry, Key, ScoredMember, SnapshotValue, ValueSnapshot, ValueType};
use crate::io::{ProductionTimeSource, TimeSource};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum StoredValue {
    String(Bytes),
    List(Vec<Bytes>),
    Set(BTreeSet<Bytes>),
    SortedSet(BTreeMap<Bytes, f64>),
    Hash(BTreeMap<Bytes, Bytes>),
    /// A type the migration engine does not copy (stream, module type, ...)
    Opaque(String),
}

impl StoredValue {
    fn value_type(&self) -> ValueType {
        match self {
            StoredValue::String(_) => ValueType::String,
            StoredValue::List(_) => ValueType::List,
            StoredValue::Set(_) => ValueType::Set,
            StoredValue::SortedSet(_) => ValueType::SortedSet,
            StoredValue::Hash(_) => ValueType::Hash,
            StoredValue::Opaque(name) => ValueType::Unsupported(name.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at_ms: Option<u64>,
}

/// Live cursor handles kept before the oldest are evicted
pub const DEFAULT_CURSOR_LIMIT: usize = 65_536;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<Key, Entry>,
    /// Cursor handle -> last key returned under it, oldest first
    cursors: BTreeMap<u64, Key>,
    /// Reverse of `cursors`
    cursor_of: HashMap<Key, u64>,
    cursor_limit: usize,
    next_cursor: u64,
}

impl MemoryState {
    /// Handle for a page ending at `last`, reusing an existing one
    fn cursor_after(&mut self, last: Key) -> ScanCursor {
        if let Some(handle) = self.cursor_of.get(&last) {
            return ScanCursor(*handle);
        }
        let handle = self.next_cursor;
        self.next_cursor += 1;
        self.cursor_of.insert(last.clone(), handle);
        self.cursors.insert(handle, last);
        while self.cursors.len() > self.cursor_limit.max(1) {
            if let Some((_, evicted)) = self.cursors.pop_first() {
                self.cursor_of.remove(&evicted);
            }
        }
        ScanCursor(handle)
    }
}

/// In-memory key-value store. Clones share the same data.
pub struct InMemoryStore<T: TimeSource = ProductionTimeSource> {
    state: Arc<RwLock<MemoryState>>,
    time: T,
}

impl InMemoryStore<ProductionTimeSource> {
    pub fn new() -> Self {
        Self::with_time_source(ProductionTimeSource::new())
    }
}

impl Default for InMemoryStore<ProductionTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> Clone for InMemoryStore<T> {
    fn clone(&self) -> Self {
        InMemoryStore {
            state: Arc::clone(&self.state),
            time: self.time.clone(),
        }
    }
}

impl<T: TimeSource> InMemoryStore<T> {
    pub fn with_time_source(time: T) -> Self {
        InMemoryStore {
            state: Arc::new(RwLock::new(MemoryState {
                next_cursor: 1,
                cursor_limit: DEFAULT_CURSOR_LIMIT,
                ..MemoryState::default()
            })),
            time,
        }
    }

    /// Keep at most `limit` cursor handles
    pub fn with_cursor_limit(self, limit: usize) -> Self {
        self.state.write().cursor_limit = limit;
        self
    }

    /// Cursor handles currently held
    pub fn open_cursors(&self) -> usize {
        self.state.read().cursors.len()
    }

    pub fn time_source(&self) -> &T {
        &self.time
    }

    fn is_live(entry: &Entry, now_ms: u64) -> bool {
        entry.expires_at_ms.map_or(true, |at| at > now_ms)
    }

    fn live_entry<R>(&self, key: &Key, f: impl FnOnce(&Entry) -> R) -> Option<R> {
        let now = self.time.now_millis();
        let state = self.state.read();
        state
            .entries
            .get(key)
            .filter(|e| Self::is_live(e, now))
            .map(f)
    }

    /// Apply `f` to the live entry for `key`, creating it with `init` if absent.
    fn upsert(
        &self,
        key: &Key,
        init: impl FnOnce() -> StoredValue,
        f: impl FnOnce(&mut StoredValue) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let now = self.time.now_millis();
        let mut state = self.state.write();
        let expired = state
            .entries
            .get(key)
            .map_or(false, |e| !Self::is_live(e, now));
        if expired {
            state.entries.remove(key);
        }
        let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry {
            value: init(),
            expires_at_ms: None,
        });
        f(&mut entry.value)
    }

    // ------------------------------------------------------------------
    // Direct manipulation (test setup, simulated concurrent writers)
    // ------------------------------------------------------------------

    pub fn set_string(&self, key: impl Into<Key>, value: impl Into<Bytes>) {
        self.insert(key.into(), StoredValue::String(value.into()), None);
    }

    pub fn set_string_with_ttl(&self, key: impl Into<Key>, value: impl Into<Bytes>, ttl: Duration) {
        let at = self.time.now_millis() + ttl.as_millis() as u64;
        self.insert(key.into(), StoredValue::String(value.into()), Some(at));
    }

    pub fn set_list<V: Into<Bytes>>(&self, key: impl Into<Key>, items: impl IntoIterator<Item = V>) {
        let list = items.into_iter().map(Into::into).collect();
        self.insert(key.into(), StoredValue::List(list), None);
    }

    pub fn set_set<V: Into<Bytes>>(&self, key: impl Into<Key>, members: impl IntoIterator<Item = V>) {
        let set = members.into_iter().map(Into::into).collect();
        self.insert(key.into(), StoredValue::Set(set), None);
    }

    pub fn set_sorted_set<V: Into<Bytes>>(
        &self,
        key: impl Into<Key>,
        members: impl IntoIterator<Item = (V, f64)>,
    ) {
        let zset = members.into_iter().map(|(m, s)| (m.into(), s)).collect();
        self.insert(key.into(), StoredValue::SortedSet(zset), None);
    }

    pub fn set_hash<F: Into<Bytes>, V: Into<Bytes>>(
        &self,
        key: impl Into<Key>,
        fields: impl IntoIterator<Item = (F, V)>,
    ) {
        let hash = fields.into_iter().map(|(f, v)| (f.into(), v.into())).collect();
        self.insert(key.into(), StoredValue::Hash(hash), None);
    }

    /// Insert a key of a type the engine does not support
    pub fn set_opaque(&self, key: impl Into<Key>, type_name: &str) {
        self.insert(key.into(), StoredValue::Opaque(type_name.to_string()), None);
    }

    /// Set an absolute expiry on an existing key. Returns false if absent.
    pub fn set_expiry(&self, key: &Key, ttl: Duration) -> bool {
        let now = self.time.now_millis();
        let mut state = self.state.write();
        match state.entries.get_mut(key) {
            Some(entry) if Self::is_live(entry, now) => {
                entry.expires_at_ms = Some(now + ttl.as_millis() as u64);
                true
            }
            _ => false,
        }
    }

    fn insert(&self, key: Key, value: StoredValue, expires_at_ms: Option<u64>) {
        self.state.write().entries.insert(
            key,
            Entry {
                value,
                expires_at_ms,
            },
        );
    }

    pub fn remove(&self, key: &Key) -> bool {
        self.state.write().entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.live_entry(key, |_| ()).is_some()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.time.now_millis();
        self.state
            .read()
            .entries
            .values()
            .filter(|e| Self::is_live(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys in order
    pub fn keys(&self) -> Vec<Key> {
        let now = self.time.now_millis();
        self.state
            .read()
            .entries
            .iter()
            .filter(|(_, e)| Self::is_live(e, now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn value_type(&self, key: &Key) -> Option<ValueType> {
        self.live_entry(key, |e| e.value.value_type())
    }

    /// Snapshot of a supported key with its absolute expiry; `None` for
    /// missing or unsupported keys.
    pub fn snapshot(&self, key: &Key) -> Option<ValueSnapshot> {
        self.live_entry(key, |entry| {
            let value = match &entry.value {
                StoredValue::String(v) => SnapshotValue::String(v.clone()),
                StoredValue::List(items) => SnapshotValue::List(items.clone()),
                StoredValue::Set(members) => SnapshotValue::Set(members.iter().cloned().collect()),
                StoredValue::SortedSet(zset) => SnapshotValue::SortedSet(sorted_members(zset)),
                StoredValue::Hash(fields) => SnapshotValue::Hash(
                    fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                ),
                StoredValue::Opaque(_) => return None,
            };
            let expiry = match entry.expires_at_ms {
                Some(unix_ms) => Expiry::At { unix_ms },
                None => Expiry::Persistent,
            };
            Some(ValueSnapshot::new(value, expiry))
        })
        .flatten()
    }

    /// Score of one sorted-set member
    pub fn sorted_set_score(&self, key: &Key, member: &[u8]) -> Option<f64> {
        self.live_entry(key, |e| match &e.value {
            StoredValue::SortedSet(zset) => zset.get(member).copied(),
            _ => None,
        })
        .flatten()
    }

    /// Remaining TTL; `None` for persistent or missing keys
    pub fn remaining_ttl(&self, key: &Key) -> Option<Duration> {
        let now = self.time.now_millis();
        self.live_entry(key, |e| e.expires_at_ms)
            .flatten()
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    fn read_with<R>(
        &self,
        key: &Key,
        f: impl FnOnce(&StoredValue) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.live_entry(key, |e| f(&e.value))
            .unwrap_or(Err(StoreError::NotFound))
    }
}

fn sorted_members(zset: &BTreeMap<Bytes, f64>) -> Vec<ScoredMember> {
    let mut members: Vec<ScoredMember> = zset
        .iter()
        .map(|(m, s)| ScoredMember::new(m.clone(), *s))
        .collect();
    members.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
    members
}

fn wrong_type(expected: &str, found: &StoredValue) -> StoreError {
    StoreError::WrongType(format!(
        "expected {}, found {}",
        expected,
        found.value_type()
    ))
}

fn matches_pattern(pattern: Option<&glob::Pattern>, key: &Key) -> bool {
    match pattern {
        None => true,
        Some(p) => p.matches(&String::from_utf8_lossy(key.as_bytes())),
    }
}

impl<T: TimeSource> SourceStore for InMemoryStore<T> {
    fn scan<'a>(
        &'a self,
        cursor: ScanCursor,
        count: usize,
        pattern: Option<&'a str>,
    ) -> StoreFuture<'a, ScanPage> {
        Box::pin(async move {
            let pattern = pattern
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| StoreError::Malformed(format!("invalid pattern: {}", e)))?;
            let now = self.time.now_millis();
            let mut state = self.state.write();

            let after = if cursor.is_start() {
                None
            } else {
                // Handles stay valid after use so a page can be re-fetched
                // on retry or on resume from a checkpointed cursor
                let last = state.cursors.get(&cursor.0).cloned().ok_or_else(|| {
                    StoreError::Malformed(format!("unknown cursor {}", cursor))
                })?;
                Some(last)
            };

            // Like SCAN, `count` bounds the entries examined, not the keys
            // returned, so a page can be empty under a selective pattern.
            let range = match &after {
                Some(last) => state
                    .entries
                    .range((std::ops::Bound::Excluded(last.clone()), std::ops::Bound::Unbounded)),
                None => state.entries.range::<Key, _>(..),
            };
            let mut examined = 0usize;
            let mut last_examined = None;
            let mut keys = Vec::new();
            let mut exhausted = true;
            for (key, entry) in range {
                if examined >= count.max(1) {
                    exhausted = false;
                    break;
                }
                examined += 1;
                last_examined = Some(key.clone());
                if Self::is_live(entry, now) && matches_pattern(pattern.as_ref(), key) {
                    keys.push(key.clone());
                }
            }

            let next = match (exhausted, last_examined) {
                (false, Some(last)) => state.cursor_after(last),
                _ => ScanCursor::START,
            };

            Ok(ScanPage { keys, next })
        })
    }

    fn type_of<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ValueType> {
        Box::pin(async move { self.read_with(key, |v| Ok(v.value_type())) })
    }

    fn read_string<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            self.read_with(key, |v| match v {
                StoredValue::String(s) => Ok(s.clone()),
                other => Err(wrong_type("string", other)),
            })
        })
    }

    fn read_list<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            self.read_with(key, |v| match v {
                StoredValue::List(items) => Ok(items.clone()),
                other => Err(wrong_type("list", other)),
            })
        })
    }

    fn read_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            self.read_with(key, |v| match v {
                StoredValue::Set(members) => Ok(members.iter().cloned().collect()),
                other => Err(wrong_type("set", other)),
            })
        })
    }

    fn read_sorted_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<ScoredMember>> {
        Box::pin(async move {
            self.read_with(key, |v| match v {
                StoredValue::SortedSet(zset) => Ok(sorted_members(zset)),
                other => Err(wrong_type("zset", other)),
            })
        })
    }

    fn read_hash<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<(Bytes, Bytes)>> {
        Box::pin(async move {
            self.read_with(key, |v| match v {
                StoredValue::Hash(fields) => Ok(fields
                    .iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()),
                other => Err(wrong_type("hash", other)),
            })
        })
    }

    fn ttl<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let now = self.time.now_millis();
            self.live_entry(key, |e| {
                e.expires_at_ms
                    .map(|at| Duration::from_millis(at.saturating_sub(now)))
            })
            .ok_or(StoreError::NotFound)
        })
    }
}

impl<T: TimeSource> DestinationStore for InMemoryStore<T> {
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at_ms = ttl.map(|t| self.time.now_millis() + t.as_millis() as u64);
            self.insert(key.clone(), StoredValue::String(value.clone()), expires_at_ms);
            Ok(())
        })
    }

    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.upsert(
                key,
                || StoredValue::List(Vec::new()),
                |v| match v {
                    StoredValue::List(items) => {
                        items.extend(values.iter().cloned());
                        Ok(())
                    }
                    other => Err(wrong_type("list", other)),
                },
            )
        })
    }

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.upsert(
                key,
                || StoredValue::Set(BTreeSet::new()),
                |v| match v {
                    StoredValue::Set(set) => {
                        set.extend(members.iter().cloned());
                        Ok(())
                    }
                    other => Err(wrong_type("set", other)),
                },
            )
        })
    }

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if let Some(bad) = members.iter().find(|m| m.score.is_nan()) {
                return Err(StoreError::Malformed(format!(
                    "score for member {:?} is not a number",
                    bad.member
                )));
            }
            self.upsert(
                key,
                || StoredValue::SortedSet(BTreeMap::new()),
                |v| match v {
                    StoredValue::SortedSet(zset) => {
                        for m in members {
                            zset.insert(m.member.clone(), m.score);
                        }
                        Ok(())
                    }
                    other => Err(wrong_type("zset", other)),
                },
            )
        })
    }

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.upsert(
                key,
                || StoredValue::Hash(BTreeMap::new()),
                |v| match v {
                    StoredValue::Hash(hash) => {
                        for (f, val) in fields {
                            hash.insert(f.clone(), val.clone());
                        }
                        Ok(())
                    }
                    other => Err(wrong_type("hash", other)),
                },
            )
        })
    }

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.set_expiry(key, ttl) {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedTimeSource;

    async fn scan_all(store: &InMemoryStore<impl TimeSource>, count: usize, pattern: Option<&str>) -> Vec<Key> {
        let mut cursor = ScanCursor::START;
        let mut keys = Vec::new();
        loop {
            let page = store.scan(cursor, count, pattern).await.unwrap();
            keys.extend(page.keys);
            if page.next.is_start() {
                break;
            }
            cursor = page.next;
        }
        keys
    }

    #[tokio::test]
    async fn test_scan_visits_every_key_once() {
        let store = InMemoryStore::new();
        for i in 0..25 {
            store.set_string(format!("key:{:02}", i), "v");
        }

        let keys = scan_all(&store, 7, None).await;
        assert_eq!(keys.len(), 25);
        let unique: BTreeSet<_> = keys.iter().cloned().collect();
        assert_eq!(unique.len(), 25);
    }

    #[tokio::test]
    async fn test_scan_pattern_filters_server_side() {
        let store = InMemoryStore::new();
        store.set_string("user:1", "a");
        store.set_string("user:2", "b");
        store.set_string("session:1", "c");

        let keys = scan_all(&store, 1, Some("user:*")).await;
        assert_eq!(keys, vec![Key::from("user:1"), Key::from("user:2")]);
    }

    #[tokio::test]
    async fn test_repeated_scans_reuse_cursor_handles() {
        let store = InMemoryStore::new();
        for i in 0..40 {
            store.set_string(format!("key:{:02}", i), "v");
        }

        scan_all(&store, 10, None).await;
        let after_first = store.open_cursors();
        assert_eq!(after_first, 3);
        for _ in 0..20 {
            scan_all(&store, 10, None).await;
        }
        assert_eq!(store.open_cursors(), after_first);

        // A handle handed out earlier still resumes after its key
        let first_page = store.scan(ScanCursor::START, 10, None).await.unwrap();
        let resumed = store.scan(first_page.next, 10, None).await.unwrap();
        assert_eq!(resumed.keys[0], Key::from("key:10"));
    }

    #[tokio::test]
    async fn test_cursor_handles_are_capped() {
        let store = InMemoryStore::new().with_cursor_limit(4);
        for i in 0..30 {
            store.set_string(format!("key:{:02}", i), "v");
        }

        let keys = scan_all(&store, 2, None).await;
        assert_eq!(keys.len(), 30);
        assert_eq!(store.open_cursors(), 4);

        // The oldest handle was evicted
        let evicted = store.scan(ScanCursor(1), 2, None).await.unwrap_err();
        assert!(matches!(evicted, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_scan_unknown_cursor_is_malformed() {
        let store = InMemoryStore::new();
        let err = store.scan(ScanCursor(999), 10, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_ttl_and_lazy_expiry() {
        let clock = SimulatedTimeSource::new(10_000);
        let store = InMemoryStore::with_time_source(clock.clone());
        store.set_string_with_ttl("temp", "x", Duration::from_secs(5));
        store.set_string("perm", "y");

        let key = Key::from("temp");
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(5)));
        assert_eq!(store.ttl(&Key::from("perm")).await.unwrap(), None);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.ttl(&key).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(store.type_of(&key).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_reads_in_score_order() {
        let store = InMemoryStore::new();
        store.set_sorted_set("board", [("carol", 3.0), ("alice", 1.0), ("bob", 2.0)]);

        let members = store.read_sorted_set(&Key::from("board")).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.member.clone()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_wrong_type_on_mismatched_read() {
        let store = InMemoryStore::new();
        store.set_list("jobs", ["a", "b"]);

        let err = store.read_hash(&Key::from("jobs")).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }

    #[tokio::test]
    async fn test_append_list_preserves_order() {
        let store = InMemoryStore::new();
        let key = Key::from("queue");
        let first = [Bytes::from_static(b"1"), Bytes::from_static(b"2")];
        let second = [Bytes::from_static(b"3")];
        store.append_list(&key, &first).await.unwrap();
        store.append_list(&key, &second).await.unwrap();

        assert_eq!(
            store.read_list(&key).await.unwrap(),
            vec![Bytes::from_static(b"1"), Bytes::from_static(b"2"), Bytes::from_static(b"3")]
        );
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let store = InMemoryStore::new();
        let err = store
            .expire(&Key::from("nope"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }
}
