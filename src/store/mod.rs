//! Store Capability Abstraction
//!
//! The migration engine never speaks a wire protocol itself. It talks to a
//! source through `SourceStore` and to a destination through
//! `DestinationStore`, following the boxed-future trait pattern used for
//! every I/O seam in this crate so that production and simulated stores are
//! interchangeable.
//!
//! Implementations:
//! - `InMemoryStore`: for unit tests and DST
//! - `SimulatedStore`: `InMemoryStore` wrapped with deterministic fault injection
//! - `RedisStore`: Redis / Valkey via redis-rs (feature `redis-backend`)
//!
//! Both traits take `&self`; implementations must tolerate concurrent calls
//! from every worker (connection pooling is the implementation's concern).

pub mod memory;
pub mod simulated;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::InMemoryStore;
pub use simulated::{SimulatedStore, SimulatedStoreConfig, SimulatedStoreStats};
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStore;

use crate::data::{Key, ScoredMember, ValueType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Network failure, timeout, or busy store; retrying may succeed
    #[error("transient store error: {0}")]
    Transient(String),
    /// The key does not exist (or expired)
    #[error("key not found")]
    NotFound,
    /// The key holds a different type than the operation expects
    #[error("wrong type: {0}")]
    WrongType(String),
    /// The store returned data that cannot be interpreted
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Position in a cursor-based keyspace iteration.
///
/// `START` both begins an iteration and, when returned by the store,
/// signals that the iteration is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanCursor(pub u64);

impl ScanCursor {
    pub const START: ScanCursor = ScanCursor(0);

    pub fn is_start(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of a keyspace iteration
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    /// Keys in this page; may be empty even when the iteration continues
    pub keys: Vec<Key>,
    /// Cursor for the next page; `ScanCursor::START` when iteration is complete
    pub next: ScanCursor,
}

impl ScanPage {
    pub fn is_last(&self) -> bool {
        self.next.is_start()
    }
}

/// Read side of a migration
pub trait SourceStore: Send + Sync + 'static {
    /// Fetch the next page of keys. `count` is a hint, `pattern` an optional
    /// glob the store may apply server-side.
    fn scan<'a>(
        &'a self,
        cursor: ScanCursor,
        count: usize,
        pattern: Option<&'a str>,
    ) -> StoreFuture<'a, ScanPage>;

    /// Container type of a key; `StoreError::NotFound` if it does not exist
    fn type_of<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ValueType>;

    fn read_string<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Bytes>;

    /// Whole list, in order, in one round trip
    fn read_list<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>>;

    fn read_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>>;

    /// All entries in ascending score order
    fn read_sorted_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<ScoredMember>>;

    fn read_hash<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<(Bytes, Bytes)>>;

    /// Remaining time to live; `None` when the key has no expiration
    fn ttl<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Option<Duration>>;
}

/// Write side of a migration
pub trait DestinationStore: Send + Sync + 'static {
    /// Set a string; a TTL is applied atomically with the write
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()>;

    /// Append all values to the tail, preserving order
    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()>;

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()>;

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()>;

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()>;

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Remove a key; succeeds when the key is already absent
    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()>;
}

impl<S: SourceStore> SourceStore for Arc<S> {
    fn scan<'a>(
        &'a self,
        cursor: ScanCursor,
        count: usize,
        pattern: Option<&'a str>,
    ) -> StoreFuture<'a, ScanPage> {
        (**self).scan(cursor, count, pattern)
    }

    fn type_of<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ValueType> {
        (**self).type_of(key)
    }

    fn read_string<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Bytes> {
        (**self).read_string(key)
    }

    fn read_list<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        (**self).read_list(key)
    }

    fn read_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        (**self).read_set(key)
    }

    fn read_sorted_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<ScoredMember>> {
        (**self).read_sorted_set(key)
    }

    fn read_hash<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<(Bytes, Bytes)>> {
        (**self).read_hash(key)
    }

    fn ttl<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Option<Duration>> {
        (**self).ttl(key)
    }
}

impl<D: DestinationStore> DestinationStore for Arc<D> {
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        (**self).write_string(key, value, ttl)
    }

    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
        (**self).append_list(key, values)
    }

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
        (**self).add_set_members(key, members)
    }

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()> {
        (**self).add_sorted_set_members(key, members)
    }

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()> {
        (**self).set_hash_fields(key, fields)
    }

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
        (**self).expire(key, ttl)
    }

    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
        (**self).delete(key)
    }
}
