//! Type Transcoder
//!
//! Reads one key from a source into a `ValueSnapshot` and reproduces it on
//! a destination. Every container is read and written in bulk: one round
//! trip per key on each side, regardless of element count.
//!
//! | Type      | Read                   | Write                                  |
//! |-----------|------------------------|----------------------------------------|
//! | String    | payload                | SET, with the TTL applied atomically   |
//! | List      | whole list, in order   | RPUSH all elements                     |
//! | Set       | all members            | SADD all members                       |
//! | SortedSet | (member, score) pairs  | ZADD all pairs                         |
//! | Hash      | all field/value pairs  | HSET all fields                        |
//!
//! TTLs are anchored to an absolute deadline when read and converted back
//! to the *remaining* time when written, so time spent in the queue is not
//! added to the destination's expiry.

use super::error::MigrationError;
use crate::data::{Expiry, Key, SnapshotValue, ValueSnapshot, ValueType};
use crate::io::{ProductionTimeSource, TimeSource};
use crate::store::{DestinationStore, SourceStore};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TypeTranscoder<T: TimeSource = ProductionTimeSource> {
    time: T,
    replace_existing: bool,
}

impl TypeTranscoder<ProductionTimeSource> {
    pub fn new() -> Self {
        Self::with_time_source(ProductionTimeSource)
    }
}

impl Default for TypeTranscoder<ProductionTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> TypeTranscoder<T> {
    pub fn with_time_source(time: T) -> Self {
        TypeTranscoder {
            time,
            replace_existing: true,
        }
    }

    /// Delete the destination key before writing a container, so the copy
    /// replaces rather than merges and a retried write doesn't duplicate
    /// list elements.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// Classify a key; unsupported types are an error so the caller skips them
    pub async fn classify<S: SourceStore>(
        &self,
        source: &S,
        key: &Key,
    ) -> Result<ValueType, MigrationError> {
        match source.type_of(key).await? {
            ValueType::Unsupported(name) => Err(MigrationError::UnsupportedType(name)),
            supported => Ok(supported),
        }
    }

    /// Snapshot a key's value and expiry
    pub async fn read<S: SourceStore>(
        &self,
        source: &S,
        key: &Key,
    ) -> Result<ValueSnapshot, MigrationError> {
        let value_type = self.classify(source, key).await?;

        let value = match value_type {
            ValueType::String => SnapshotValue::String(source.read_string(key).await?),
            ValueType::List => SnapshotValue::List(source.read_list(key).await?),
            ValueType::Set => SnapshotValue::Set(source.read_set(key).await?),
            ValueType::SortedSet => {
                let members = source.read_sorted_set(key).await?;
                if let Some(bad) = members.iter().find(|m| m.score.is_nan()) {
                    return Err(MigrationError::MalformedData(format!(
                        "sorted set member {:?} has a NaN score",
                        String::from_utf8_lossy(&bad.member)
                    )));
                }
                SnapshotValue::SortedSet(members)
            }
            ValueType::Hash => SnapshotValue::Hash(source.read_hash(key).await?),
            ValueType::Unsupported(name) => return Err(MigrationError::UnsupportedType(name)),
        };

        let ttl = source.ttl(key).await?;
        let now = self.time.now_millis();
        let expiry = match ttl {
            None => Expiry::Persistent,
            Some(ttl) => Expiry::After(ttl).anchored(now),
        };

        let snapshot = ValueSnapshot::new(value, expiry);
        // Stores never hold empty containers; an empty read means the key
        // was deleted between TYPE and the read.
        if !matches!(snapshot.value, SnapshotValue::String(_)) && snapshot.element_count() == 0 {
            return Err(MigrationError::NotFound);
        }
        if snapshot.expiry.has_lapsed(now) {
            return Err(MigrationError::NotFound);
        }
        Ok(snapshot)
    }

    /// Reproduce a snapshot on the destination
    pub async fn write<D: DestinationStore>(
        &self,
        destination: &D,
        key: &Key,
        snapshot: &ValueSnapshot,
    ) -> Result<(), MigrationError> {
        let ttl = snapshot.expiry.remaining(self.time.now_millis());
        if matches!(ttl, Some(d) if d.is_zero()) {
            // Expired while queued: the source no longer has it either
            return Err(MigrationError::NotFound);
        }

        if let SnapshotValue::String(value) = &snapshot.value {
            return destination
                .write_string(key, value, ttl)
                .await
                .map_err(MigrationError::from_destination);
        }

        if self.replace_existing {
            destination
                .delete(key)
                .await
                .map_err(MigrationError::from_destination)?;
        }

        let written = match &snapshot.value {
            SnapshotValue::List(items) => destination.append_list(key, items).await,
            SnapshotValue::Set(members) => destination.add_set_members(key, members).await,
            SnapshotValue::SortedSet(members) => {
                destination.add_sorted_set_members(key, members).await
            }
            SnapshotValue::Hash(fields) => destination.set_hash_fields(key, fields).await,
            SnapshotValue::String(_) => Ok(()),
        };
        written.map_err(MigrationError::from_destination)?;

        if let Some(ttl) = ttl {
            destination
                .expire(key, ttl)
                .await
                .map_err(MigrationError::from_destination)?;
        }
        Ok(())
    }

    /// Read from `source` and write to `destination`; returns the copied type
    pub async fn copy<S: SourceStore, D: DestinationStore>(
        &self,
        source: &S,
        destination: &D,
        key: &Key,
    ) -> Result<ValueType, MigrationError> {
        let snapshot = self.read(source, key).await?;
        let value_type = snapshot.value_type();
        debug!(key = %key, value_type = %value_type, "Copying key");
        self.write(destination, key, &snapshot).await?;
        debug!(key = %key, "Copied key");
        Ok(value_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ScoredMember;
    use crate::io::SimulatedTimeSource;
    use crate::store::InMemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn setup() -> (
        InMemoryStore<SimulatedTimeSource>,
        InMemoryStore<SimulatedTimeSource>,
        TypeTranscoder<SimulatedTimeSource>,
        SimulatedTimeSource,
    ) {
        let time = SimulatedTimeSource::new(1_000_000);
        (
            InMemoryStore::with_time_source(time.clone()),
            InMemoryStore::with_time_source(time.clone()),
            TypeTranscoder::with_time_source(time.clone()),
            time,
        )
    }

    #[tokio::test]
    async fn test_copies_every_supported_type() {
        let (src, dst, transcoder, _) = setup();
        src.set_string("s", "hello");
        src.set_list("l", ["c", "a", "b"]);
        src.set_set("set", ["x", "y"]);
        src.set_sorted_set("z", [("a", 1.0), ("b", 2.0)]);
        src.set_hash("h", [("f1", "v1"), ("f2", "v2")]);

        for key in ["s", "l", "set", "z", "h"] {
            let key = Key::from(key);
            transcoder.copy(&src, &dst, &key).await.unwrap();
            assert_eq!(dst.snapshot(&key), src.snapshot(&key), "key {}", key);
        }
    }

    #[tokio::test]
    async fn test_sorted_set_scores_stay_with_members() {
        let (src, dst, transcoder, _) = setup();
        src.set_sorted_set("z", [("a", 1.0), ("b", 2.0)]);

        transcoder.copy(&src, &dst, &Key::from("z")).await.unwrap();

        assert_eq!(dst.sorted_set_score(&Key::from("z"), b"a"), Some(1.0));
        assert_eq!(dst.sorted_set_score(&Key::from("z"), b"b"), Some(2.0));
    }

    #[tokio::test]
    async fn test_ttl_is_remaining_time_at_write() {
        let (src, dst, transcoder, time) = setup();
        src.set_string_with_ttl("s", "v", Duration::from_secs(60));
        src.set_list("l", ["a"]);
        src.set_expiry(&Key::from("l"), Duration::from_secs(60));

        let s = transcoder.read(&src, &Key::from("s")).await.unwrap();
        let l = transcoder.read(&src, &Key::from("l")).await.unwrap();
        time.advance(Duration::from_secs(10));
        transcoder.write(&dst, &Key::from("s"), &s).await.unwrap();
        transcoder.write(&dst, &Key::from("l"), &l).await.unwrap();

        assert_eq!(dst.remaining_ttl(&Key::from("s")), Some(Duration::from_secs(50)));
        assert_eq!(dst.remaining_ttl(&Key::from("l")), Some(Duration::from_secs(50)));
    }

    #[tokio::test]
    async fn test_persistent_key_written_without_ttl() {
        let (src, dst, transcoder, _) = setup();
        src.set_hash("h", [("f", "v")]);
        transcoder.copy(&src, &dst, &Key::from("h")).await.unwrap();
        assert_eq!(dst.remaining_ttl(&Key::from("h")), None);
        assert!(dst.contains(&Key::from("h")));
    }

    #[tokio::test]
    async fn test_expired_while_queued_is_not_found() {
        let (src, dst, transcoder, time) = setup();
        src.set_string_with_ttl("s", "v", Duration::from_millis(500));
        let snapshot = transcoder.read(&src, &Key::from("s")).await.unwrap();
        time.advance(Duration::from_secs(1));

        let err = transcoder.write(&dst, &Key::from("s"), &snapshot).await.unwrap_err();
        assert_eq!(err, MigrationError::NotFound);
        assert!(!dst.contains(&Key::from("s")));
    }

    #[tokio::test]
    async fn test_missing_and_unsupported_keys() {
        let (src, dst, transcoder, _) = setup();
        src.set_opaque("stream", "stream");

        assert_eq!(
            transcoder.copy(&src, &dst, &Key::from("gone")).await,
            Err(MigrationError::NotFound)
        );
        assert_eq!(
            transcoder.copy(&src, &dst, &Key::from("stream")).await,
            Err(MigrationError::UnsupportedType("stream".into()))
        );
    }

    #[tokio::test]
    async fn test_replace_existing_prevents_duplicate_elements() {
        let (src, dst, transcoder, _) = setup();
        src.set_list("l", ["a", "b"]);
        let key = Key::from("l");

        transcoder.copy(&src, &dst, &key).await.unwrap();
        transcoder.copy(&src, &dst, &key).await.unwrap();
        assert_eq!(dst.snapshot(&key), src.snapshot(&key));

        let merging = transcoder.clone().replace_existing(false);
        merging.copy(&src, &dst, &key).await.unwrap();
        match dst.snapshot(&key).map(|s| s.value) {
            Some(SnapshotValue::List(items)) => assert_eq!(items.len(), 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_string_overwrite_on_destination() {
        let (src, dst, transcoder, _) = setup();
        src.set_string("k", "new");
        dst.set_list("k", ["old"]);

        transcoder.copy(&src, &dst, &Key::from("k")).await.unwrap();
        assert_eq!(
            dst.snapshot(&Key::from("k")).map(|s| s.value),
            Some(SnapshotValue::String(Bytes::from("new")))
        );
    }

    #[tokio::test]
    async fn test_nan_score_is_malformed() {
        let (src, _dst, transcoder, _) = setup();
        let snapshot = ValueSnapshot::persistent(SnapshotValue::SortedSet(vec![ScoredMember::new(
            "m",
            f64::NAN,
        )]));
        // The in-memory store refuses NaN writes, so check the write side
        let err = transcoder
            .write(&src, &Key::from("z"), &snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MalformedData(_)));
    }
}
