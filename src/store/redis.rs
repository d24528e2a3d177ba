//! Redis / Valkey store via redis-rs
//!
//! One multiplexed connection per store, cloned per operation; redis-rs
//! pipelines concurrent requests from all workers over it.

use super::{DestinationStore, ScanCursor, ScanPage, SourceStore, StoreError, StoreFuture};
use crate::data::{Key, ScoredMember, ValueType};
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, RedisError};
use std::time::Duration;
use tracing::info;

/// Redis-backed source and destination
#[derive(Clone)]
pub struct RedisStore {
    url: String,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

impl RedisStore {
    /// Connect to `redis://host:port/db`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_error)?;
        info!(url = %url, "Connected to Redis");
        Ok(RedisStore {
            url: url.to_string(),
            conn,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        cmd.query_async::<T>(&mut conn).await.map_err(map_error)
    }
}

/// Server error codes that clear up on their own
const RETRYABLE_CODES: &[&str] = &["BUSY", "LOADING", "TRYAGAIN", "MASTERDOWN", "CLUSTERDOWN"];

fn map_error(e: RedisError) -> StoreError {
    let connection_failure =
        e.is_timeout() || e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal();
    classify(e.code(), connection_failure, e.to_string())
}

/// Map a redis error onto `StoreError`. Only connection trouble and the
/// retryable server codes are transient; a reply that fails to convert, or
/// any other server error, will fail the same way on every attempt.
fn classify(code: Option<&str>, connection_failure: bool, message: String) -> StoreError {
    if connection_failure {
        return StoreError::Transient(message);
    }
    match code {
        Some("WRONGTYPE") => StoreError::WrongType(message),
        Some(code) if RETRYABLE_CODES.contains(&code) => StoreError::Transient(message),
        _ => StoreError::Malformed(message),
    }
}

/// Container reads of a missing key return an empty reply; Redis never
/// stores an empty container, so empty means the key is gone.
fn non_empty<T>(items: Vec<T>) -> Result<Vec<T>, StoreError> {
    if items.is_empty() {
        Err(StoreError::NotFound)
    } else {
        Ok(items)
    }
}

/// Format a score the way Redis parses it, including infinities
pub(crate) fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// ZADD arguments after the key: `score member [score member ...]`
pub(crate) fn zadd_arguments(members: &[ScoredMember]) -> Vec<Vec<u8>> {
    let mut args = Vec::with_capacity(members.len() * 2);
    for m in members {
        args.push(format_score(m.score).into_bytes());
        args.push(m.member.to_vec());
    }
    args
}

fn byte_vecs(values: Vec<Vec<u8>>) -> Vec<Bytes> {
    values.into_iter().map(Bytes::from).collect()
}

impl SourceStore for RedisStore {
    fn scan<'a>(
        &'a self,
        cursor: ScanCursor,
        count: usize,
        pattern: Option<&'a str>,
    ) -> StoreFuture<'a, ScanPage> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor.0);
            if let Some(p) = pattern {
                cmd.arg("MATCH").arg(p);
            }
            cmd.arg("COUNT").arg(count);
            let (next, keys): (u64, Vec<Vec<u8>>) = self.query(&cmd).await?;
            Ok(ScanPage {
                keys: keys.into_iter().map(Key::from).collect(),
                next: ScanCursor(next),
            })
        })
    }

    fn type_of<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ValueType> {
        Box::pin(async move {
            let name: String = self.query(redis::cmd("TYPE").arg(key.as_bytes())).await?;
            if name == "none" {
                return Err(StoreError::NotFound);
            }
            Ok(ValueType::from_type_name(&name))
        })
    }

    fn read_string<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let value: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(key.as_bytes())).await?;
            value.map(Bytes::from).ok_or(StoreError::NotFound)
        })
    }

    fn read_list<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            let items: Vec<Vec<u8>> = self
                .query(redis::cmd("LRANGE").arg(key.as_bytes()).arg(0).arg(-1))
                .await?;
            non_empty(byte_vecs(items))
        })
    }

    fn read_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<Bytes>> {
        Box::pin(async move {
            let members: Vec<Vec<u8>> = self.query(redis::cmd("SMEMBERS").arg(key.as_bytes())).await?;
            non_empty(byte_vecs(members))
        })
    }

    fn read_sorted_set<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<ScoredMember>> {
        Box::pin(async move {
            // WITHSCORES replies member first, then score
            let pairs: Vec<(Vec<u8>, f64)> = self
                .query(
                    redis::cmd("ZRANGE")
                        .arg(key.as_bytes())
                        .arg(0)
                        .arg(-1)
                        .arg("WITHSCORES"),
                )
                .await?;
            non_empty(
                pairs
                    .into_iter()
                    .map(|(member, score)| ScoredMember::new(member, score))
                    .collect(),
            )
        })
    }

    fn read_hash<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Vec<(Bytes, Bytes)>> {
        Box::pin(async move {
            let fields: Vec<(Vec<u8>, Vec<u8>)> =
                self.query(redis::cmd("HGETALL").arg(key.as_bytes())).await?;
            non_empty(
                fields
                    .into_iter()
                    .map(|(f, v)| (Bytes::from(f), Bytes::from(v)))
                    .collect(),
            )
        })
    }

    fn ttl<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let pttl: i64 = self.query(redis::cmd("PTTL").arg(key.as_bytes())).await?;
            match pttl {
                -2 => Err(StoreError::NotFound),
                -1 => Ok(None),
                ms if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
                other => Err(StoreError::Malformed(format!("unexpected PTTL reply {}", other))),
            }
        })
    }
}

impl DestinationStore for RedisStore {
    fn write_string<'a>(
        &'a self,
        key: &'a Key,
        value: &'a Bytes,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key.as_bytes()).arg(value.as_ref());
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            self.query::<()>(&cmd).await
        })
    }

    fn append_list<'a>(&'a self, key: &'a Key, values: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if values.is_empty() {
                return Ok(());
            }
            let mut cmd = redis::cmd("RPUSH");
            cmd.arg(key.as_bytes());
            for v in values {
                cmd.arg(v.as_ref());
            }
            self.query::<()>(&cmd).await
        })
    }

    fn add_set_members<'a>(&'a self, key: &'a Key, members: &'a [Bytes]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if members.is_empty() {
                return Ok(());
            }
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key.as_bytes());
            for m in members {
                cmd.arg(m.as_ref());
            }
            self.query::<()>(&cmd).await
        })
    }

    fn add_sorted_set_members<'a>(
        &'a self,
        key: &'a Key,
        members: &'a [ScoredMember],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if members.is_empty() {
                return Ok(());
            }
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key.as_bytes());
            for arg in zadd_arguments(members) {
                cmd.arg(arg);
            }
            self.query::<()>(&cmd).await
        })
    }

    fn set_hash_fields<'a>(
        &'a self,
        key: &'a Key,
        fields: &'a [(Bytes, Bytes)],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if fields.is_empty() {
                return Ok(());
            }
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key.as_bytes());
            for (f, v) in fields {
                cmd.arg(f.as_ref()).arg(v.as_ref());
            }
            self.query::<()>(&cmd).await
        })
    }

    fn expire<'a>(&'a self, key: &'a Key, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let applied: i64 = self
                .query(
                    redis::cmd("PEXPIRE")
                        .arg(key.as_bytes())
                        .arg(ttl.as_millis().max(1) as u64),
                )
                .await?;
            if applied == 1 {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a Key) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.query::<()>(redis::cmd("DEL").arg(key.as_bytes())).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zadd_arguments_put_score_before_member() {
        let members = vec![ScoredMember::new("a", 1.0), ScoredMember::new("b", 2.5)];
        let args = zadd_arguments(&members);
        assert_eq!(
            args,
            vec![
                b"1".to_vec(),
                b"a".to_vec(),
                b"2.5".to_vec(),
                b"b".to_vec(),
            ]
        );
    }

    #[test]
    fn test_format_score_infinities() {
        assert_eq!(format_score(f64::INFINITY), "+inf");
        assert_eq!(format_score(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_score(-0.5), "-0.5");
    }

    #[test]
    fn test_only_connection_and_retryable_errors_are_transient() {
        let msg = || "boom".to_string();

        assert!(matches!(classify(None, true, msg()), StoreError::Transient(_)));
        assert!(matches!(classify(Some("ERR"), true, msg()), StoreError::Transient(_)));
        for code in ["BUSY", "LOADING", "TRYAGAIN", "MASTERDOWN"] {
            assert!(
                matches!(classify(Some(code), false, msg()), StoreError::Transient(_)),
                "{}",
                code
            );
        }

        assert!(matches!(
            classify(Some("WRONGTYPE"), false, msg()),
            StoreError::WrongType(_)
        ));
        // Reply conversion failures carry no server code
        assert!(matches!(classify(None, false, msg()), StoreError::Malformed(_)));
        assert!(matches!(
            classify(Some("ERR"), false, msg()),
            StoreError::Malformed(_)
        ));
        assert!(matches!(
            classify(Some("NOPERM"), false, msg()),
            StoreError::Malformed(_)
        ));
    }

    #[test]
    fn test_non_empty_maps_empty_to_not_found() {
        assert_eq!(non_empty::<u8>(vec![]).unwrap_err(), StoreError::NotFound);
        assert_eq!(non_empty(vec![1]).unwrap(), vec![1]);
    }
}
