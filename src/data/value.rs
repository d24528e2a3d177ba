//! Value types and snapshots

use super::Expiry;
use bytes::Bytes;
use std::fmt;

/// Container type of a key, as reported by the source store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    String,
    List,
    Set,
    SortedSet,
    Hash,
    /// Anything else (streams, modules, ...), carrying the store's type name
    Unsupported(String),
}

impl ValueType {
    /// Parse a Redis `TYPE` reply
    pub fn from_type_name(name: &str) -> ValueType {
        match name {
            "string" => ValueType::String,
            "list" => ValueType::List,
            "set" => ValueType::Set,
            "zset" => ValueType::SortedSet,
            "hash" => ValueType::Hash,
            other => ValueType::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Set => "set",
            ValueType::SortedSet => "zset",
            ValueType::Hash => "hash",
            ValueType::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ValueType::Unsupported(_))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One sorted-set entry.
///
/// Named fields instead of a `(a, b)` tuple: member and score can't be
/// transposed by accident on the way from reader to writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: Bytes,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<Bytes>, score: f64) -> Self {
        ScoredMember {
            member: member.into(),
            score,
        }
    }
}

/// Materialized value of a key
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    String(Bytes),
    /// Elements in list order
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    /// Entries in ascending score order
    SortedSet(Vec<ScoredMember>),
    /// Field/value pairs
    Hash(Vec<(Bytes, Bytes)>),
}

/// A key's value and expiration at the instant it was read
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSnapshot {
    pub value: SnapshotValue,
    pub expiry: Expiry,
}

impl ValueSnapshot {
    pub fn new(value: SnapshotValue, expiry: Expiry) -> Self {
        ValueSnapshot { value, expiry }
    }

    pub fn persistent(value: SnapshotValue) -> Self {
        ValueSnapshot {
            value,
            expiry: Expiry::Persistent,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self.value {
            SnapshotValue::String(_) => ValueType::String,
            SnapshotValue::List(_) => ValueType::List,
            SnapshotValue::Set(_) => ValueType::Set,
            SnapshotValue::SortedSet(_) => ValueType::SortedSet,
            SnapshotValue::Hash(_) => ValueType::Hash,
        }
    }

    /// Number of elements (1 for strings)
    pub fn element_count(&self) -> usize {
        match &self.value {
            SnapshotValue::String(_) => 1,
            SnapshotValue::List(items) | SnapshotValue::Set(items) => items.len(),
            SnapshotValue::SortedSet(members) => members.len(),
            SnapshotValue::Hash(fields) => fields.len(),
        }
    }

    /// Approximate payload size in bytes
    pub fn size_bytes(&self) -> usize {
        match &self.value {
            SnapshotValue::String(v) => v.len(),
            SnapshotValue::List(items) | SnapshotValue::Set(items) => {
                items.iter().map(|i| i.len()).sum()
            }
            SnapshotValue::SortedSet(members) => {
                members.iter().map(|m| m.member.len() + 8).sum()
            }
            SnapshotValue::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len()).sum(),
        }
    }
}
