//! Migration data model
//!
//! - `Key`: opaque, binary-safe key
//! - `ValueType`: closed set of container types the engine knows how to copy
//! - `ValueSnapshot`: a value as read from the source, plus its expiry
//! - `ScoredMember`: one sorted-set entry
//! - `Expiry`: persistent, relative, or absolute expiration

mod expiry;
mod key;
mod value;

pub use expiry::Expiry;
pub use key::Key;
pub use value::{ScoredMember, SnapshotValue, ValueSnapshot, ValueType};
