//! Fault identifiers
//!
//! Every injection site names its fault so statistics and per-fault
//! probabilities can be configured and reported independently.

/// Faults injected by `SimulatedStore` on the source side
pub mod source {
    pub const SCAN_FAIL: &str = "source.scan_fail";
    pub const TYPE_FAIL: &str = "source.type_fail";
    pub const READ_FAIL: &str = "source.read_fail";
    pub const TTL_FAIL: &str = "source.ttl_fail";
    /// Key deleted by a concurrent writer just before it is read
    pub const KEY_VANISH: &str = "source.key_vanish";
    /// Key replaced by a value of a different type just before it is read
    pub const TYPE_CHANGE: &str = "source.type_change";
}

/// Faults injected by `SimulatedStore` on the destination side
pub mod destination {
    pub const WRITE_FAIL: &str = "destination.write_fail";
    pub const EXPIRE_FAIL: &str = "destination.expire_fail";
    pub const DELETE_FAIL: &str = "destination.delete_fail";
}

/// Faults common to every store operation
pub mod store {
    pub const TIMEOUT: &str = "store.timeout";
}

/// All known fault ids
pub const ALL_FAULTS: &[&str] = &[
    source::SCAN_FAIL,
    source::TYPE_FAIL,
    source::READ_FAIL,
    source::TTL_FAIL,
    source::KEY_VANISH,
    source::TYPE_CHANGE,
    destination::WRITE_FAIL,
    destination::EXPIRE_FAIL,
    destination::DELETE_FAIL,
    store::TIMEOUT,
];
