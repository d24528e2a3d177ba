//! Key expiration

use std::time::Duration;

/// Expiration attached to a value snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// No expiration
    #[default]
    Persistent,
    /// Expires this long after the instant the TTL was observed
    After(Duration),
    /// Expires at an absolute Unix time in milliseconds
    At { unix_ms: u64 },
}

impl Expiry {
    /// Anchor a relative TTL observed at `now_ms` to an absolute deadline.
    pub fn anchored(self, now_ms: u64) -> Expiry {
        match self {
            Expiry::After(ttl) => Expiry::At {
                unix_ms: now_ms.saturating_add(ttl.as_millis() as u64),
            },
            other => other,
        }
    }

    /// Remaining time to live at `now_ms`.
    ///
    /// `None` for persistent keys; `Some(Duration::ZERO)` once the deadline passed.
    pub fn remaining(&self, now_ms: u64) -> Option<Duration> {
        match *self {
            Expiry::Persistent => None,
            Expiry::After(ttl) => Some(ttl),
            Expiry::At { unix_ms } => Some(Duration::from_millis(unix_ms.saturating_sub(now_ms))),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Expiry::Persistent)
    }

    /// True when the key would already have expired at `now_ms`
    pub fn has_lapsed(&self, now_ms: u64) -> bool {
        matches!(self.remaining(now_ms), Some(d) if d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchored_relative_becomes_absolute() {
        let expiry = Expiry::After(Duration::from_secs(10)).anchored(1_000);
        assert_eq!(expiry, Expiry::At { unix_ms: 11_000 });
        assert_eq!(expiry.remaining(4_000), Some(Duration::from_millis(7_000)));
    }

    #[test]
    fn test_lapsed() {
        let expiry = Expiry::At { unix_ms: 500 };
        assert!(expiry.has_lapsed(500));
        assert!(expiry.has_lapsed(900));
        assert!(!expiry.has_lapsed(499));
        assert!(!Expiry::Persistent.has_lapsed(u64::MAX));
    }
}
