//! Simulated randomness and time for deterministic simulation testing
//!
//! Same seed, same run: every random decision in a simulated migration
//! (fault injection, jitter, workload shape) flows from a `SimulatedRng`,
//! and time only moves when the harness advances it.

use super::{Rng, TimeSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Simulated RNG - deterministic based on seed
pub struct SimulatedRng {
    inner: rand_chacha::ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        use rand::SeedableRng;
        SimulatedRng {
            inner: rand_chacha::ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Rng for SimulatedRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    fn fork(&mut self) -> Self {
        SimulatedRng::new(self.next_u64())
    }
}

/// Virtual clock shared between clones.
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Debug, Clone)]
pub struct SimulatedTimeSource {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedTimeSource {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedTimeSource {
    pub fn new(start_ms: u64) -> Self {
        SimulatedTimeSource {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Move to an absolute time. Never goes backwards.
    pub fn set(&self, time_ms: u64) {
        self.time_ms.fetch_max(time_ms, Ordering::SeqCst);
    }
}

impl TimeSource for SimulatedTimeSource {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}
