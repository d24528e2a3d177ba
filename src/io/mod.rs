//! I/O Abstractions for Deterministic Simulation Testing
//!
//! Randomness and wall-clock time are the two sources of nondeterminism in a
//! migration run outside the stores themselves. Both go through these traits
//! so the simulation harness can replay a run exactly from a seed.
//!
//! - `Rng`: retry jitter, fault injection, workload generation
//! - `TimeSource`: checkpoint timestamps, expiry bookkeeping in the in-memory store

pub mod simulation;

pub use simulation::{SimulatedRng, SimulatedTimeSource};

/// Random number source
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Independent generator derived from this one
    fn fork(&mut self) -> Self
    where
        Self: Sized;
}

/// Source of wall-clock milliseconds since the Unix epoch
pub trait TimeSource: Send + Sync + Clone + 'static {
    fn now_millis(&self) -> u64;
}

/// Production implementations backed by the OS
pub mod production {
    use super::{Rng, TimeSource};

    /// Entropy-seeded RNG
    #[derive(Debug)]
    pub struct ProductionRng {
        inner: rand::rngs::StdRng,
    }

    impl ProductionRng {
        pub fn new() -> Self {
            use rand::SeedableRng;
            ProductionRng {
                inner: rand::rngs::StdRng::from_entropy(),
            }
        }
    }

    impl Default for ProductionRng {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Rng for ProductionRng {
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
            ProductionRng::new()
        }
    }

    /// System clock. Zero-sized; compiles down to a syscall.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProductionTimeSource;

    impl ProductionTimeSource {
        pub fn new() -> Self {
            ProductionTimeSource
        }
    }

    impl TimeSource for ProductionTimeSource {
        #[inline]
        fn now_millis(&self) -> u64 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        }
    }
}

pub use production::{ProductionRng, ProductionTimeSource};
