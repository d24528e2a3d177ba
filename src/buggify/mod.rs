//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Deterministic, reproducible fault injection for store operations. Every
//! decision point in `SimulatedStore` names a fault from [`faults`]; a
//! seeded RNG decides whether it fires, so a failing simulation replays
//! exactly from its seed. Each check is counted per fault id.
//!
//! # Usage
//!
//! ```ignore
//! use kv_migrate::buggify::{faults, BuggifyStats};
//!
//! if buggify!(&mut rng, &mut stats, faults::source::READ_FAIL, 0.02) {
//!     return Err(StoreError::Transient("simulated read failure".into()));
//! }
//! ```

pub mod faults;

pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::collections::HashMap;

/// How often each fault was checked and how often it fired
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, fault_id: &str, triggered: bool) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
        if triggered {
            *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn triggered(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn total_triggered(&self) -> u64 {
        self.triggers.values().sum()
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        match self.checks.get(fault_id).copied().unwrap_or(0) {
            0 => 0.0,
            checks => self.triggered(fault_id) as f64 / checks as f64,
        }
    }

    /// One line per known fault that was checked at least once
    pub fn summary(&self) -> String {
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];
        for fault_id in ALL_FAULTS {
            let Some(checks) = self.checks.get(*fault_id) else {
                continue;
            };
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                fault_id,
                self.triggered(fault_id),
                checks,
                self.trigger_rate(fault_id) * 100.0
            ));
        }
        lines.join("\n")
    }
}

/// Draw against `probability`; never fires at or below zero
#[inline]
pub fn should_buggify<R: Rng>(rng: &mut R, probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
    random_value < probability.min(1.0)
}

/// BUGGIFY macro - decide a fault and count it
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $stats:expr, $fault_id:expr, $prob:expr) => {{
        let triggered = $crate::buggify::should_buggify($rng, $prob);
        $stats.record($fault_id, triggered);
        triggered
    }};
}
