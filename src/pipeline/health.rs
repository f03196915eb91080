//! Per-stage throughput counters

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Health metrics for one stage
///
/// Stages record every unit they push (or, for sinks, consume).
/// All fields use atomic operations for thread-safe access.
#[derive(Debug, Default)]
pub struct StageHealth {
    units_processed: AtomicU64,
    bytes_processed: AtomicU64,
    keyframes_processed: AtomicU64,
    eos_reached: AtomicBool,
}

impl StageHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully handled unit
    pub fn record_unit(&self, size: usize, is_keyframe: bool) {
        self.units_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eos(&self) {
        self.eos_reached.store(true, Ordering::Release);
    }

    pub fn units_processed(&self) -> u64 {
        self.units_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn keyframes_processed(&self) -> u64 {
        self.keyframes_processed.load(Ordering::Relaxed)
    }

    pub fn eos_reached(&self) -> bool {
        self.eos_reached.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            units_processed: self.units_processed(),
            bytes_processed: self.bytes_processed(),
            keyframes_processed: self.keyframes_processed(),
            eos_reached: self.eos_reached(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSummary {
    pub units_processed: u64,
    pub bytes_processed: u64,
    pub keyframes_processed: u64,
    pub eos_reached: bool,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} units, {} bytes, {} keyframes{}",
            self.units_processed,
            self.bytes_processed,
            self.keyframes_processed,
            if self.eos_reached { ", eos" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = StageHealth::new();

        health.record_unit(1000, false);
        health.record_unit(2000, true);
        health.record_unit(1500, false);

        assert_eq!(health.units_processed(), 3);
        assert_eq!(health.bytes_processed(), 4500);
        assert_eq!(health.keyframes_processed(), 1);
        assert!(!health.eos_reached());

        health.record_eos();
        assert_eq!(
            health.summary().to_string(),
            "3 units, 4500 bytes, 1 keyframes, eos"
        );
    }
}
