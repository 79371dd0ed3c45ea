//! Gossip Dedup Filter
//!
//! Rotating Bloom filter keyed by packet fingerprints. A generation is
//! retired once its estimated fill reaches the configured ratio or the
//! rotation interval elapses. The previous generation is still queried for
//! a grace period, so anything seen within the current and previous
//! generation is never reported as new. Older entries may be forgotten,
//! which allows a very old packet to be delivered again.

use bloomfilter::Bloom;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::DedupConfig;
use crate::protocol::Fingerprint;

struct Generation {
    bloom: Bloom<Fingerprint>,
    inserted: usize,
    created: Instant,
}

impl Generation {
    fn new(capacity: usize, false_positive_rate: f64, now: Instant) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(capacity, false_positive_rate),
            inserted: 0,
            created: now,
        }
    }
}

/// Snapshot of the filter for statistics
#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub current_inserted: usize,
    pub fill_ratio: f64,
    pub has_previous: bool,
    pub rotations: u64,
}

pub struct DedupFilter {
    config: DedupConfig,
    current: Generation,
    /// Retired generation and the instant it was retired
    previous: Option<(Generation, Instant)>,
    rotations: u64,
}

impl DedupFilter {
    pub fn new(config: DedupConfig, now: Instant) -> Self {
        let current = Generation::new(config.capacity, config.false_positive_rate, now);
        Self {
            config,
            current,
            previous: None,
            rotations: 0,
        }
    }

    /// Probable membership in the current or grace-period generation
    pub fn test(&self, fingerprint: &Fingerprint) -> bool {
        self.current.bloom.check(fingerprint)
            || self
                .previous
                .as_ref()
                .is_some_and(|(generation, _)| generation.bloom.check(fingerprint))
    }

    pub fn insert(&mut self, fingerprint: &Fingerprint, now: Instant) {
        self.maintain(now);
        if !self.current.bloom.check(fingerprint) {
            self.current.bloom.set(fingerprint);
            self.current.inserted += 1;
        }
    }

    /// Returns `true` if the fingerprint was new (and is now recorded)
    pub fn check_and_insert(&mut self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.maintain(now);
        if self.test(fingerprint) {
            return false;
        }
        self.current.bloom.set(fingerprint);
        self.current.inserted += 1;
        true
    }

    /// Rotate or retire generations whose thresholds have passed
    pub fn maintain(&mut self, now: Instant) {
        if let Some((_, retired_at)) = &self.previous {
            if now.duration_since(*retired_at) >= self.config.grace_period() {
                self.previous = None;
            }
        }

        let full = self.fill_ratio() >= self.config.rotate_fill_ratio;
        let expired = now.duration_since(self.current.created) >= self.config.rotation_interval();
        if full || expired {
            self.rotate(now);
        }
    }

    fn rotate(&mut self, now: Instant) {
        let fresh = Generation::new(self.config.capacity, self.config.false_positive_rate, now);
        let retired = std::mem::replace(&mut self.current, fresh);
        log::debug!(
            "Rotating dedup filter after {} fingerprints ({:?} old)",
            retired.inserted,
            now.duration_since(retired.created)
        );
        self.previous = Some((retired, now));
        self.rotations += 1;
    }

    /// Estimated fill of the current generation
    pub fn fill_ratio(&self) -> f64 {
        self.current.inserted as f64 / self.config.capacity as f64
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            current_inserted: self.current.inserted,
            fill_ratio: self.fill_ratio(),
            has_previous: self.previous.is_some(),
            rotations: self.rotations,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.config.grace_period()
    }
}
