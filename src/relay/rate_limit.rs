//! Per-neighbour relay rate limiting (fixed windows)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: HashMap<PeerId, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: HashMap::new(),
        }
    }

    /// Count one relay on behalf of `peer`; `false` once its budget for the
    /// current window is spent
    pub fn allow(&mut self, peer: PeerId, now: Instant) -> bool {
        let window = self.window;
        let entry = self.windows.entry(peer).or_insert(Window { started: now, count: 0 });
        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Forget windows that have run out
    pub fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.windows.retain(|_, w| now.duration_since(w.started) < window);
    }

    pub fn tracked_peers(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_resets_each_window() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(10));
        let peer = PeerId::new([1; 8]);
        let other = PeerId::new([2; 8]);
        let start = Instant::now();

        assert!(limiter.allow(peer, start));
        assert!(limiter.allow(peer, start));
        assert!(!limiter.allow(peer, start));
        assert!(limiter.allow(other, start));

        assert!(limiter.allow(peer, start + Duration::from_secs(10)));
    }

    #[test]
    fn test_sweep_drops_idle_peers() {
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        limiter.allow(PeerId::new([1; 8]), start);
        assert_eq!(limiter.tracked_peers(), 1);
        limiter.sweep(start + Duration::from_secs(2));
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
