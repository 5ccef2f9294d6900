//! Per-path MTU discovery.
//!
//! Binary search over UDP payload sizes between a guaranteed minimum and an
//! address-family dependent maximum. The first probe goes straight to the
//! maximum since most paths carry full-size frames.

use std::net::SocketAddr;

use tracing::trace;

use crate::core::{MTU_MAX_V4, MTU_MAX_V6, MTU_MIN};

/// Search state for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuProber {
    /// Largest size known to get through.
    pub min: usize,
    /// Largest size that may still get through.
    pub max: usize,
    /// Size of the in-flight probe, 0 when none.
    pub probe: usize,
    /// Size of the most recent probe.
    pub last: usize,
    /// Confirmed working size handed to the rest of the tunnel.
    pub ok: usize,
    /// When the in-flight probe was sent.
    sent_at: u64,
    /// Upper bound the search restarts from.
    ceiling: usize,
}

impl MtuProber {
    /// Create a prober for a path toward `remote`.
    pub fn new(remote: SocketAddr) -> Self {
        let ceiling = if remote.is_ipv4() { MTU_MAX_V4 } else { MTU_MAX_V6 };
        Self::with_bounds(MTU_MIN, ceiling)
    }

    /// Create a prober with explicit bounds.
    pub fn with_bounds(min: usize, max: usize) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            probe: 0,
            last: 0,
            ok: min,
            sent_at: 0,
            ceiling: max,
        }
    }

    /// Check if the search has finished.
    pub fn is_complete(&self) -> bool {
        self.min >= self.max
    }

    /// Check if a probe is awaiting its outcome.
    pub fn in_flight(&self) -> bool {
        self.probe != 0
    }

    /// Returns the size of the next probe to send, if any, and marks it in flight.
    pub fn poll_probe(&mut self, now: u64) -> Option<usize> {
        if self.in_flight() || self.is_complete() {
            return None;
        }

        let size = if self.last == 0 {
            self.max
        } else {
            self.min + (self.max - self.min).div_ceil(2)
        };

        self.probe = size;
        self.last = size;
        self.sent_at = now;
        trace!(size, min = self.min, max = self.max, "mtu probe");
        Some(size)
    }

    /// The probe of `size` bytes was answered.
    ///
    /// Returns true if this confirmed the in-flight probe.
    pub fn on_probe_acked(&mut self, size: usize) -> bool {
        if !self.in_flight() || size != self.probe {
            return false;
        }

        self.min = size;
        self.ok = size;
        self.probe = 0;
        trace!(ok = self.ok, "mtu probe acked");
        true
    }

    /// The in-flight probe got no answer.
    pub fn on_probe_lost(&mut self) {
        if !self.in_flight() {
            return;
        }

        // Never retry a failed size in this round.
        self.max = (self.probe - 1).max(self.min);
        self.probe = 0;
        trace!(min = self.min, max = self.max, "mtu probe lost");
    }

    /// Expire the in-flight probe if it has waited longer than `timeout`.
    ///
    /// Returns true if a probe was declared lost.
    pub fn check_timeout(&mut self, now: u64, timeout: u64) -> bool {
        if self.in_flight() && now.saturating_sub(self.sent_at) >= timeout {
            self.on_probe_lost();
            return true;
        }
        false
    }

    /// Start a new discovery round from the guaranteed minimum.
    pub fn reset(&mut self) {
        *self = Self::with_bounds(MTU_MIN.min(self.ceiling), self.ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a prober against a path that drops every frame above `limit`.
    fn converge(prober: &mut MtuProber, limit: usize) -> (usize, Vec<usize>) {
        let mut rounds = 0;
        let mut sizes = Vec::new();
        let mut now = 0;
        while let Some(size) = prober.poll_probe(now) {
            sizes.push(size);
            rounds += 1;
            now += 1_000_000;
            if size <= limit {
                assert!(prober.on_probe_acked(size));
            } else {
                assert!(prober.check_timeout(now, 500_000));
            }
        }
        (rounds, sizes)
    }

    #[test]
    fn test_prober_initial() {
        let prober = MtuProber::new("192.0.2.1:5000".parse().unwrap());
        assert_eq!(prober.ok, MTU_MIN);
        assert_eq!(prober.max, MTU_MAX_V4);
        assert!(!prober.in_flight());

        let prober = MtuProber::new("[2001:db8::1]:5000".parse().unwrap());
        assert_eq!(prober.max, MTU_MAX_V6);
    }

    #[test]
    fn test_first_probe_at_max() {
        let mut prober = MtuProber::with_bounds(1000, 1500);
        assert_eq!(prober.poll_probe(0), Some(1500));
        assert_eq!(prober.poll_probe(0), None, "one probe in flight at a time");

        assert!(prober.on_probe_acked(1500));
        assert_eq!(prober.ok, 1500);
        assert!(prober.is_complete());
        assert_eq!(prober.poll_probe(0), None);
    }

    #[test]
    fn test_converges_to_limit() {
        for limit in [1000, 1001, 1234, 1399, 1400, 1499, 1500] {
            let mut prober = MtuProber::with_bounds(1000, 1500);
            let (rounds, sizes) = converge(&mut prober, limit);

            assert_eq!(prober.ok, limit, "limit {limit}");
            // ceil(log2(501)) + 1
            assert!(rounds <= 10, "limit {limit} took {rounds} rounds");

            let mut unique = sizes.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), sizes.len(), "a size was probed twice: {sizes:?}");
        }
    }

    #[test]
    fn test_no_probes_above_limit_after_convergence() {
        let mut prober = MtuProber::with_bounds(1232, 1472);
        converge(&mut prober, 1400);
        assert_eq!(prober.ok, 1400);

        for t in 0..100 {
            assert_eq!(prober.poll_probe(t * 1_000_000), None);
            assert!(!prober.check_timeout(t * 1_000_000, 1));
        }
        assert_eq!(prober.ok, 1400);
    }

    #[test]
    fn test_ack_for_wrong_size_ignored() {
        let mut prober = MtuProber::with_bounds(1000, 1500);
        prober.poll_probe(0);
        assert!(!prober.on_probe_acked(1200));
        assert!(prober.in_flight());
        assert_eq!(prober.ok, 1000);
    }

    #[test]
    fn test_timeout_not_reached() {
        let mut prober = MtuProber::with_bounds(1000, 1500);
        prober.poll_probe(0);
        assert!(!prober.check_timeout(100, 200));
        assert!(prober.in_flight());
        assert!(prober.check_timeout(200, 200));
        assert_eq!(prober.max, 1499);
    }

    #[test]
    fn test_reset_restarts_search() {
        let mut prober = MtuProber::with_bounds(1232, 1472);
        converge(&mut prober, 1300);
        prober.reset();

        assert_eq!(prober.ok, MTU_MIN);
        assert_eq!(prober.max, 1472);
        assert_eq!(prober.poll_probe(0), Some(1472));
    }
}
