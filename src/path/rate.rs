//! Per-path rate control.
//!
//! A token bucket enforces the allowed rate on every payload frame; the
//! allowed rate itself is either pinned to the configured ceiling or
//! discovered with additive-increase / multiplicative-decrease driven by the
//! path's loss and RTT feedback.

use crate::core::{
    DEFAULT_MAX_RATE, INITIAL_RATE, MIN_RATE, MTU_MAX_V4, RATE_BURST, RATE_DECREASE_DEN,
    RATE_DECREASE_NUM, RATE_INCREASE_MIN,
};

const MICROS_PER_SEC: u64 = 1_000_000;

/// Token bucket measured in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    tokens: u64,
    capacity: u64,
    last_refill: u64,
}

impl TokenBucket {
    /// Create a full bucket sized for `rate`.
    pub fn new(rate: u64, now: u64) -> Self {
        let capacity = Self::capacity_for(rate);
        Self {
            tokens: capacity,
            capacity,
            last_refill: now,
        }
    }

    /// Bucket depth for a given rate.
    pub fn capacity_for(rate: u64) -> u64 {
        let burst = u128::from(rate) * u128::from(RATE_BURST) / u128::from(MICROS_PER_SEC);
        saturate(burst).max(MTU_MAX_V4 as u64)
    }

    /// Add the tokens earned since the last refill.
    pub fn refill(&mut self, rate: u64, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill);
        let earned = saturate(u128::from(elapsed) * u128::from(rate) / u128::from(MICROS_PER_SEC));

        // Hold the clock until a whole byte is earned so slow rates progress.
        if earned > 0 || rate == 0 {
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = now;
        }
        if self.tokens >= self.capacity {
            self.last_refill = now;
        }
    }

    /// Resize for a new rate, never adding tokens.
    pub fn resize(&mut self, rate: u64) {
        self.capacity = Self::capacity_for(rate);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Available tokens.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Bucket depth.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Take `bytes` if available.
    pub fn try_consume(&mut self, bytes: u64) -> bool {
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    /// Take `bytes` regardless of the balance (floored at zero).
    pub fn charge(&mut self, bytes: u64) {
        self.tokens = self.tokens.saturating_sub(bytes);
    }

    /// Microseconds until `bytes` tokens will be available at `rate`.
    pub fn time_until(&self, bytes: u64, rate: u64) -> u64 {
        if self.tokens >= bytes {
            return 0;
        }
        if rate == 0 {
            return u64::MAX;
        }
        let missing = (bytes.min(self.capacity) - self.tokens.min(bytes)) as u128;
        saturate((missing * u128::from(MICROS_PER_SEC)).div_ceil(u128::from(rate)))
    }
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Allowed send rate for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateController {
    /// Current allowed rate in bytes per second.
    rate: u64,
    /// Locally configured ceiling (0 = none).
    tx_max_rate: u64,
    /// Ceiling requested by the peer's receive limit (0 = none).
    peer_rx_max_rate: u64,
    /// Pin the rate to the ceiling.
    fixed: bool,
    bucket: TokenBucket,
}

impl RateController {
    /// Create a controller.
    pub fn new(tx_max_rate: u64, fixed: bool, now: u64) -> Self {
        let mut controller = Self {
            rate: 0,
            tx_max_rate,
            peer_rx_max_rate: 0,
            fixed,
            bucket: TokenBucket::new(0, now),
        };
        controller.rate = controller.initial_rate();
        controller.bucket = TokenBucket::new(controller.rate, now);
        controller
    }

    fn initial_rate(&self) -> u64 {
        if self.fixed {
            self.ceiling()
        } else {
            INITIAL_RATE.min(self.ceiling())
        }
    }

    /// Effective ceiling: the tighter of our transmit limit and the peer's receive limit.
    pub fn ceiling(&self) -> u64 {
        match (self.tx_max_rate, self.peer_rx_max_rate) {
            (0, 0) => DEFAULT_MAX_RATE,
            (0, peer) => peer,
            (local, 0) => local,
            (local, peer) => local.min(peer),
        }
    }

    /// Apply new local policy, restarting discovery if it changed.
    pub fn configure(&mut self, tx_max_rate: u64, fixed: bool) {
        if self.tx_max_rate == tx_max_rate && self.fixed == fixed {
            return;
        }
        self.tx_max_rate = tx_max_rate;
        self.fixed = fixed;
        self.set_rate(self.initial_rate());
    }

    /// Record the receive limit announced by the peer.
    pub fn set_peer_rx_max_rate(&mut self, rate: u64) {
        if self.peer_rx_max_rate == rate {
            return;
        }
        self.peer_rx_max_rate = rate;
        let target = if self.fixed { self.ceiling() } else { self.rate.min(self.ceiling()) };
        self.set_rate(target);
    }

    fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
        self.bucket.resize(rate);
    }

    /// Current allowed rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Whether discovery is disabled.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Fold in one feedback sample.
    ///
    /// `healthy` is true when loss and RTT are within the path's limits.
    pub fn on_feedback(&mut self, healthy: bool) {
        if self.fixed {
            return;
        }

        let rate = if healthy {
            let step = (self.rate / 16).max(RATE_INCREASE_MIN);
            self.rate.saturating_add(step).min(self.ceiling())
        } else {
            let decreased = u128::from(self.rate) * u128::from(RATE_DECREASE_NUM)
                / u128::from(RATE_DECREASE_DEN);
            saturate(decreased).max(MIN_RATE.min(self.ceiling()))
        };
        self.set_rate(rate);
    }

    /// Tokens available right now.
    pub fn headroom(&mut self, now: u64) -> u64 {
        self.bucket.refill(self.rate, now);
        self.bucket.tokens()
    }

    /// Check whether a frame of `bytes` may be sent now, without taking tokens.
    pub fn can_send(&mut self, bytes: usize, now: u64) -> bool {
        self.headroom(now) >= bytes as u64
    }

    /// Take tokens for a payload frame. Returns false if the budget is short.
    pub fn try_send(&mut self, bytes: usize, now: u64) -> bool {
        self.bucket.refill(self.rate, now);
        self.bucket.try_consume(bytes as u64)
    }

    /// Charge a control message against the budget without blocking it.
    pub fn charge(&mut self, bytes: usize, now: u64) {
        self.bucket.refill(self.rate, now);
        self.bucket.charge(bytes as u64);
    }

    /// Microseconds until a frame of `bytes` fits.
    pub fn time_until(&mut self, bytes: usize, now: u64) -> u64 {
        self.bucket.refill(self.rate, now);
        self.bucket.time_until(bytes as u64, self.rate)
    }

    /// Bucket depth at the current rate.
    pub fn burst(&self) -> u64 {
        self.bucket.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rate_uses_ceiling() {
        let controller = RateController::new(500_000, true, 0);
        assert_eq!(controller.rate(), 500_000);
        assert!(controller.is_fixed());
    }

    #[test]
    fn test_auto_rate_starts_at_initial() {
        let controller = RateController::new(0, false, 0);
        assert_eq!(controller.rate(), INITIAL_RATE);
        assert_eq!(controller.ceiling(), DEFAULT_MAX_RATE);

        let controller = RateController::new(100_000, false, 0);
        assert_eq!(controller.rate(), 100_000);
    }

    #[test]
    fn test_additive_increase_capped() {
        let mut controller = RateController::new(2_000_000, false, 0);
        let before = controller.rate();
        controller.on_feedback(true);
        assert!(controller.rate() > before);

        for _ in 0..1000 {
            controller.on_feedback(true);
        }
        assert_eq!(controller.rate(), 2_000_000);
    }

    #[test]
    fn test_multiplicative_decrease_floored() {
        let mut controller = RateController::new(0, false, 0);
        controller.on_feedback(false);
        assert_eq!(controller.rate(), INITIAL_RATE * 7 / 10);

        for _ in 0..100 {
            controller.on_feedback(false);
        }
        assert_eq!(controller.rate(), MIN_RATE);
    }

    #[test]
    fn test_decrease_near_u64_max() {
        let mut controller = RateController::new(u64::MAX, false, 0);
        while controller.rate() < u64::MAX / 2 {
            controller.on_feedback(true);
        }
        let before = controller.rate();
        controller.on_feedback(false);
        assert_eq!(
            controller.rate(),
            (u128::from(before) * 7 / 10) as u64,
            "no overflow past u64::MAX / 7"
        );

        assert!(controller.headroom(10 * MICROS_PER_SEC) > 0);
        assert_eq!(controller.time_until(0, 10 * MICROS_PER_SEC), 0);
    }

    #[test]
    fn test_fixed_rate_ignores_feedback() {
        let mut controller = RateController::new(300_000, true, 0);
        controller.on_feedback(false);
        controller.on_feedback(true);
        assert_eq!(controller.rate(), 300_000);
    }

    #[test]
    fn test_peer_rx_limit_lowers_ceiling() {
        let mut controller = RateController::new(1_000_000, true, 0);
        controller.set_peer_rx_max_rate(250_000);
        assert_eq!(controller.ceiling(), 250_000);
        assert_eq!(controller.rate(), 250_000);

        controller.set_peer_rx_max_rate(0);
        assert_eq!(controller.rate(), 1_000_000);
    }

    #[test]
    fn test_fixed_rate_never_exceeds_ceiling() {
        let rate = 100_000;
        let mut controller = RateController::new(rate, true, 0);
        let burst = controller.burst();
        let frame = 1000;

        // Hammer the controller every 100us for two seconds.
        let window = 2_000_000u64;
        let mut sent = 0u64;
        let mut now = 0u64;
        while now <= window {
            while controller.try_send(frame, now) {
                sent += frame as u64;
            }
            now += 100;
        }

        let allowed = rate * window / 1_000_000 + burst;
        assert!(sent <= allowed, "sent {sent} > allowed {allowed}");
        // And it is not starved either.
        assert!(sent >= rate * window / 1_000_000 - frame as u64);
    }

    #[test]
    fn test_sub_window_property_holds() {
        let rate = 64_000;
        let mut controller = RateController::new(rate, true, 0);
        let burst = controller.burst();
        let mut log = Vec::new();
        let mut now = 0u64;
        while now < 3_000_000 {
            if controller.try_send(700, now) {
                log.push(now);
            }
            now += 250;
        }

        // Any 500ms window obeys rate * window + burst.
        let span = 500_000u64;
        for (i, &start) in log.iter().enumerate() {
            let count = log[i..].iter().take_while(|&&t| t < start + span).count() as u64;
            assert!(count * 700 <= rate * span / 1_000_000 + burst);
        }
    }

    #[test]
    fn test_time_until() {
        let mut controller = RateController::new(1_000_000, true, 0);
        let burst = controller.burst() as usize;
        assert!(controller.try_send(burst, 0));
        assert_eq!(controller.time_until(1000, 0), 1000);
        assert_eq!(controller.time_until(1000, 1000), 0);
    }

    #[test]
    fn test_charge_does_not_block() {
        let mut controller = RateController::new(100_000, true, 0);
        controller.charge(1_000_000, 0);
        assert_eq!(controller.headroom(0), 0);
        assert!(!controller.can_send(1, 0));
    }
}
