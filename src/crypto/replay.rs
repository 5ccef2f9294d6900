//! Duplicate frame detection.
//!
//! Frame headers carry a timestamp and a random salt instead of a counter, so
//! replays inside the accepted clock-skew window are caught by remembering
//! recently accepted headers.
//!
//! Entries are ordered by sender time. An entry leaves the cache once its
//! timestamp has fallen out of the window, since the time check rejects any
//! copy of it from then on. When the cache fills up first, the oldest entry is
//! dropped and its timestamp becomes a floor: frames at or below it are
//! refused outright, as the cache can no longer vouch for them.

use std::collections::BTreeSet;

use crate::core::{FRAME_HEADER_SIZE, REPLAY_CACHE_SIZE};

/// Bounded set of recently accepted frame headers.
#[derive(Debug, Clone)]
pub struct ReplayCache {
    seen: BTreeSet<(u64, [u8; FRAME_HEADER_SIZE])>,
    floor: Option<u64>,
    capacity: usize,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_CACHE_SIZE)
    }
}

impl ReplayCache {
    /// Create a cache remembering up to `capacity` headers.
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: BTreeSet::new(),
            floor: None,
            capacity: capacity.max(1),
        }
    }

    /// Record a header sent at `sent` (local clock, µs).
    ///
    /// `window` is the accepted clock skew. Returns false if the header was
    /// already seen, or is too old for the cache to tell.
    pub fn check_and_insert(
        &mut self,
        header: &[u8; FRAME_HEADER_SIZE],
        sent: u64,
        now: u64,
        window: u64,
    ) -> bool {
        self.expire(now, window);

        if self.floor.is_some_and(|floor| sent <= floor) {
            return false;
        }
        if !self.seen.insert((sent, *header)) {
            return false;
        }
        if self.seen.len() > self.capacity {
            if let Some((oldest, _)) = self.seen.pop_first() {
                self.floor = Some(self.floor.map_or(oldest, |floor| floor.max(oldest)));
            }
        }
        true
    }

    /// Drop entries the time window already rejects.
    fn expire(&mut self, now: u64, window: u64) {
        let horizon = now.saturating_sub(window);
        while self.seen.first().is_some_and(|(sent, _)| *sent < horizon) {
            self.seen.pop_first();
        }
        if self.floor.is_some_and(|floor| floor < horizon) {
            self.floor = None;
        }
    }

    /// Timestamp at or below which every frame is refused.
    pub fn floor(&self) -> Option<u64> {
        self.floor
    }

    /// Number of remembered headers.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.floor = None;
    }
}
