//! Abuse accounting.
//!
//! Records which origins send frames that fail authentication, carry
//! out-of-window timestamps or replay a header, or break the key exchange.
//! The tracker only counts; it never blocks an origin.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use tracing::trace;

use crate::core::{BAD_MAX_ORIGINS, BAD_WINDOW};

/// Kind of offense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BadKind {
    /// Frame failed to parse or authenticate.
    Decrypt,
    /// Timestamp outside the tolerance, or a replayed header.
    Difftime,
    /// Key exchange failed.
    Keyx,
}

/// Counter for one kind of offense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BadCounter {
    /// Last offense.
    pub time: u64,
    /// Offenses since the counter was last reset.
    pub count: u64,
    /// Last offending address.
    pub addr: Option<SocketAddr>,
}

impl BadCounter {
    fn hit(&mut self, addr: SocketAddr, now: u64) {
        if self.count > 0 && now.saturating_sub(self.time) > BAD_WINDOW {
            self.count = 0;
        }
        self.time = now;
        self.count = self.count.saturating_add(1);
        self.addr = Some(addr);
    }
}

/// Offenses of one origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BadRecord {
    /// Authentication failures.
    pub decrypt: BadCounter,
    /// Clock-skew and replay failures.
    pub difftime: BadCounter,
    /// Key exchange failures.
    pub keyx: BadCounter,
}

impl BadRecord {
    /// Counter for `kind`.
    pub fn get(&self, kind: BadKind) -> &BadCounter {
        match kind {
            BadKind::Decrypt => &self.decrypt,
            BadKind::Difftime => &self.difftime,
            BadKind::Keyx => &self.keyx,
        }
    }

    fn get_mut(&mut self, kind: BadKind) -> &mut BadCounter {
        match kind {
            BadKind::Decrypt => &mut self.decrypt,
            BadKind::Difftime => &mut self.difftime,
            BadKind::Keyx => &mut self.keyx,
        }
    }

    /// Most recent offense of any kind.
    pub fn last_seen(&self) -> u64 {
        self.decrypt.time.max(self.difftime.time).max(self.keyx.time)
    }
}

/// Per-origin abuse counters.
#[derive(Debug, Clone, Default)]
pub struct BadTracker {
    origins: HashMap<IpAddr, BadRecord>,
}

impl BadTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an offense from `addr`.
    pub fn report(&mut self, kind: BadKind, addr: SocketAddr, now: u64) {
        let ip = addr.ip();
        if !self.origins.contains_key(&ip) && self.origins.len() >= BAD_MAX_ORIGINS {
            self.evict_stalest();
        }

        let record = self.origins.entry(ip).or_default();
        record.get_mut(kind).hit(addr, now);
        trace!(origin = %addr, ?kind, count = record.get(kind).count, "bad traffic");
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .origins
            .iter()
            .min_by_key(|(_, record)| record.last_seen())
            .map(|(ip, _)| *ip);
        if let Some(ip) = stalest {
            self.origins.remove(&ip);
        }
    }

    /// Drop origins quiet for longer than the decay window.
    pub fn prune(&mut self, now: u64) -> usize {
        let before = self.origins.len();
        self.origins
            .retain(|_, record| now.saturating_sub(record.last_seen()) <= BAD_WINDOW);
        before - self.origins.len()
    }

    /// Record for one origin.
    pub fn get(&self, ip: &IpAddr) -> Option<&BadRecord> {
        self.origins.get(ip)
    }

    /// Number of tracked origins.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// Check if no origin is tracked.
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Copy of every record.
    pub fn snapshot(&self) -> Vec<(IpAddr, BadRecord)> {
        let mut records: Vec<_> = self.origins.iter().map(|(ip, r)| (*ip, *r)).collect();
        records.sort_by_key(|(ip, _)| *ip);
        records
    }

    /// Latest offender, latest time and total count per kind.
    pub fn summary(&self) -> BadRecord {
        let mut summary = BadRecord::default();
        for record in self.origins.values() {
            for kind in [BadKind::Decrypt, BadKind::Difftime, BadKind::Keyx] {
                let from = record.get(kind);
                let into = summary.get_mut(kind);
                into.count = into.count.saturating_add(from.count);
                if from.count > 0 && from.time >= into.time {
                    into.time = from.time;
                    into.addr = from.addr;
                }
            }
        }
        summary
    }
}
