//! Fixed-capacity arena of paths.

use std::net::SocketAddr;

use tracing::trace;

use super::path::Path;
use super::state::PathState;
use crate::core::{InterfaceName, MTU_MIN, PATH_MAX, TunnelError, TunnelResult};

/// Path slots owned by a tunnel.
///
/// A `None` slot is the `Empty` state: a path is destroyed by freeing its
/// slot, never by transitioning.
#[derive(Debug, Clone)]
pub struct PathTable {
    slots: Vec<Option<Path>>,
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTable {
    /// Create an empty table of [`PATH_MAX`] slots.
    pub fn new() -> Self {
        Self {
            slots: (0..PATH_MAX).map(|_| None).collect(),
        }
    }

    /// Number of live paths.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Check if no path is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a path by slot.
    pub fn get(&self, index: usize) -> Option<&Path> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Get a path by slot, mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Path> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Iterate over live paths with their slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Path)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|p| (i, p)))
    }

    /// Iterate mutably over live paths with their slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Path)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|p| (i, p)))
    }

    /// Find the path with exactly this interface and remote.
    pub fn find(&self, interface: &InterfaceName, remote: SocketAddr) -> Option<usize> {
        self.iter()
            .find(|(_, p)| p.remote == remote && &p.interface == interface)
            .map(|(i, _)| i)
    }

    /// Attribute an inbound datagram to a path.
    ///
    /// An exact interface match wins; otherwise the first path to `remote`.
    pub fn lookup(&self, interface: &InterfaceName, remote: SocketAddr) -> Option<usize> {
        self.find(interface, remote).or_else(|| {
            self.iter()
                .find(|(_, p)| p.remote == remote)
                .map(|(i, _)| i)
        })
    }

    /// Store a path in the first free slot.
    pub fn insert(&mut self, path: Path) -> TunnelResult<usize> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TunnelError::PathTableFull)?;
        self.slots[index] = Some(path);
        Ok(index)
    }

    /// Free a slot, returning the path it held.
    pub fn remove(&mut self, index: usize) -> Option<Path> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Recompute which paths may carry payload.
    ///
    /// Healthy UP paths are scheduled. When none is, healthy preferred
    /// BACKUP paths stand in. When no path is healthy at all, every reachable
    /// preferred path is used however lossy it is. Stored states are left
    /// untouched.
    pub fn classify(&mut self) -> bool {
        let any_up = self
            .iter()
            .any(|(_, p)| p.state() == PathState::Up && p.ok);
        let any_backup = self.iter().any(|(_, p)| {
            p.state() == PathState::Backup && p.ok && p.policy().preferred
        });
        let fallback = !any_up && !any_backup;

        let mut changed = false;
        for (_, path) in self.iter_mut() {
            let preferred = path.policy().preferred;
            let lossy_fallback = fallback && preferred && path.is_reachable();
            let scheduled = match path.state() {
                PathState::Up => path.ok || lossy_fallback,
                PathState::Backup => (!any_up && path.ok && preferred) || lossy_fallback,
                _ => false,
            };
            if scheduled != path.scheduled {
                trace!(path = %path.remote, state = %path.state(), scheduled, "path scheduling");
                path.scheduled = scheduled;
                changed = true;
            }
        }
        changed
    }

    /// Smallest confirmed frame size over scheduled paths.
    pub fn mtu(&self) -> usize {
        self.iter()
            .filter(|(_, p)| p.scheduled)
            .map(|(_, p)| p.mtu.ok)
            .min()
            .unwrap_or(MTU_MIN)
    }

    /// Pick the path for a payload of `payload_len` bytes.
    ///
    /// Among scheduled paths that fit the frame, prefer one with send budget,
    /// then the lowest smoothed RTT, then the most budget left.
    pub fn select(&mut self, payload_len: usize, overhead: usize, now: u64) -> TunnelResult<usize> {
        let frame_len = payload_len + overhead;

        let mut largest = 0;
        let mut any = false;
        let mut best: Option<(usize, u64, u64)> = None;
        let mut retry_after = u64::MAX;

        for (i, path) in self.iter_mut() {
            if !path.scheduled {
                continue;
            }
            any = true;
            largest = largest.max(path.mtu.ok);
            if path.mtu.ok < frame_len {
                continue;
            }

            if !path.can_send(frame_len, now) {
                retry_after = retry_after.min(path.time_until(frame_len, now));
                continue;
            }

            let rtt = path.rtt.val;
            let headroom = path.headroom(now);
            let better = match best {
                None => true,
                Some((_, best_rtt, best_headroom)) => {
                    rtt < best_rtt || (rtt == best_rtt && headroom > best_headroom)
                }
            };
            if better {
                best = Some((i, rtt, headroom));
            }
        }

        match best {
            Some((i, _, _)) => Ok(i),
            None if !any => Err(TunnelError::NoUsablePath),
            None if largest < frame_len => Err(TunnelError::PayloadTooLarge {
                size: payload_len,
                mtu: largest.saturating_sub(overhead),
            }),
            None => Err(TunnelError::RateLimited {
                retry_after_us: retry_after,
            }),
        }
    }
}
