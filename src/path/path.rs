//! One network path between the two tunnel endpoints.
//!
//! A path owns its quality estimators (RTT, loss, MTU, rate) and the state
//! machine deciding whether it may carry payload. It never touches the
//! network itself: [`Path::tick`] tells the tunnel when a control message is
//! due, and the tunnel feeds back what arrives.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use super::mtu::MtuProber;
use super::rate::RateController;
use super::stat::Stat;
use super::state::PathState;
use crate::core::{
    ConfigError, DEFAULT_RTT_LIMIT, IDLE_KEEPALIVE_FACTOR, InterfaceName, LOSS_SCALE, LOSS_WINDOW,
    MIN_BEAT, MSG_SENT_MAX, PROBE_TIMEOUT_MAX, PROBE_TIMEOUT_MIN, PathPolicy,
};

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// How a path came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathOrigin {
    /// Created locally through `set_state`.
    Configured,
    /// Created from an authenticated message from an unknown address.
    Learned,
}

/// Traffic counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Frames.
    pub total: u64,
    /// Bytes on the wire.
    pub bytes: u64,
    /// Last activity.
    pub time: u64,
    /// Measured throughput in bytes per second.
    pub rate: u64,
    /// Loss on a 0..=255 scale.
    pub loss: u8,
}

/// Counters reported by the peer, with loss-window accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgCounters {
    /// Last reported frame count.
    pub total: u64,
    /// Last reported byte count.
    pub bytes: u64,
    /// When the report arrived.
    pub time: u64,
    /// Frame count at the start of the loss window.
    pub acc: u64,
    /// Byte count at the start of the loss window.
    pub acc_bytes: u64,
    /// Start of the loss window.
    pub acc_time: u64,
}

/// Control message bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgStats {
    /// Our frames as echoed back by the peer.
    pub tx: MsgCounters,
    /// Our frames as received by the peer.
    pub rx: MsgCounters,
    /// Last request sent.
    pub time: u64,
    /// Requests sent since the last reply.
    pub sent: u64,
    /// Replies received.
    pub set: u64,
}

/// Control message the tunnel should send after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Pad the message to this datagram size to probe the MTU.
    pub probe: Option<usize>,
}

/// Outcome of [`Path::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    /// A request is due on this path.
    pub request: Option<Request>,
    /// State or health changed.
    pub changed: bool,
}

/// Fields of a reply relevant to path quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reply {
    /// Our send time, echoed.
    pub sent_time: u64,
    /// Our `tx.total` when the request left, echoed.
    pub tx_total: u64,
    /// Our `tx.bytes` when the request left, echoed.
    pub tx_bytes: u64,
    /// Frames the peer has received on this path.
    pub rx_total: u64,
    /// Bytes the peer has received on this path.
    pub rx_bytes: u64,
    /// Receive ceiling the peer wants us to respect (0 = none).
    pub rx_max_rate: u64,
    /// Size of our request as the peer received it.
    pub frame_size: usize,
}

/// A network path and everything known about it.
#[derive(Debug, Clone)]
pub struct Path {
    /// Local interface.
    pub interface: InterfaceName,
    /// Remote address.
    pub remote: SocketAddr,
    state: PathState,
    origin: PathOrigin,
    conf: PathPolicy,
    /// Round-trip time estimate in microseconds.
    pub rtt: Stat,
    /// Sent frames.
    pub tx: Counters,
    /// Received frames.
    pub rx: Counters,
    /// Control message bookkeeping.
    pub msg: MsgStats,
    /// MTU discovery.
    pub mtu: MtuProber,
    rate: RateController,
    /// Time since the last frame arrived.
    pub idle: u64,
    /// Healthy enough to carry payload.
    pub ok: bool,
    /// Selected to carry payload this tick.
    pub scheduled: bool,
    rx_acc: (u64, u64),
}

impl Path {
    fn new(interface: InterfaceName, remote: SocketAddr, origin: PathOrigin, now: u64) -> Self {
        let conf = PathPolicy::new(interface.clone(), PathState::Down);

        // A filled slot leaves Empty straight away.
        Self {
            interface,
            remote,
            state: PathState::Down,
            origin,
            rate: RateController::new(conf.tx_max_rate, conf.fixed_rate, now),
            conf,
            rtt: Stat::new(),
            tx: Counters::default(),
            rx: Counters {
                time: now,
                ..Counters::default()
            },
            msg: MsgStats::default(),
            mtu: MtuProber::new(remote),
            idle: 0,
            ok: false,
            scheduled: false,
            rx_acc: (0, now),
        }
    }

    /// Create a configured path and apply `policy` to it.
    pub fn configured(policy: PathPolicy, remote: SocketAddr, now: u64) -> Result<Self, ConfigError> {
        policy.validate()?;
        let mut path = Self::new(policy.interface.clone(), remote, PathOrigin::Configured, now);
        path.apply_policy(policy)?;
        debug!(path = %remote, interface = %path.interface, state = %path.state, "path created");
        Ok(path)
    }

    /// Create a path for a peer that showed up on an unknown address.
    pub fn learned(interface: InterfaceName, remote: SocketAddr, now: u64) -> Self {
        let path = Self::new(interface, remote, PathOrigin::Learned, now);
        debug!(path = %remote, interface = %path.interface, "path learned");
        path
    }

    /// Current state.
    pub fn state(&self) -> PathState {
        self.state
    }

    /// State most recently asked for; restored after an idle demotion.
    pub fn requested(&self) -> PathState {
        self.conf.state
    }

    /// How the path was created.
    pub fn origin(&self) -> PathOrigin {
        self.origin
    }

    /// Current policy.
    pub fn policy(&self) -> &PathPolicy {
        &self.conf
    }

    /// Allowed transmit rate in bytes per second.
    pub fn tx_rate(&self) -> u64 {
        self.rate.rate()
    }

    /// Send budget available right now.
    pub fn headroom(&mut self, now: u64) -> u64 {
        self.rate.headroom(now)
    }

    /// Check whether the path carries traffic with too much loss.
    pub fn is_lossy(&self) -> bool {
        self.tx.loss > self.conf.loss_limit
    }

    /// Check whether loss and RTT are within the policy limits.
    pub fn is_healthy(&self) -> bool {
        !self.is_lossy() && self.rtt.val <= micros(self.conf.rtt_limit)
    }

    /// Move to `to` through the state machine.
    fn set_state(&mut self, to: PathState) -> Result<bool, ConfigError> {
        let from = self.state;
        self.state.transition(to)?;
        if from != to {
            debug!(path = %self.remote, interface = %self.interface, %from, %to, "path state");
        }
        Ok(from != to)
    }

    /// Apply a validated policy and move to its state.
    ///
    /// Nothing is changed if the policy or the transition is rejected.
    pub fn apply_policy(&mut self, policy: PathPolicy) -> Result<bool, ConfigError> {
        policy.validate()?;
        if !self.state.can_transition_to(policy.state) {
            return Err(ConfigError::IllegalTransition {
                from: self.state.as_str(),
                to: policy.state.as_str(),
            });
        }

        let to = policy.state;
        self.rate.configure(policy.tx_max_rate, policy.fixed_rate);
        self.conf = PathPolicy {
            interface: self.interface.clone(),
            ..policy
        };
        self.set_state(to)
    }

    /// Apply a local policy to any path. A learned path stops following the peer.
    pub fn claim(&mut self, policy: PathPolicy) -> Result<bool, ConfigError> {
        let changed = self.apply_policy(policy)?;
        self.origin = PathOrigin::Configured;
        Ok(changed)
    }

    /// Adopt the policy announced by the peer on a learned path.
    ///
    /// The peer speaks from its side of the link, so transmit and receive
    /// ceilings are swapped. Out-of-range values are clamped rather than
    /// rejected since the message is already authenticated.
    pub fn adopt(&mut self, announced: &PathPolicy) -> bool {
        if self.origin != PathOrigin::Learned {
            return false;
        }

        let state = match announced.state {
            PathState::Empty => PathState::Down,
            state => state,
        };
        let tx_max_rate = announced.rx_max_rate;
        let policy = PathPolicy {
            interface: self.interface.clone(),
            state,
            tx_max_rate,
            rx_max_rate: announced.tx_max_rate,
            beat: announced.beat.max(MIN_BEAT),
            fixed_rate: announced.fixed_rate && tx_max_rate > 0,
            preferred: announced.preferred,
            loss_limit: announced.loss_limit,
            rtt_limit: if announced.rtt_limit.is_zero() {
                DEFAULT_RTT_LIMIT
            } else {
                announced.rtt_limit
            },
        };

        if policy == self.conf {
            return false;
        }
        self.apply_policy(policy).unwrap_or(false)
    }

    /// Timeout for an MTU probe, from the RTT estimate.
    pub fn probe_timeout(&self) -> u64 {
        if !self.rtt.setup {
            return PROBE_TIMEOUT_MAX;
        }
        self.rtt.upper().clamp(PROBE_TIMEOUT_MIN, PROBE_TIMEOUT_MAX)
    }

    /// Periodic maintenance.
    pub fn tick(&mut self, now: u64, keepalive: Duration) -> Tick {
        let mut tick = Tick::default();

        self.idle = now.saturating_sub(self.rx.time);

        if self.state.is_active() && self.idle > micros(keepalive).saturating_mul(IDLE_KEEPALIVE_FACTOR) {
            debug!(path = %self.remote, idle = self.idle, "path idle");
            tick.changed |= self.set_state(PathState::Down).unwrap_or(false);
            self.rtt.reset();
            self.mtu.reset();
        }

        if self.mtu.check_timeout(now, self.probe_timeout()) {
            trace!(path = %self.remote, max = self.mtu.max, "mtu probe timed out");
        }

        let elapsed = now.saturating_sub(self.rx_acc.1);
        if elapsed >= LOSS_WINDOW {
            let bytes = self.rx.bytes.saturating_sub(self.rx_acc.0);
            self.rx.rate = bytes.saturating_mul(1_000_000) / elapsed;
            self.rx_acc = (self.rx.bytes, now);
        }

        if self.conf.state != PathState::Down && now.saturating_sub(self.msg.time) >= micros(self.conf.beat) {
            let probe = if self.rtt.setup && self.state.is_active() {
                self.mtu.poll_probe(now)
            } else {
                None
            };
            self.msg.time = now;
            self.msg.sent = self.msg.sent.saturating_add(1);
            tick.request = Some(Request { probe });
        }

        tick.changed |= self.refresh_ok();
        tick
    }

    /// Check whether the peer answers on this path, whatever the loss.
    pub fn is_reachable(&self) -> bool {
        self.rtt.setup && self.msg.sent < MSG_SENT_MAX
    }

    fn refresh_ok(&mut self) -> bool {
        let ok = self.is_reachable() && self.is_healthy();
        let changed = ok != self.ok;
        self.ok = ok;
        changed
    }

    /// Restore the requested state after a demotion.
    fn recover(&mut self) -> bool {
        if self.state == PathState::Down && self.conf.state.is_active() {
            debug!(path = %self.remote, state = %self.conf.state, "path recovered");
            return self.set_state(self.conf.state).unwrap_or(false);
        }
        false
    }

    /// Account for a frame we sent.
    pub fn on_sent(&mut self, len: usize, now: u64) {
        self.tx.total = self.tx.total.saturating_add(1);
        self.tx.bytes = self.tx.bytes.saturating_add(len as u64);
        self.tx.time = now;
    }

    /// Account for an authenticated frame we received.
    pub fn on_received(&mut self, len: usize, now: u64) {
        self.rx.total = self.rx.total.saturating_add(1);
        self.rx.bytes = self.rx.bytes.saturating_add(len as u64);
        self.rx.time = now;
        self.idle = 0;
    }

    /// A request from the peer arrived on this path.
    pub fn on_request(&mut self, peer_rx_max_rate: u64) -> bool {
        self.rate.set_peer_rx_max_rate(peer_rx_max_rate);
        self.recover()
    }

    /// A reply to one of our requests arrived.
    pub fn on_reply(&mut self, reply: &Reply, now: u64) -> bool {
        let mut changed = false;

        if reply.sent_time <= now {
            self.rtt.update(now - reply.sent_time);
        }
        self.msg.sent = 0;
        self.msg.set = self.msg.set.saturating_add(1);
        self.rate.set_peer_rx_max_rate(reply.rx_max_rate);

        if self.mtu.on_probe_acked(reply.frame_size) {
            changed = true;
        }

        self.msg.tx.total = reply.tx_total;
        self.msg.tx.bytes = reply.tx_bytes;
        self.msg.tx.time = now;
        self.msg.rx.total = reply.rx_total;
        self.msg.rx.bytes = reply.rx_bytes;
        self.msg.rx.time = now;

        if let Some(healthy) = self.close_loss_window(now) {
            if self.rtt.setup {
                self.rate.on_feedback(healthy);
            }
        }

        changed |= self.recover();
        changed |= self.refresh_ok();
        changed
    }

    /// Turn the reported counters into loss and delivered rate once per window.
    ///
    /// Returns the health verdict when a window closed.
    fn close_loss_window(&mut self, now: u64) -> Option<bool> {
        let MsgStats { tx, rx, .. } = &mut self.msg;

        if tx.acc_time == 0 {
            tx.acc = tx.total;
            tx.acc_bytes = tx.bytes;
            tx.acc_time = now;
            rx.acc = rx.total;
            rx.acc_bytes = rx.bytes;
            rx.acc_time = now;
            return None;
        }

        let elapsed = now.saturating_sub(tx.acc_time);
        if elapsed < LOSS_WINDOW {
            return None;
        }

        let sent = tx.total.saturating_sub(tx.acc);
        let received = rx.total.saturating_sub(rx.acc);
        let lost = sent.saturating_sub(received);
        let loss = if sent == 0 { 0 } else { (lost * LOSS_SCALE / sent).min(LOSS_SCALE) };
        let delivered = rx.bytes.saturating_sub(rx.acc_bytes);

        tx.acc = tx.total;
        tx.acc_bytes = tx.bytes;
        tx.acc_time = now;
        rx.acc = rx.total;
        rx.acc_bytes = rx.bytes;
        rx.acc_time = now;

        self.tx.loss = loss as u8;
        self.tx.rate = delivered.saturating_mul(1_000_000) / elapsed;
        trace!(path = %self.remote, loss = self.tx.loss, rate = self.tx.rate, "loss window");

        Some(self.is_healthy())
    }

    /// Check whether the path may take `bytes` right now.
    pub fn can_send(&mut self, bytes: usize, now: u64) -> bool {
        self.rate.can_send(bytes, now)
    }

    /// Take send budget for a payload frame.
    pub fn try_send(&mut self, bytes: usize, now: u64) -> bool {
        self.rate.try_send(bytes, now)
    }

    /// Charge a control message against the send budget.
    pub fn charge(&mut self, bytes: usize, now: u64) {
        self.rate.charge(bytes, now);
    }

    /// Microseconds until a frame of `bytes` fits the budget.
    pub fn time_until(&mut self, bytes: usize, now: u64) -> u64 {
        self.rate.time_until(bytes, now)
    }

    /// Next time a request is due, if the path sends requests at all.
    pub fn next_request(&self) -> Option<u64> {
        if self.conf.state == PathState::Down {
            return None;
        }
        Some(self.msg.time.saturating_add(micros(self.conf.beat)))
    }

    /// Check whether a learned path has been down and silent long enough to forget.
    pub fn is_expired(&self, now: u64, time_tolerance: Duration) -> bool {
        self.origin == PathOrigin::Learned
            && self.state == PathState::Down
            && now.saturating_sub(self.rx.time) > micros(time_tolerance)
    }
}
