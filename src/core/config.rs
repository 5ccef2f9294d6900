//! Validated configuration values.
//!
//! The tunnel never accepts loose arguments: every setter takes one of these
//! values, validates it as a whole and either applies all of it or nothing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_BEAT, DEFAULT_KEEPALIVE, DEFAULT_KX_TIMEOUT, DEFAULT_LOSS_LIMIT, DEFAULT_RTT_LIMIT,
    DEFAULT_TIME_TOLERANCE, INTERFACE_NAME_MAX, MIN_BEAT,
};
use super::error::ConfigError;
use crate::path::PathState;

/// Network interface label, at most [`INTERFACE_NAME_MAX`] bytes.
///
/// The empty name is valid and labels paths whose local side is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Validate and wrap an interface name.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.len() > INTERFACE_NAME_MAX || name.contains('\0') {
            return Err(ConfigError::InvalidInterface(name));
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the name is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for InterfaceName {
    type Error = ConfigError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = ConfigError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl From<InterfaceName> for String {
    fn from(name: InterfaceName) -> Self {
        name.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tunnel-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Base keepalive period; paths idle for twice this long are demoted.
    pub keepalive: Duration,
    /// Largest accepted difference between a frame timestamp and local time.
    pub time_tolerance: Duration,
    /// Key-exchange renewal period.
    pub kx_timeout: Duration,
    /// IP traffic class (TOS / DSCP byte) applied to outgoing datagrams.
    pub traffic_class: u8,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            time_tolerance: DEFAULT_TIME_TOLERANCE,
            kx_timeout: DEFAULT_KX_TIMEOUT,
            traffic_class: 0,
        }
    }
}

impl TunnelConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keepalive period.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the accepted clock skew.
    pub fn with_time_tolerance(mut self, tolerance: Duration) -> Self {
        self.time_tolerance = tolerance;
        self
    }

    /// Set the key-exchange renewal period.
    pub fn with_kx_timeout(mut self, timeout: Duration) -> Self {
        self.kx_timeout = timeout;
        self
    }

    /// Set the traffic class.
    pub fn with_traffic_class(mut self, tc: u8) -> Self {
        self.traffic_class = tc;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive < MIN_BEAT {
            return Err(ConfigError::InvalidTimeout {
                name: "keepalive",
                reason: "shorter than the minimum beat",
            });
        }
        if self.time_tolerance.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "time_tolerance",
                reason: "must be positive",
            });
        }
        if self.kx_timeout < Duration::from_secs(1) {
            return Err(ConfigError::InvalidTimeout {
                name: "kx_timeout",
                reason: "must be at least one second",
            });
        }
        // Timestamps are 48-bit microseconds.
        if self.time_tolerance.as_micros() >= 1 << 47 {
            return Err(ConfigError::InvalidTimeout {
                name: "time_tolerance",
                reason: "exceeds the timestamp range",
            });
        }
        Ok(())
    }
}

/// State and policy for one path, the argument of `set_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPolicy {
    /// Local interface the path leaves from.
    pub interface: InterfaceName,
    /// Requested state.
    pub state: PathState,
    /// Transmit ceiling in bytes per second (0 = auto).
    pub tx_max_rate: u64,
    /// Receive ceiling announced to the peer in bytes per second (0 = auto).
    pub rx_max_rate: u64,
    /// Interval between control messages.
    pub beat: Duration,
    /// Disable rate discovery and send at `tx_max_rate`.
    pub fixed_rate: bool,
    /// Carry traffic when every UP path is lossy.
    pub preferred: bool,
    /// Loss above which the path is lossy (0..=255, 255 = never).
    pub loss_limit: u8,
    /// Smoothed RTT above which the path is laggy.
    pub rtt_limit: Duration,
}

impl PathPolicy {
    /// Create a policy for an interface with default limits.
    pub fn new(interface: InterfaceName, state: PathState) -> Self {
        Self {
            interface,
            state,
            tx_max_rate: 0,
            rx_max_rate: 0,
            beat: DEFAULT_BEAT,
            fixed_rate: false,
            preferred: false,
            loss_limit: DEFAULT_LOSS_LIMIT,
            rtt_limit: DEFAULT_RTT_LIMIT,
        }
    }

    /// Set the transmit and receive ceilings.
    pub fn with_rates(mut self, tx_max_rate: u64, rx_max_rate: u64) -> Self {
        self.tx_max_rate = tx_max_rate;
        self.rx_max_rate = rx_max_rate;
        self
    }

    /// Set the message interval.
    pub fn with_beat(mut self, beat: Duration) -> Self {
        self.beat = beat;
        self
    }

    /// Pin the transmit rate to `tx_max_rate`.
    pub fn with_fixed_rate(mut self, fixed: bool) -> Self {
        self.fixed_rate = fixed;
        self
    }

    /// Mark the path as preferred backup.
    pub fn with_preferred(mut self, preferred: bool) -> Self {
        self.preferred = preferred;
        self
    }

    /// Set the loss limit.
    pub fn with_loss_limit(mut self, loss_limit: u8) -> Self {
        self.loss_limit = loss_limit;
        self
    }

    /// Set the RTT limit.
    pub fn with_rtt_limit(mut self, rtt_limit: Duration) -> Self {
        self.rtt_limit = rtt_limit;
        self
    }

    /// Check the policy is self-consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state == PathState::Empty {
            return Err(ConfigError::InvalidState(self.state.as_str()));
        }
        if self.beat < MIN_BEAT {
            return Err(ConfigError::InvalidBeat {
                min_ms: MIN_BEAT.as_millis() as u64,
                actual_ms: self.beat.as_millis() as u64,
            });
        }
        if self.rtt_limit.is_zero() {
            return Err(ConfigError::InvalidRttLimit);
        }
        if self.fixed_rate && self.tx_max_rate == 0 {
            return Err(ConfigError::FixedRateWithoutLimit);
        }
        Ok(())
    }
}
