//! Path quality engine.
//!
//! Everything here is pure state driven by explicit timestamps, so it can be
//! exercised without sockets:
//!
//! - [`Stat`]: smoothed mean and deviation for RTT samples
//! - [`MtuProber`]: binary-search MTU discovery
//! - [`RateController`]: token bucket with AIMD rate discovery
//! - [`PathState`] and [`Path`]: per-path state machine and health
//! - [`PathTable`]: fixed-capacity arena and payload path selection

mod mtu;
#[allow(clippy::module_inception)]
mod path;
mod rate;
mod stat;
mod state;
mod table;

pub use mtu::MtuProber;
pub use path::{Counters, MsgCounters, MsgStats, Path, PathOrigin, Reply, Request, Tick};
pub use rate::{RateController, TokenBucket};
pub use stat::Stat;
pub use state::PathState;
pub use table::PathTable;
