//! mptun - Core types, constants, and configuration.
//!
//! This module provides the foundational types shared by every layer:
//! protocol constants, error types, validated configuration values and the
//! [`Transport`] seam the tunnel drives.

mod config;
mod constants;
mod error;
mod traits;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use traits::*;
