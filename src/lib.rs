//! Karlsen Stratum Bridge
//!
//! Connects stratum miners (ASIC and GPU) to a Karlsen full node:
//! - Stratum handshake with wallet address normalization
//! - Pluggable per-method handlers shared by every connection
//! - Upstream node session with sync monitoring and automatic reconnect
//! - Job broadcast driven by node notifications with a polling fallback

pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod node;
pub mod stats;
pub mod stratum;

pub use bridge::{BridgeSettings, UpstreamBridge};
pub use config::{Args, BridgeConfig};
pub use error::{Error, Result};

/// Application information
pub const APP_NAME: &str = "karlsen-stratum-bridge";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
