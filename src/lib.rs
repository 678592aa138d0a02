//! Rotunnel - CONNECT tunnel relay
//!
//! Accepts local TCP clients and tunnels each one to a fixed remote target
//! through a rotating pool of upstream relays.
//!
//! ## Features
//!
//! - Spoofed HTTP CONNECT handshake sent to every upstream
//! - Round-robin endpoint rotation on a fixed interval
//! - Bounded dial retries per session
//! - Optional fragmentation of relayed chunks into smaller writes
//! - Cooperative start/stop with in-memory traffic statistics

pub mod config;
pub mod error;
pub mod models;
pub mod tunnel;

pub use config::Config;
pub use error::{Result, TunnelError};
pub use tunnel::{Engine, EngineState};
