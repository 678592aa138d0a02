//! Tunnel relay engine
//!
//! This module provides the core tunnel functionality including:
//! - Listener and lifecycle control
//! - Upstream dialing with retry and the spoofed CONNECT handshake
//! - Bidirectional relay with optional write fragmentation
//! - Round-robin endpoint rotation on a timer

pub mod handshake;
pub mod relay;
pub mod rotation;
pub mod server;
pub mod stats;
pub mod transport;

pub use handshake::Handshake;
pub use relay::{Relay, RelayConfig, RelayOutcome, SessionEnd};
pub use rotation::Rotator;
pub use server::{Engine, EngineState};
pub use stats::TrafficStats;
pub use transport::{Connector, ConnectorConfig, Dialer, TcpDialer, UpstreamConnection};
