use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Endpoint;

/// Point-in-time view of the engine's in-memory traffic counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    /// When the engine last entered the running state
    pub started_at: Option<DateTime<Utc>>,
    /// Endpoint new sessions are currently dialing
    pub current_endpoint: Option<Endpoint>,
    /// Rotation ticks since start
    pub rotations: u64,
    /// Sessions whose upstream handshake was sent
    pub total_sessions: u64,
    /// Sessions still relaying
    pub active_sessions: u64,
    /// Sessions abandoned after retry exhaustion
    pub failed_dials: u64,
    /// Bytes relayed client -> upstream
    pub bytes_upstream: u64,
    /// Bytes relayed upstream -> client
    pub bytes_downstream: u64,
    pub endpoints: Vec<EndpointStats>,
}

/// Per-endpoint counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointStats {
    pub endpoint: Endpoint,
    pub sessions: u64,
    pub dial_failures: u64,
}
