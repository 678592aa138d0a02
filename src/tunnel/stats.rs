//! In-memory traffic counters
//!
//! Nothing here is persisted; counters reset whenever the engine starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::models::{Endpoint, EndpointStats, StatsSnapshot};

#[derive(Debug, Default)]
struct EndpointCounters {
    sessions: u64,
    dial_failures: u64,
}

/// Engine-wide traffic counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    started_at: RwLock<Option<DateTime<Utc>>>,
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    failed_dials: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    endpoints: DashMap<Endpoint, EndpointCounters>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every counter and stamp a new start time
    pub fn reset(&self) {
        *self.started_at.write() = Some(Utc::now());
        self.total_sessions.store(0, Ordering::Relaxed);
        self.failed_dials.store(0, Ordering::Relaxed);
        self.bytes_upstream.store(0, Ordering::Relaxed);
        self.bytes_downstream.store(0, Ordering::Relaxed);
        self.endpoints.clear();
    }

    pub fn record_dial_failure(&self, endpoint: &Endpoint) {
        self.failed_dials.fetch_add(1, Ordering::Relaxed);
        self.endpoints
            .entry(endpoint.clone())
            .or_default()
            .dial_failures += 1;
    }

    pub fn record_bytes(&self, upstream: u64, downstream: u64) {
        self.bytes_upstream.fetch_add(upstream, Ordering::Relaxed);
        self.bytes_downstream
            .fetch_add(downstream, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut endpoints: Vec<EndpointStats> = self
            .endpoints
            .iter()
            .map(|entry| EndpointStats {
                endpoint: entry.key().clone(),
                sessions: entry.value().sessions,
                dial_failures: entry.value().dial_failures,
            })
            .collect();
        endpoints.sort_by(|a, b| {
            (a.endpoint.host.as_str(), a.endpoint.port)
                .cmp(&(b.endpoint.host.as_str(), b.endpoint.port))
        });

        StatsSnapshot {
            started_at: *self.started_at.read(),
            current_endpoint: None,
            rotations: 0,
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            endpoints,
        }
    }
}

/// Guard for tracking an active relay session
///
/// Counts the session on creation and releases it on drop, so every exit path
/// of a worker keeps `active_sessions` accurate.
pub struct SessionGuard {
    stats: Arc<TrafficStats>,
}

impl SessionGuard {
    pub fn new(stats: Arc<TrafficStats>, endpoint: &Endpoint) -> Self {
        stats.total_sessions.fetch_add(1, Ordering::Relaxed);
        stats.active_sessions.fetch_add(1, Ordering::Relaxed);
        stats.endpoints.entry(endpoint.clone()).or_default().sessions += 1;
        Self { stats }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = self
            .stats
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard_counts() {
        let stats = Arc::new(TrafficStats::new());
        let endpoint = Endpoint::new("10.0.0.1", 8080);

        let first = SessionGuard::new(stats.clone(), &endpoint);
        let second = SessionGuard::new(stats.clone(), &endpoint);
        assert_eq!(stats.active_sessions(), 2);

        drop(first);
        assert_eq!(stats.active_sessions(), 1);
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 2);
        assert_eq!(
            snapshot.endpoints,
            vec![EndpointStats {
                endpoint,
                sessions: 2,
                dial_failures: 0
            }]
        );
    }

    #[test]
    fn test_dial_failures_and_bytes() {
        let stats = TrafficStats::new();
        let a = Endpoint::new("10.0.0.2", 1);
        let b = Endpoint::new("10.0.0.1", 1);

        stats.record_dial_failure(&a);
        stats.record_dial_failure(&a);
        stats.record_dial_failure(&b);
        stats.record_bytes(100, 2000);
        stats.record_bytes(1, 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed_dials, 3);
        assert_eq!(snapshot.bytes_upstream, 101);
        assert_eq!(snapshot.bytes_downstream, 2002);
        assert_eq!(snapshot.endpoints[0].endpoint, b);
        assert_eq!(snapshot.endpoints[1].dial_failures, 2);
    }

    #[test]
    fn test_reset_keeps_active_sessions() {
        let stats = Arc::new(TrafficStats::new());
        let endpoint = Endpoint::new("10.0.0.1", 1);
        let _guard = SessionGuard::new(stats.clone(), &endpoint);
        stats.record_bytes(10, 10);

        stats.reset();

        let snapshot = stats.snapshot();
        assert!(snapshot.started_at.is_some());
        assert_eq!(snapshot.total_sessions, 0);
        assert_eq!(snapshot.bytes_upstream, 0);
        assert_eq!(snapshot.active_sessions, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = TrafficStats::new();
        stats.record_dial_failure(&Endpoint::new("10.0.0.1", 8080));

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["failed_dials"], 1);
        assert_eq!(json["endpoints"][0]["endpoint"]["port"], 8080);
    }
}
