//! Listener and lifecycle controller
//!
//! Owns the listening socket and the running flag, spawns one relay session
//! per accepted client, and exposes the control surface used by front-ends.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::models::{Endpoint, StatsSnapshot};
use crate::tunnel::handshake::Handshake;
use crate::tunnel::relay::{Relay, RelayConfig, SessionEnd};
use crate::tunnel::rotation::Rotator;
use crate::tunnel::stats::{SessionGuard, TrafficStats};
use crate::tunnel::transport::{Connector, ConnectorConfig, Dialer, TcpDialer};

/// Backlog requested for the listening socket; the kernel clamps it to its
/// own maximum.
const LISTEN_BACKLOG: u32 = 4096;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a session worker needs, shared across workers
struct SessionContext {
    rotator: Arc<Rotator>,
    connector: Connector,
    relay: RelayConfig,
    stats: Arc<TrafficStats>,
    running: watch::Receiver<bool>,
}

#[derive(Default)]
struct Inner {
    state: EngineState,
    local_addr: Option<SocketAddr>,
    /// Running flag of the current run; each start gets a fresh channel so a
    /// stopped run's sessions can never observe a later run as running
    running: Option<watch::Sender<bool>>,
    /// Rotator of the current or most recent run
    rotator: Option<Arc<Rotator>>,
    accept_task: Option<JoinHandle<()>>,
    rotation_task: Option<JoinHandle<()>>,
}

/// Tunnel relay engine
pub struct Engine {
    config: TunnelConfig,
    dialer: Arc<dyn Dialer>,
    stats: Arc<TrafficStats>,
    inner: Mutex<Inner>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Create a stopped engine that dials upstreams over plain TCP
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    pub fn with_dialer(config: TunnelConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            stats: Arc::new(TrafficStats::new()),
            inner: Mutex::new(Inner::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Bind the listener and start accepting clients
    ///
    /// Returns once the engine is running; the accept loop and the rotation
    /// timer continue on their own tasks. A no-op if already running. Only
    /// configuration and bind failures are returned.
    #[instrument(skip(self), fields(listen = %self.config.listen_addr()))]
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut inner = self.inner.lock();
            if inner.state == EngineState::Running {
                debug!("Engine already running");
                return Ok(());
            }
            inner.state = EngineState::Starting;
        }

        match self.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to start tunnel engine: {}", e);
                self.inner.lock().state = EngineState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<()> {
        self.config.validate()?;
        let rotator = Arc::new(Rotator::new(self.config.endpoints.clone())?);

        let listener = bind_listener(&self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        self.stats.reset();
        let (running, _) = watch::channel(true);

        let rotation_task = {
            let rotator = rotator.clone();
            let period = self.config.rotation_interval;
            let running = running.subscribe();
            tokio::spawn(async move { rotator.run(period, running).await })
        };

        let context = Arc::new(SessionContext {
            rotator: rotator.clone(),
            connector: Connector::new(
                self.dialer.clone(),
                ConnectorConfig::from(&self.config),
                Handshake::from_config(&self.config),
            ),
            relay: RelayConfig::from(&self.config),
            stats: self.stats.clone(),
            running: running.subscribe(),
        });
        let accept_task = tokio::spawn(accept_loop(listener, context, running.subscribe()));

        let mut inner = self.inner.lock();
        inner.state = EngineState::Running;
        inner.local_addr = Some(local_addr);
        inner.running = Some(running);
        inner.rotator = Some(rotator.clone());
        inner.accept_task = Some(accept_task);
        inner.rotation_task = Some(rotation_task);

        info!(
            "Tunnel listening on {}, forwarding to {}:{} via {} endpoints (parts: {})",
            local_addr,
            self.config.remote_host,
            self.config.remote_port,
            rotator.pool().len(),
            self.config.parts
        );
        Ok(())
    }

    /// Stop accepting clients and halt rotation
    ///
    /// Returns once the listening socket is closed. Live sessions are not
    /// severed; each ends on its own or at its next running-flag check.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let (running, accept_task, rotation_task) = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Running {
                return;
            }
            inner.state = EngineState::Stopping;
            (
                inner.running.take(),
                inner.accept_task.take(),
                inner.rotation_task.take(),
            )
        };

        if let Some(running) = running {
            running.send_replace(false);
        }

        for task in [accept_task, rotation_task].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }

        let mut inner = self.inner.lock();
        inner.state = EngineState::Stopped;
        inner.local_addr = None;

        info!(
            "Tunnel stopped ({} sessions still winding down)",
            self.stats.active_sessions()
        );
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Endpoint new sessions would dial, while running
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        let inner = self.inner.lock();
        if inner.state != EngineState::Running {
            return None;
        }
        inner.rotator.as_ref().map(|r| r.current())
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Counters of the current run, or of the last one once stopped
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        if let Some(rotator) = self.inner.lock().rotator.as_ref() {
            snapshot.current_endpoint = Some(rotator.current());
            snapshot.rotations = rotator.rotations();
        }
        snapshot
    }
}

/// Bind with SO_REUSEADDR and a large backlog
async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_error = |source: std::io::Error| TunnelError::Bind {
        addr: addr.to_string(),
        source,
    };

    let sock_addr = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| TunnelError::InvalidConfig(format!("cannot resolve {}", addr)))?;

    let socket = if sock_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;

    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(sock_addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// Accept clients until the running flag clears, then drop the listener
async fn accept_loop(
    listener: TcpListener,
    context: Arc<SessionContext>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    info!("Accept loop shutting down");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client_addr)) => {
                        tokio::spawn(handle_session(stream, client_addr, context.clone()));
                    }
                    Err(e) => {
                        if *running.borrow() {
                            error!("{}", TunnelError::Accept(e));
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Dial, handshake and relay for one client
///
/// Every failure here is scoped to this session and only logged.
#[instrument(skip(client, context), fields(client = %client_addr))]
async fn handle_session(client: TcpStream, client_addr: SocketAddr, context: Arc<SessionContext>) {
    let endpoint = context.rotator.current();
    info!("Connection from {} via {}", client_addr, endpoint);

    let upstream = match context.connector.connect(&endpoint).await {
        Ok(upstream) => upstream,
        Err(e) => {
            if matches!(e, TunnelError::DialFailed { .. }) {
                context.stats.record_dial_failure(&endpoint);
            }
            if e.is_session_error() {
                warn!("Session from {} aborted: {}", client_addr, e);
            } else {
                error!("Session from {} aborted: {}", client_addr, e);
            }
            return;
        }
    };

    let _guard = SessionGuard::new(context.stats.clone(), &endpoint);
    let outcome = Relay::run(client, upstream, &context.relay, context.running.clone()).await;
    context
        .stats
        .record_bytes(outcome.bytes_upstream, outcome.bytes_downstream);

    match outcome.end {
        SessionEnd::Failed(e) if e.is_session_error() => {
            warn!("Session from {} failed: {}", client_addr, e)
        }
        SessionEnd::Failed(e) => error!("Session from {} failed: {}", client_addr, e),
        SessionEnd::ClientClosed => info!("Client {} closed the connection", client_addr),
        SessionEnd::UpstreamClosed => info!("Upstream {} closed the connection", endpoint),
        SessionEnd::Stopped => info!("Session from {} ended by shutdown", client_addr),
    }
    debug!(
        bytes_upstream = outcome.bytes_upstream,
        bytes_downstream = outcome.bytes_downstream,
        "Connection with {} closed",
        client_addr
    );
}
