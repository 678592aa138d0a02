//! Bidirectional relay between a client and its upstream
//!
//! Moves bytes in both directions until either side closes, an I/O error
//! occurs, or the engine's running flag is observed cleared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Read size for each direction
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Relay settings shared by every session
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Split each read into roughly this many writes, 0 disables
    pub parts: usize,
    /// How often a live session re-checks the running flag
    pub poll_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            parts: 0,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&TunnelConfig> for RelayConfig {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            parts: config.parts,
            poll_timeout: config.poll_timeout,
        }
    }
}

/// Why a relay session ended
#[derive(Debug)]
pub enum SessionEnd {
    ClientClosed,
    UpstreamClosed,
    /// The running flag was cleared
    Stopped,
    Failed(TunnelError),
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub end: SessionEnd,
    /// Bytes forwarded client -> upstream
    pub bytes_upstream: u64,
    /// Bytes forwarded upstream -> client
    pub bytes_downstream: u64,
}

/// Split `data` into the pieces written for one read
///
/// When `parts` is non-zero and the chunk is longer than `parts`, pieces are
/// `max(1, len / parts)` bytes with a shorter tail; otherwise the chunk is a
/// single piece. Concatenating the pieces always yields `data`.
pub fn fragment(data: &[u8], parts: usize) -> std::slice::Chunks<'_, u8> {
    let piece = if parts > 0 && data.len() > parts {
        (data.len() / parts).max(1)
    } else {
        data.len().max(1)
    };
    data.chunks(piece)
}

/// Write `data` as one send per fragment, preserving order
pub async fn write_fragmented<W>(writer: &mut W, data: &[u8], parts: usize) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for piece in fragment(data, parts) {
        writer.write_all(piece).await?;
    }
    Ok(())
}

/// Relay session runner
pub struct Relay;

impl Relay {
    /// Pump bytes between `client` and `upstream` until the session ends
    ///
    /// Both streams are dropped, and therefore closed, before this returns.
    #[instrument(skip_all, fields(parts = config.parts))]
    pub async fn run<C, U>(
        client: C,
        upstream: U,
        config: &RelayConfig,
        running: watch::Receiver<bool>,
    ) -> RelayOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let sent = AtomicU64::new(0);
        let received = AtomicU64::new(0);

        let end = tokio::select! {
            result = forward(&mut client_read, &mut upstream_write, config.parts, &sent) => {
                match result {
                    Ok(()) => SessionEnd::ClientClosed,
                    Err(e) => SessionEnd::Failed(TunnelError::Stream(e)),
                }
            }
            result = forward(&mut upstream_read, &mut client_write, config.parts, &received) => {
                match result {
                    Ok(()) => SessionEnd::UpstreamClosed,
                    Err(e) => SessionEnd::Failed(TunnelError::Stream(e)),
                }
            }
            _ = wait_stopped(&running, config.poll_timeout) => SessionEnd::Stopped,
        };

        let outcome = RelayOutcome {
            end,
            bytes_upstream: sent.load(Ordering::Relaxed),
            bytes_downstream: received.load(Ordering::Relaxed),
        };

        debug!(
            bytes_upstream = outcome.bytes_upstream,
            bytes_downstream = outcome.bytes_downstream,
            "Relay finished: {:?}",
            outcome.end
        );

        outcome
    }
}

/// Copy one direction until EOF, counting forwarded bytes into `counter`
async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    parts: usize,
    counter: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        write_fragmented(writer, &buf[..n], parts).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Resolve once the running flag is seen cleared at a poll wake-up
async fn wait_stopped(running: &watch::Receiver<bool>, poll: Duration) {
    loop {
        sleep(poll).await;
        if !*running.borrow() {
            return;
        }
    }
}
