//! Upstream connector: dial with bounded retries, then send the handshake
//!
//! Handles establishing connections to the rotating relay endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::models::Endpoint;
use crate::tunnel::handshake::Handshake;

/// Trait for upstream connections
pub trait UpstreamConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> UpstreamConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens raw connections to upstream endpoints
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn UpstreamConnection>>;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn UpstreamConnection>> {
        let stream = TcpStream::connect(endpoint.socket_addr_string()).await?;
        Ok(Box::new(stream))
    }
}

/// Retry policy for upstream dials
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Total dial attempts before giving up
    pub max_retries: u32,
    /// Pause between failed attempts
    pub retry_delay: Duration,
    /// Bound on a single attempt
    pub dial_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TunnelConfig> for ConnectorConfig {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            max_retries: config.connect_retries,
            retry_delay: config.retry_delay,
            dial_timeout: config.dial_timeout,
        }
    }
}

/// Dials upstream endpoints and performs the CONNECT handshake
pub struct Connector {
    dialer: Arc<dyn Dialer>,
    config: ConnectorConfig,
    handshake: Handshake,
}

impl Connector {
    pub fn new(dialer: Arc<dyn Dialer>, config: ConnectorConfig, handshake: Handshake) -> Self {
        Self {
            dialer,
            config,
            handshake,
        }
    }

    /// Dial `endpoint` and send the handshake
    ///
    /// The handshake is fire-and-forget: no reply is awaited, so a relay that
    /// rejects the request only shows up later as a read failure in the pump.
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn UpstreamConnection>> {
        let mut upstream = self.dial_with_retry(endpoint).await?;

        upstream
            .write_all(self.handshake.as_bytes())
            .await
            .map_err(|source| TunnelError::Handshake {
                endpoint: endpoint.clone(),
                source,
            })?;

        debug!("CONNECT handshake sent to {}", endpoint);
        Ok(upstream)
    }

    async fn dial_with_retry(&self, endpoint: &Endpoint) -> Result<Box<dyn UpstreamConnection>> {
        let max_attempts = self.config.max_retries.max(1);

        for attempt in 1..=max_attempts {
            let outcome = timeout(self.config.dial_timeout, self.dialer.dial(endpoint)).await;

            let error = match outcome {
                Ok(Ok(connection)) => {
                    debug!("Connected to {} (attempt {}/{})", endpoint, attempt, max_attempts);
                    return Ok(connection);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", self.config.dial_timeout.as_secs_f64()),
            };

            warn!(
                "Dial to {} failed: {} (attempt {}/{})",
                endpoint, error, attempt, max_attempts
            );

            if attempt < max_attempts {
                sleep(self.config.retry_delay).await;
            }
        }

        Err(TunnelError::DialFailed {
            endpoint: endpoint.clone(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn handshake() -> Handshake {
        Handshake::new("target.example", 443, true, "UA", &Uuid::nil())
    }

    fn fast_config(max_retries: u32, delay_ms: u64) -> ConnectorConfig {
        ConnectorConfig {
            max_retries,
            retry_delay: Duration::from_millis(delay_ms),
            dial_timeout: Duration::from_secs(1),
        }
    }

    /// Refuses every dial and records when each attempt happened
    #[derive(Default)]
    struct RefusingDialer {
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _: &Endpoint) -> std::io::Result<Box<dyn UpstreamConnection>> {
            self.attempts.lock().push(Instant::now());
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        }
    }

    /// Fails a fixed number of times, then hands out a scripted mock
    struct FlakyDialer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn dial(&self, _: &Endpoint) -> std::io::Result<Box<dyn UpstreamConnection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
            }
            let mock = tokio_test::io::Builder::new()
                .write(handshake().as_bytes())
                .build();
            Ok(Box::new(mock))
        }
    }

    /// Never completes a dial
    struct HangingDialer;

    #[async_trait]
    impl Dialer for HangingDialer {
        async fn dial(&self, _: &Endpoint) -> std::io::Result<Box<dyn UpstreamConnection>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_retry_exhaustion_counts_attempts() {
        let dialer = Arc::new(RefusingDialer::default());
        let connector = Connector::new(dialer.clone(), fast_config(3, 40), handshake());
        let endpoint = Endpoint::new("10.255.255.1", 8080);

        let err = connector.connect(&endpoint).await.err().unwrap();

        assert!(matches!(
            err,
            TunnelError::DialFailed { ref endpoint, attempts: 3 } if endpoint.port == 8080
        ));

        let attempts = dialer.attempts.lock();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn test_no_delay_after_final_attempt() {
        let dialer = Arc::new(RefusingDialer::default());
        let connector = Connector::new(dialer.clone(), fast_config(1, 5_000), handshake());

        let started = Instant::now();
        let result = connector.connect(&Endpoint::new("10.0.0.1", 1)).await;

        assert!(result.is_err());
        assert_eq!(dialer.attempts.lock().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let dialer = Arc::new(FlakyDialer {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let connector = Connector::new(dialer.clone(), fast_config(5, 1), handshake());

        let result = connector.connect(&Endpoint::new("10.0.0.1", 1)).await;

        tokio_test::assert_ok!(result);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dial_timeout_counts_as_failed_attempt() {
        let config = ConnectorConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            dial_timeout: Duration::from_millis(20),
        };
        let connector = Connector::new(Arc::new(HangingDialer), config, handshake());

        let err = connector
            .connect(&Endpoint::new("10.0.0.1", 1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::DialFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_handshake_sent_without_waiting_for_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; handshake().as_bytes().len()];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = Connector::new(Arc::new(TcpDialer), fast_config(1, 1), handshake());
        let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

        // The relay never answers; connect must still return
        let upstream = tokio::time::timeout(Duration::from_secs(2), connector.connect(&endpoint))
            .await
            .expect("connect waited for a reply");
        assert!(upstream.is_ok());

        let received = relay.await.unwrap();
        assert_eq!(received, handshake().as_bytes());
    }
}
