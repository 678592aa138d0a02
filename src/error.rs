use thiserror::Error;

use crate::models::Endpoint;

/// Unified error type for the tunnel engine
#[derive(Error, Debug)]
pub enum TunnelError {
    // Listener errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    // Upstream errors
    #[error("Upstream {endpoint} unreachable after {attempts} attempts")]
    DialFailed { endpoint: Endpoint, attempts: u32 },

    #[error("CONNECT handshake to {endpoint} failed: {source}")]
    Handshake {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    // Session errors
    #[error("Stream error: {0}")]
    Stream(std::io::Error),

    // Configuration errors
    #[error("Endpoint pool is empty")]
    EmptyEndpointPool,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Errors that `Engine::start` is allowed to surface to its caller.
    ///
    /// Everything else is scoped to a single session or the accept loop and is
    /// logged rather than propagated.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::Bind { .. }
                | TunnelError::EmptyEndpointPool
                | TunnelError::InvalidEndpoint(_)
                | TunnelError::InvalidConfig(_)
        )
    }

    /// Check if this error only ends one relay session
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            TunnelError::DialFailed { .. }
                | TunnelError::Handshake { .. }
                | TunnelError::Stream(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.1", 8080)
    }

    #[test]
    fn test_startup_failure_classification() {
        let bind = TunnelError::Bind {
            addr: "127.0.0.1:2323".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_startup_failure());
        assert!(TunnelError::EmptyEndpointPool.is_startup_failure());
        assert!(TunnelError::InvalidConfig("bad".to_string()).is_startup_failure());

        assert!(!TunnelError::DialFailed {
            endpoint: endpoint(),
            attempts: 5
        }
        .is_startup_failure());
        assert!(
            !TunnelError::Accept(std::io::Error::from(std::io::ErrorKind::Other))
                .is_startup_failure()
        );
    }

    #[test]
    fn test_session_error_classification() {
        assert!(TunnelError::DialFailed {
            endpoint: endpoint(),
            attempts: 3
        }
        .is_session_error());
        assert!(
            TunnelError::Stream(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                .is_session_error()
        );
        assert!(!TunnelError::EmptyEndpointPool.is_session_error());
    }

    #[test]
    fn test_error_messages() {
        let err = TunnelError::DialFailed {
            endpoint: endpoint(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Upstream 10.0.0.1:8080 unreachable after 3 attempts"
        );
        assert_eq!(
            TunnelError::EmptyEndpointPool.to_string(),
            "Endpoint pool is empty"
        );
    }
}
