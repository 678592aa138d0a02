use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

/// Upstream relay endpoint
///
/// Identity is value equality of host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` pair. IPv6 hosts must be bracketed (`[::1]:8080`).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidEndpoint(format!("missing port in '{}'", s)))?;

        let (host, bracketed) = match host.strip_prefix('[') {
            Some(inner) => {
                let inner = inner.strip_suffix(']').ok_or_else(|| {
                    TunnelError::InvalidEndpoint(format!("unclosed '[' in '{}'", s))
                })?;
                (inner, true)
            }
            None => (host, false),
        };

        if host.is_empty() {
            return Err(TunnelError::InvalidEndpoint(format!(
                "missing host in '{}'",
                s
            )));
        }
        if host.contains(['[', ']']) {
            return Err(TunnelError::InvalidEndpoint(format!(
                "stray bracket in '{}'",
                s
            )));
        }
        if host.contains(':') && !bracketed {
            return Err(TunnelError::InvalidEndpoint(format!(
                "IPv6 host must be bracketed in '{}'",
                s
            )));
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| TunnelError::InvalidEndpoint(format!("invalid port in '{}'", s)))?;

        Ok(Self::new(host, port))
    }

    /// Parse a comma separated endpoint list, skipping blank entries
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Address string suitable for `TcpStream::connect`
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("157.240.195.32:8080").unwrap(),
            Endpoint::new("157.240.195.32", 8080)
        );
        assert_eq!(
            Endpoint::parse(" relay.example:443 ").unwrap(),
            Endpoint::new("relay.example", 443)
        );
        assert_eq!(
            Endpoint::parse("[::1]:9000").unwrap(),
            Endpoint::new("::1", 9000)
        );
    }

    #[test]
    fn test_endpoint_parse_rejects_malformed() {
        for bad in [
            "relay.example",
            ":8080",
            "host:",
            "host:99999",
            "::1:80",
            "[::1:80",
            "[]:80",
            "::1]:80",
            "[::1]]:80",
        ] {
            assert!(
                matches!(Endpoint::parse(bad), Err(TunnelError::InvalidEndpoint(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_endpoint_parse_list() {
        let list = Endpoint::parse_list("a.example:1, b.example:2,,").unwrap();
        assert_eq!(
            list,
            vec![Endpoint::new("a.example", 1), Endpoint::new("b.example", 2)]
        );

        assert!(Endpoint::parse_list("").unwrap().is_empty());
        assert!(Endpoint::parse_list("a.example:1,broken").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 8080).to_string(), "10.0.0.1:8080");
        assert_eq!(Endpoint::new("::1", 8080).to_string(), "[::1]:8080");
    }
}
