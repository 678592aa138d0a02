//! Spoofed CONNECT request sent to every upstream relay

use bytes::Bytes;
use uuid::Uuid;

use crate::config::TunnelConfig;

/// Pre-rendered CONNECT handshake
///
/// The request is rendered once and shared by every session; it is written
/// verbatim and the far end's reply is never parsed.
#[derive(Debug, Clone)]
pub struct Handshake {
    request: Bytes,
}

impl Handshake {
    pub fn new(
        remote_host: &str,
        remote_port: u16,
        host_header_port: bool,
        user_agent: &str,
        bsid: &Uuid,
    ) -> Self {
        let authority = format!("{}:{}", remote_host, remote_port);
        let host_header = if host_header_port {
            authority.as_str()
        } else {
            remote_host
        };

        let request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nx-iorg-bsid: {}\r\n\r\n",
            authority, host_header, user_agent, bsid
        );

        Self {
            request: Bytes::from(request),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(
            &config.remote_host,
            config.remote_port,
            config.host_header_port,
            &config.user_agent,
            &config.bsid,
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.request
    }
}
