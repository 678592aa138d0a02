use crate::error::{Result, TunnelError};
use crate::models::Endpoint;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Built-in relay pool used when `TUNNEL_ENDPOINTS` is unset
pub const DEFAULT_ENDPOINTS: &str = "157.240.195.32:8080,157.240.253.39:8080,\
157.240.196.32:8080,157.240.9.39:8080,31.13.83.39:8080,102.132.97.39:8080,\
31.13.84.39:8080,185.60.218.39:8080";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 14; SM-A245F \
Build/UP1A.231005.007; wv) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 \
Chrome/133.0.6943.138 Mobile Safari/537.36 [FBAN/InternetOrgApp;FBAV/166.0.0.0.169;]";

pub const DEFAULT_BSID: &str = "a08359b0-d7ec-4cb5-97bf-000bdc29ec87";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Tunnel engine configuration
    pub tunnel: TunnelConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address to bind to (default: 127.0.0.1)
    pub listen_host: String,
    /// Local port to listen on (default: 2323)
    pub listen_port: u16,
    /// Target requested in the CONNECT line
    pub remote_host: String,
    pub remote_port: u16,
    /// Whether the `Host:` header carries `:port`
    pub host_header_port: bool,
    /// Spoofed `User-Agent:` value
    pub user_agent: String,
    /// `x-iorg-bsid:` token
    pub bsid: Uuid,
    /// Upstream relay pool, rotated round-robin
    pub endpoints: Vec<Endpoint>,
    /// Fragmentation part count, 0 disables fragmentation
    pub parts: usize,
    /// Time between endpoint rotations
    pub rotation_interval: Duration,
    /// Dial attempts per session
    pub connect_retries: u32,
    /// Delay between dial attempts
    pub retry_delay: Duration,
    /// How often a live session re-checks the running flag
    pub poll_timeout: Duration,
    /// Per-attempt connect timeout
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 2323,
            remote_host: "lifetwist.net".to_string(),
            remote_port: 443,
            host_header_port: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            bsid: Uuid::parse_str(DEFAULT_BSID).unwrap_or_default(),
            endpoints: Endpoint::parse_list(DEFAULT_ENDPOINTS).unwrap_or_default(),
            parts: 32,
            rotation_interval: Duration::from_secs(20),
            connect_retries: 5,
            retry_delay: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    /// Get the local listen address
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }

    /// Check the settings `Engine::start` depends on
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(TunnelError::EmptyEndpointPool);
        }
        if self.connect_retries == 0 {
            return Err(TunnelError::InvalidConfig(
                "connect retries must be at least 1".into(),
            ));
        }
        if self.rotation_interval.is_zero() {
            return Err(TunnelError::InvalidConfig(
                "rotation interval must be non-zero".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(TunnelError::InvalidConfig(
                "poll timeout must be non-zero".into(),
            ));
        }
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("remote host is empty".into()));
        }
        for (name, value) in [
            ("remote host", &self.remote_host),
            ("user agent", &self.user_agent),
        ] {
            if value.contains(['\r', '\n']) {
                return Err(TunnelError::InvalidConfig(format!(
                    "{} must not contain line breaks",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            tunnel: TunnelConfig {
                listen_host: get_env_or("TUNNEL_LISTEN_HOST", "127.0.0.1"),
                listen_port: parse_env("TUNNEL_LISTEN_PORT", "2323", "a valid port number")?,
                remote_host: get_env_or("TUNNEL_REMOTE_HOST", "lifetwist.net"),
                remote_port: parse_env("TUNNEL_REMOTE_PORT", "443", "a valid port number")?,
                host_header_port: parse_env("TUNNEL_HOST_HEADER_PORT", "true", "true or false")?,
                user_agent: get_env_or("TUNNEL_USER_AGENT", DEFAULT_USER_AGENT),
                bsid: Uuid::parse_str(&get_env_or("TUNNEL_BSID", DEFAULT_BSID)).map_err(|e| {
                    TunnelError::InvalidConfig(format!("TUNNEL_BSID must be a UUID: {}", e))
                })?,
                endpoints: Endpoint::parse_list(&get_env_or(
                    "TUNNEL_ENDPOINTS",
                    DEFAULT_ENDPOINTS,
                ))
                .map_err(|e| TunnelError::InvalidConfig(format!("TUNNEL_ENDPOINTS: {}", e)))?,
                parts: parse_env("TUNNEL_PARTS", "32", "a non-negative number")?,
                rotation_interval: parse_secs("TUNNEL_ROTATION_INTERVAL", "20")?,
                connect_retries: parse_env("TUNNEL_CONNECT_RETRIES", "5", "a valid number")?,
                retry_delay: parse_secs("TUNNEL_RETRY_DELAY", "5")?,
                poll_timeout: parse_secs("TUNNEL_POLL_TIMEOUT", "1")?,
                dial_timeout: parse_secs("TUNNEL_DIAL_TIMEOUT", "10")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| TunnelError::InvalidConfig(format!("{} must be {}", key, expected)))
}

fn parse_secs(key: &str, default: &str) -> Result<Duration> {
    parse_env(key, default, "a number of seconds").map(Duration::from_secs)
}
