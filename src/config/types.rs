//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

/// Listener-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where victim connections are accepted.
    pub listen_addr: SocketAddr,
    /// Budget for each leg's handshake, kex through authentication.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Optional hard deadline per intercepted session.
    #[serde(default, with = "humantime_serde::option")]
    pub session_timeout: Option<Duration>,
    /// How long shutdown waits for sessions to drain.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// The real server sessions are relayed to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub addr: SocketAddr,
    /// Budget for dialing the real server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Impersonated host key configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Private key file (OpenSSH/PEM). When absent a fresh RSA key is
    /// generated at startup.
    pub key_file: Option<PathBuf>,
    pub rsa_bits: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            identity: IdentityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2222".parse().expect("valid default listen addr"),
            handshake_timeout: Duration::from_secs(15),
            session_timeout: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:22".parse().expect("valid default upstream addr"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            rsa_bits: identity::DEFAULT_RSA_BITS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
