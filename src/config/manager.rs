//! Configuration Manager

use super::Config;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::identity;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .context("Configuration validation failed")?;

            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(listen_addr) = std::env::var("SSHMONKEY_LISTEN_ADDR") {
            config.server.listen_addr = listen_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid SSHMONKEY_LISTEN_ADDR: {}", listen_addr))?;
        }

        if let Ok(upstream_addr) = std::env::var("SSHMONKEY_UPSTREAM_ADDR") {
            config.upstream.addr = upstream_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid SSHMONKEY_UPSTREAM_ADDR: {}", upstream_addr))?;
        }

        if let Ok(timeout) = std::env::var("SSHMONKEY_HANDSHAKE_TIMEOUT") {
            config.server.handshake_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid SSHMONKEY_HANDSHAKE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("SSHMONKEY_SESSION_TIMEOUT") {
            config.server.session_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid SSHMONKEY_SESSION_TIMEOUT: {}", timeout))?,
            );
        }

        if let Ok(key_file) = std::env::var("SSHMONKEY_KEY_FILE") {
            config.identity.key_file = Some(key_file.into());
        }

        if let Ok(rsa_bits) = std::env::var("SSHMONKEY_RSA_BITS") {
            config.identity.rsa_bits = rsa_bits
                .parse::<usize>()
                .with_context(|| format!("Invalid SSHMONKEY_RSA_BITS: {}", rsa_bits))?;
        }

        if let Ok(log_level) = std::env::var("SSHMONKEY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.handshake_timeout.as_secs() == 0 {
            bail!("server.handshake_timeout must be greater than 0");
        }

        if let Some(session_timeout) = self.server.session_timeout {
            if session_timeout < self.server.handshake_timeout {
                bail!("server.session_timeout must not be shorter than the handshake timeout");
            }
        }

        if self.server.listen_addr == self.upstream.addr {
            bail!("server.listen_addr and upstream.addr must differ, the proxy would dial itself");
        }

        if !(identity::MIN_RSA_BITS..=identity::MAX_RSA_BITS).contains(&self.identity.rsa_bits) {
            bail!(
                "identity.rsa_bits must be between {} and {}",
                identity::MIN_RSA_BITS,
                identity::MAX_RSA_BITS
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments (highest priority)
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&str>,
        connect: Option<&str>,
        key_file: Option<&Path>,
        rsa_bits: Option<usize>,
        session_timeout: Option<u64>,
    ) {
        if let Some(listen_str) = listen {
            if let Ok(addr) = listen_str.parse::<SocketAddr>() {
                self.server.listen_addr = addr;
                tracing::info!("CLI override: listen address set to {}", addr);
            } else {
                tracing::warn!("Invalid listen address provided: {}", listen_str);
            }
        }

        if let Some(connect_str) = connect {
            if let Ok(addr) = connect_str.parse::<SocketAddr>() {
                self.upstream.addr = addr;
                tracing::info!("CLI override: upstream address set to {}", addr);
            } else {
                tracing::warn!("Invalid upstream address provided: {}", connect_str);
            }
        }

        if let Some(path) = key_file {
            self.identity.key_file = Some(path.to_path_buf());
            tracing::info!("CLI override: host key file set to {}", path.display());
        }

        if let Some(bits) = rsa_bits {
            self.identity.rsa_bits = bits;
            tracing::info!("CLI override: host key strength set to {} bits", bits);
        }

        if let Some(secs) = session_timeout {
            self.server.session_timeout = Some(std::time::Duration::from_secs(secs));
            tracing::info!("CLI override: session timeout set to {}s", secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_self_dialing_proxy() {
        let mut config = Config::default();
        config.server.listen_addr = config.upstream.addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_key_strength() {
        let mut config = Config::default();
        config.identity.rsa_bits = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_with_durations() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:2222"
            handshake_timeout = "5s"
            session_timeout = "2m"

            [upstream]
            addr = "192.0.2.10:22"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.server.session_timeout,
            Some(std::time::Duration::from_secs(120))
        );
        assert_eq!(config.upstream.addr.port(), 22);
    }

    #[test]
    fn cli_args_take_precedence() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some("127.0.0.1:2200"), None, None, Some(3072), Some(60));
        assert_eq!(config.server.listen_addr.port(), 2200);
        assert_eq!(config.identity.rsa_bits, 3072);
        assert!(config.validate().is_ok());
    }
}
