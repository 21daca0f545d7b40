//! relay-bridge entry point.
//!
//! This binary connects to a machine-control process over its Unix socket and
//! serves any number of JSON-RPC clients on top of that single connection.
//! Clients can query and subscribe to printer objects and manage a queue of
//! print jobs that the relay starts one after another.
//!
//! # Why a separate relay process?
//!
//! The control process accepts one local connection and speaks a compact
//! framed protocol.  Dashboards, automation scripts and remote services all
//! want their own view of it.  The relay owns the one connection and gives
//! every client its own subscriptions, while sending the control process a
//! single merged subscription.
//!
//! # Usage
//!
//! ```text
//! relay-bridge [OPTIONS]
//!
//! Options:
//!   --config      <PATH>   TOML configuration file [default: relay-bridge.toml]
//!   --socket-path <PATH>   Control-process Unix socket
//!   --ws-port     <PORT>   WebSocket listener port
//!   --http-port   <PORT>   HTTP listener port
//!   --log-level   <LEVEL>  Log filter used when RUST_LOG is unset
//! ```
//!
//! # Environment variable overrides
//!
//! Every option can also be given as an environment variable.  Precedence is
//! CLI argument, then environment variable, then config file, then built-in
//! default.
//!
//! | Variable             | Overrides                 |
//! |----------------------|---------------------------|
//! | `RELAY_CONFIG`       | config file path          |
//! | `RELAY_SOCKET_PATH`  | `upstream.socket_path`    |
//! | `RELAY_WS_PORT`      | `server.ws_port`          |
//! | `RELAY_HTTP_PORT`    | `server.http_port`        |
//! | `RELAY_LOG_LEVEL`    | `log_level`               |

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_bridge::domain::{load_config, BridgeConfig};
use relay_bridge::infrastructure::run_relay;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Local broker between a machine-control process and JSON-RPC clients.
///
/// The `#[derive(Parser)]` macro from `clap` generates the argument parser
/// automatically from the struct fields and their `#[arg(...)]` attributes.
#[derive(Debug, Parser)]
#[command(
    name = "relay-bridge",
    about = "Shares one control-process connection between many JSON-RPC clients",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// A missing file is not an error; the built-in defaults are used.
    #[arg(long, default_value = "relay-bridge.toml", env = "RELAY_CONFIG")]
    config: PathBuf,

    /// Unix socket of the control process.
    #[arg(long, env = "RELAY_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// WebSocket (duplex) listener port.
    #[arg(long, env = "RELAY_WS_PORT")]
    ws_port: Option<u16>,

    /// HTTP (request-response) listener port.
    #[arg(long, env = "RELAY_HTTP_PORT")]
    http_port: Option<u16>,

    /// `tracing` filter used when `RUST_LOG` is not set, e.g. `debug`.
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the config file and applies the CLI overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load config from {}", self.config.display()))?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(self, config: &mut BridgeConfig) {
        if let Some(path) = self.socket_path {
            config.upstream.socket_path = path;
        }
        if let Some(port) = self.ws_port {
            config.server.ws_port = port;
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and merged with the config file.
/// 2. `tracing_subscriber` is initialised.  `RUST_LOG` wins over the
///    configured `log_level`.
/// 3. A Ctrl+C handler is spawned; it clears a shared `AtomicBool`.
/// 4. [`run_relay`] starts the link, the event loop and every listener and
///    returns once they have all stopped.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_bridge_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        socket = %config.upstream.socket_path.display(),
        ws_port = config.server.ws_port,
        http_port = config.server.http_port,
        topic = config.topic.enabled,
        "relay-bridge starting"
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_relay(config, running).await?;

    info!("relay-bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
