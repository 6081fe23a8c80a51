//! relay-server - standalone headless host for session-relay-core.
//!
//! Wraps the library's UDP data plane and negotiator around a
//! newline-delimited JSON control-plane bridge on stdio: line in, line
//! out, one `ControlMessage` per line. An operator wires the actual
//! pub/sub broker connection to this process's stdin/stdout (or swaps
//! this binary for one with a real broker client) - the library itself
//! never assumes a transport.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use session_relay_core::negotiator::{ControlMessage, ControlPlaneTransport};
use session_relay_core::sink::LoggingSink;
use session_relay_core::{bootstrap_services, Sink};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::Mutex;

use crate::config::ServerConfig;

/// relay-server - headless UDP audio relay with a stdio control-plane bridge.
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RELAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port for the UDP data plane (overrides config file).
    #[arg(short = 'p', long, env = "RELAY_UDP_PORT")]
    port: Option<u16>,
}

/// Bridges the negotiator to stdio: each line of stdin is parsed as one
/// [`ControlMessage`], each outbound message is serialized as one line
/// of stdout.
struct StdioTransport {
    lines: Mutex<io::Lines<BufReader<io::Stdin>>>,
    stdout: Mutex<io::Stdout>,
}

impl StdioTransport {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(io::stdin()).lines()),
            stdout: Mutex::new(io::stdout()),
        }
    }
}

#[async_trait]
impl ControlPlaneTransport for StdioTransport {
    async fn recv(&self) -> Option<ControlMessage> {
        loop {
            let line = self.lines.lock().await.next_line().await.ok()??;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    log::warn!("dropping unparsable control-plane line: {e}");
                    continue;
                }
            }
        }
    }

    async fn send(&self, msg: ControlMessage) {
        let Ok(mut line) = serde_json::to_string(&msg) else {
            log::error!("failed to serialize outbound control message");
            return;
        };
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            log::error!("failed to write control-plane reply: {e}");
        }
        let _ = stdout.flush().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("relay-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.udp_port = port;
    }

    let core_config = config.to_core_config();
    core_config
        .validate()
        .context("invalid configuration")?;

    let control_plane = Arc::new(StdioTransport::new());
    let sink: Arc<dyn Sink> = Arc::new(LoggingSink);

    let services = bootstrap_services(&core_config, control_plane, sink)
        .await
        .context("failed to bootstrap services")?;

    log::info!("listening for UDP audio on {}", services.udp_endpoint);

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");
    services.shutdown().await;
    log::info!("shutdown complete");

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
