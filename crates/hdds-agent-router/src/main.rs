// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Agent Router
//!
//! Relays framed messages between agents connected over TCP.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (33647)
//! hdds-agent-router
//!
//! # Config file, reserved agents and a short heartbeat
//! hdds-agent-router --config router.toml --reserved-agents agents.properties \
//!     --heartbeat-timeout 3000
//!
//! # Reload reserved agents of a running router
//! hdds-agent-router reload --cookie <admin cookie>
//!
//! # Print the diagnostic report of a running router
//! hdds-agent-router status --address 10.0.0.5:33647
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hdds_agent_router::{admin, MagicCookie, Router, RouterConfig, DEFAULT_PORT};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Timeout of the one-shot admin commands
const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// HDDS Agent Router - store-and-forward message relay between agents
#[derive(Parser, Debug)]
#[command(name = "hdds-agent-router")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Message processing threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Heartbeat timeout in milliseconds
    #[arg(long)]
    heartbeat_timeout: Option<u64>,

    /// Eviction timeout of disconnected dynamic agents in milliseconds (-1 disables)
    #[arg(long, allow_hyphen_values = true)]
    eviction_timeout: Option<i64>,

    /// Reserved agents file (properties format)
    #[arg(short, long)]
    reserved_agents: Option<PathBuf>,

    /// Threads sending heartbeats
    #[arg(long)]
    pinger_threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask a running router to reload its reserved agents
    Reload {
        /// Admin cookie (the `configuration` entry of the reserved agents file)
        #[arg(long)]
        cookie: MagicCookie,

        /// Router address
        #[arg(short, long, default_value_t = default_admin_address())]
        address: SocketAddr,
    },

    /// Print the diagnostic report of a running router
    Status {
        /// Router address
        #[arg(short, long, default_value_t = default_admin_address())]
        address: SocketAddr,
    },

    /// Generate a configuration file with every default
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "router.toml")]
        output: PathBuf,
    },
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    match &args.command {
        Some(Commands::Reload { cookie, address }) => cmd_reload(*address, cookie),
        Some(Commands::Status { address }) => cmd_status(*address),
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
        None => run(&args),
    }
}

fn build_config(args: &Args) -> Result<RouterConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            RouterConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?
        }
        None => RouterConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(timeout) = args.heartbeat_timeout {
        config.heartbeat_timeout_ms = timeout;
    }
    if let Some(timeout) = args.eviction_timeout {
        config.client_eviction_timeout_ms = timeout;
    }
    if let Some(path) = &args.reserved_agents {
        config.reserved_agents_file = Some(path.clone());
    }
    if let Some(threads) = args.pinger_threads {
        config.heartbeat_sender_threads = threads;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;

    info!("+----------------------------------------------------+");
    info!(
        "|        HDDS Agent Router v{:<24} |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:      {:38} |", config.listen_addr());
    info!("|  Workers:   {:38} |", config.worker_threads);
    info!(
        "|  Heartbeat: {:38} |",
        format!("{} ms", config.heartbeat_timeout_ms)
    );
    info!(
        "|  Eviction:  {:38} |",
        match config.eviction_timeout() {
            Some(timeout) => format!("{} ms", timeout.as_millis()),
            None => "disabled".to_string(),
        }
    );
    info!(
        "|  Reserved:  {:38} |",
        config
            .reserved_agents_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    info!("+----------------------------------------------------+");

    let mut handle = Router::start(config).context("Failed to start router")?;

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let _ = stop_rx.recv();
    handle.shutdown();

    let stats = handle.metrics().snapshot();
    info!(
        connections = stats.connections_accepted,
        forwarded = stats.messages_forwarded,
        queued = stats.messages_queued,
        registrations = stats.registrations,
        "Router shutdown complete"
    );
    Ok(())
}

fn cmd_reload(address: SocketAddr, cookie: &MagicCookie) -> Result<()> {
    admin::send_reload(address, cookie, ADMIN_TIMEOUT)
        .with_context(|| format!("Failed to send reload request to {}", address))?;
    println!("Reload request sent to {}", address);
    Ok(())
}

fn cmd_status(address: SocketAddr) -> Result<()> {
    let report = admin::query_debug(address, ADMIN_TIMEOUT)
        .with_context(|| format!("Failed to query {}", address))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_gen_config(output: &Path) -> Result<()> {
    let content = RouterConfig::default().to_toml_string()?;
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Generated configuration: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_defaults() {
        let args = Args::parse_from([
            "hdds-agent-router",
            "--port",
            "4000",
            "--heartbeat-timeout",
            "3000",
            "--eviction-timeout",
            "-1",
            "--pinger-threads",
            "2",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.heartbeat_timeout_ms, 3000);
        assert_eq!(config.client_eviction_timeout_ms, -1);
        assert_eq!(config.heartbeat_sender_threads, 2);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::parse_from(["hdds-agent-router", "--eviction-timeout", "0"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_reload_subcommand() {
        let args = Args::parse_from(["hdds-agent-router", "reload", "--cookie", "secret"]);
        match args.command {
            Some(Commands::Reload { cookie, address }) => {
                assert!(cookie.matches(&MagicCookie::from_text("secret").unwrap()));
                assert_eq!(address, default_admin_address());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
