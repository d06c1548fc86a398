//! relay64: IPv6-to-IPv4 TCP relay.
//!
//! Listens on a fixed set of ports on the IPv6 wildcard address and forwards
//! every connection to the IPv4 address embedded in the last four groups of
//! its destination, unless that address is private, loopback, reserved or
//! multicast.

mod config;
mod gateway;
mod preflight;

use clap::Parser;
use config::{ConfigOverrides, RelayConfig};
use gateway::{ConnectionHandler, ListenerSet};
use relay64_core::RelayError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// relay64: IPv6-to-IPv4 TCP relay
#[derive(Parser, Debug)]
#[command(name = "relay64", version, about = "IPv6-to-IPv4 TCP relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.relay64/config.toml")]
    config: String,

    /// Listen port (repeatable; replaces the configured set)
    #[arg(short, long = "port")]
    ports: Vec<u16>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Read buffer size per relay direction, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Outbound dial timeout in seconds (0 disables)
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Idle timeout in seconds for each relay direction (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds the remaining direction may drain after the other closes
    #[arg(long)]
    drain_timeout: Option<u64>,

    /// Path of the kernel's disable_ipv6 flag
    #[arg(long)]
    ipv6_flag: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind,
            ports: (!self.ports.is_empty()).then(|| self.ports.clone()),
            buffer_size: self.buffer_size,
            dial_timeout: self.dial_timeout,
            idle_timeout: self.idle_timeout,
            drain_timeout: self.drain_timeout,
            ipv6_flag: self.ipv6_flag.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relay64");

    // Load relay config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let relay_config = match RelayConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = preflight::check_ipv6_enabled(&relay_config.ipv6_flag_path) {
        error!(error = %e, "please enable IPv6");
        std::process::exit(1);
    }

    let (listeners, failures) = ListenerSet::bind(relay_config.bind_addr, &relay_config.ports);
    if listeners.is_empty() {
        error!(error = %RelayError::NoListeners, "nothing to serve");
        std::process::exit(1);
    }
    if !failures.is_empty() {
        let failed: Vec<u16> = failures.iter().map(|f| f.port).collect();
        warn!(?failed, "continuing without some ports");
    }

    if relay_config.idle_timeout.is_none() {
        info!("no idle timeout configured; silent connections are held until a peer closes");
    }

    let handler = Arc::new(ConnectionHandler::new(&relay_config));

    info!(
        listeners = listeners.len(),
        bind = %relay_config.bind_addr,
        "relay64 ready"
    );

    // Run until shutdown signal
    tokio::select! {
        _ = listeners.run(handler) => {
            error!("all accept loops ended");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("relay64 stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
