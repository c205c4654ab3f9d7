// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rendez Master
//!
//! Central registry for rendez nodes: names, topics, services and the
//! channels negotiated between them.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (8881)
//! rendez-master
//!
//! # Custom port and config
//! rendez-master --port 9881 --config master.json
//!
//! # Short leases for fast failure detection
//! rendez-master --lease-duration 3 --log-level debug
//! ```

use clap::Parser;
use rendez_master::{MasterServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// rendez Master - node registry and channel negotiation
#[derive(Parser, Debug)]
#[command(name = "rendez-master")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = rendez::DEFAULT_MASTER_PORT)]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client lease duration in seconds
    #[arg(long, default_value = "10")]
    lease_duration: u64,

    /// Maximum connected client processes
    #[arg(long, default_value = "1000")]
    max_clients: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig {
            bind_address: args.bind,
            port: args.port,
            lease_duration_secs: args.lease_duration,
            max_clients: args.max_clients,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!("|  rendez Master v{:35}|", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:40} |", config.listen_address());
    info!("|  Lease:   {:40} |", format!("{}s", config.lease_duration_secs));
    info!("|  Clients: {:40} |", format!("max {}", config.max_clients));
    info!("+----------------------------------------------------+");

    let server = MasterServer::new(config).await?;

    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping Master...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Master stopped");
    Ok(())
}
