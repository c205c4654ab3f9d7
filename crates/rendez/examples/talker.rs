// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Talker: publishes a counter on a topic at a fixed rate.
//!
//! Start a Master first, then:
//!
//! ```bash
//! cargo run --example talker -- --topic chatter --kinds tcp,shm
//! cargo run --example listener -- --topic chatter --kinds shm,udp
//! ```

use clap::Parser;
use parking_lot::Mutex;
use rendez::{
    ChannelDescriptor, ChannelKind, ChannelKinds, Context, Json, NodeConfig, NodeIdentity,
    NodeLifecycle, Status,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "talker", about = "Publish a counter on a rendez topic")]
struct Args {
    /// Master address
    #[arg(short, long)]
    master: Option<SocketAddr>,

    /// Node configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name (empty lets the Master pick one)
    #[arg(short, long, default_value = "talker")]
    name: String,

    /// Topic to publish on
    #[arg(short, long, default_value = "chatter")]
    topic: String,

    /// Channel kinds offered, comma-separated
    #[arg(short, long, value_delimiter = ',', default_value = "tcp")]
    kinds: Vec<ChannelKind>,

    /// Publish period in milliseconds
    #[arg(short, long, default_value = "500")]
    period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chatter {
    seq: u64,
    text: String,
}

struct Talker {
    identity: Arc<Mutex<Option<NodeIdentity>>>,
}

impl NodeLifecycle for Talker {
    fn on_did_create(&mut self, identity: NodeIdentity) {
        tracing::info!("node {} is up", identity);
        *self.identity.lock() = Some(identity);
    }

    fn on_error(&mut self, status: Status) {
        tracing::error!("node registration failed: {}", status);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    }
    .apply_env()?;
    if let Some(master) = args.master {
        config = config.with_master_address(master);
    }

    let mut ctx = Context::new(config)?;
    let identity = Arc::new(Mutex::new(None));
    ctx.create_node(
        args.name.as_str(),
        Talker {
            identity: identity.clone(),
        },
    );
    let created = identity.clone();
    if !ctx.run_until(Duration::from_secs(5), move || created.lock().is_some())? {
        return Err("timed out waiting for the Master".into());
    }
    let Some(node) = identity.lock().clone() else {
        return Err("node was not created".into());
    };

    let kinds = args
        .kinds
        .iter()
        .fold(ChannelKinds::empty(), |acc, kind| acc | ChannelKinds::from(*kind));
    let publisher = ctx.publisher::<Json<Chatter>>();
    let topic = args.topic.clone();
    publisher.request_publish(&node, &args.topic, ChannelDescriptor::with_kinds(kinds), move |status| {
        if status.ok() {
            tracing::info!("publishing on '{}'", topic);
        } else {
            tracing::error!("publish on '{}' failed: {}", topic, status);
        }
    });

    let mut seq = 0u64;
    publisher.publish_repeating(Duration::from_millis(args.period_ms), move || {
        seq += 1;
        Json(Chatter {
            seq,
            text: format!("hello #{}", seq),
        })
    });

    ctx.run()?;
    Ok(())
}
