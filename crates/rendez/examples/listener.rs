// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener: prints what the talker publishes.

use clap::Parser;
use parking_lot::Mutex;
use rendez::{
    ChannelDescriptor, ChannelKind, ChannelKinds, Context, Json, NodeConfig, NodeIdentity,
    NodeLifecycle, Status,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "listener", about = "Subscribe to a rendez topic and print messages")]
struct Args {
    /// Master address
    #[arg(short, long)]
    master: Option<SocketAddr>,

    /// Node name (empty lets the Master pick one)
    #[arg(short, long, default_value = "listener")]
    name: String,

    /// Topic to subscribe to
    #[arg(short, long, default_value = "chatter")]
    topic: String,

    /// Channel kinds accepted, comma-separated
    #[arg(short, long, value_delimiter = ',', default_value = "tcp")]
    kinds: Vec<ChannelKind>,

    /// Deliver at most one batch per period (milliseconds)
    #[arg(long)]
    period_ms: Option<u64>,

    /// Messages kept between periodic deliveries
    #[arg(long, default_value = "8")]
    queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chatter {
    seq: u64,
    text: String,
}

struct Listener {
    identity: Arc<Mutex<Option<NodeIdentity>>>,
}

impl NodeLifecycle for Listener {
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
    let mut config = NodeConfig::default().apply_env()?;
    if let Some(master) = args.master {
        config = config.with_master_address(master);
    }

    let mut ctx = Context::new(config)?;
    let identity = Arc::new(Mutex::new(None));
    ctx.create_node(
        args.name.as_str(),
        Listener {
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
    let mut builder = ChannelDescriptor::builder().kinds(kinds).queue_size(args.queue);
    if let Some(ms) = args.period_ms {
        builder = builder.period(Duration::from_millis(ms));
    }
    let descriptor = builder.build()?;

    let subscriber = ctx.subscriber::<Json<Chatter>>();
    let topic = args.topic.clone();
    subscriber.request_subscribe(
        &node,
        &args.topic,
        |Json(msg): Json<Chatter>| tracing::info!("#{}: {}", msg.seq, msg.text),
        |status: Status| tracing::warn!("message error: {}", status),
        descriptor,
        move |status| {
            if status.ok() {
                tracing::info!("subscribed to '{}'", topic);
            } else {
                tracing::error!("subscribe to '{}' failed: {}", topic, status);
            }
        },
    );

    ctx.run()?;
    Ok(())
}
