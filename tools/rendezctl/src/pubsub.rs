// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `topic publish` and `topic subscribe`: the tool joins the Master as a
//! short-lived node and talks on a topic like any other participant.

use clap::ValueEnum;
use colored::Colorize;
use parking_lot::Mutex;
use rendez::{
    ChannelDescriptor, ChannelKinds, Context, Json, Message, NodeConfig, NodeIdentity,
    NodeLifecycle, Status,
};
use std::sync::Arc;
use std::time::Duration;

/// How payloads are encoded on the wire. Peers must use the same schema.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// UTF-8 text (`String` messages)
    String,
    /// Any JSON document (`Json<serde_json::Value>` messages)
    Json,
}

/// A message the tool can print and build from the command line.
pub trait CliMessage: Message {
    fn parse(text: &str) -> Result<Self, Status>;

    fn render(&self) -> String;
}

impl CliMessage for String {
    fn parse(text: &str) -> Result<Self, Status> {
        Ok(text.to_string())
    }

    fn render(&self) -> String {
        self.clone()
    }
}

impl CliMessage for Json<serde_json::Value> {
    fn parse(text: &str) -> Result<Self, Status> {
        serde_json::from_str(text)
            .map(Json)
            .map_err(|e| Status::invalid_argument(format!("payload is not JSON: {}", e)))
    }

    fn render(&self) -> String {
        self.0.to_string()
    }
}

pub struct PublishArgs<'a> {
    pub topic: &'a str,
    pub payload: &'a str,
    pub kinds: ChannelKinds,
    pub repeat: u32,
    pub interval: Duration,
}

pub struct SubscribeArgs<'a> {
    pub topic: &'a str,
    pub kinds: ChannelKinds,
    /// Stop after this many messages; run until interrupted when `None`.
    pub count: Option<u32>,
}

struct Identity(Arc<Mutex<Option<Result<NodeIdentity, Status>>>>);

impl NodeLifecycle for Identity {
    fn on_did_create(&mut self, identity: NodeIdentity) {
        *self.0.lock() = Some(Ok(identity));
    }

    fn on_error(&mut self, status: Status) {
        *self.0.lock() = Some(Err(status));
    }
}

fn join(ctx: &mut Context, timeout: Duration) -> Result<NodeIdentity, Status> {
    let slot = Arc::new(Mutex::new(None));
    ctx.create_node(format!("rendezctl-{}", std::process::id()), Identity(slot.clone()));
    let done = slot.clone();
    ctx.run_until(timeout, move || done.lock().is_some())?;
    let outcome = slot.lock().take();
    outcome.unwrap_or_else(|| Err(Status::timeout("master did not register the node in time")))
}

/// Run the loop until `slot` holds a registration result.
fn wait_result(ctx: &mut Context, slot: &Arc<Mutex<Option<Status>>>, timeout: Duration) -> Result<(), Status> {
    let done = slot.clone();
    ctx.run_until(timeout, move || done.lock().is_some())?;
    let status = slot
        .lock()
        .take()
        .unwrap_or_else(|| Status::timeout("master did not answer in time"));
    if status.ok() {
        Ok(())
    } else {
        Err(status)
    }
}

pub fn publish<M: CliMessage>(config: NodeConfig, args: &PublishArgs<'_>, timeout: Duration) -> Result<(), Status> {
    let message = M::parse(args.payload)?;
    let descriptor = ChannelDescriptor::builder().kinds(args.kinds).build()?;
    let mut ctx = Context::new(config)?;
    let identity = join(&mut ctx, timeout)?;

    let publisher = ctx.publisher::<M>();
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    publisher.request_publish(&identity, args.topic, descriptor, move |status| *slot.lock() = Some(status));
    wait_result(&mut ctx, &result, timeout)?;
    if let Some(channel) = publisher.channel() {
        println!("{} {} on {}", "Publishing".cyan().bold(), args.topic, channel.endpoint);
    }

    // Give attached subscribers a chance to connect before the first message.
    let attached = publisher.clone();
    ctx.run_until(timeout, move || attached.peer_count() > 0)?;

    for sent in 0..args.repeat {
        publisher.publish(&message)?;
        println!("  [{}] {}", sent + 1, message.render());
        ctx.run_for(args.interval)?;
    }

    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    publisher.request_unpublish(&identity, args.topic, move |status| *slot.lock() = Some(status));
    wait_result(&mut ctx, &result, timeout)
}

pub fn subscribe<M: CliMessage>(config: NodeConfig, args: &SubscribeArgs<'_>, timeout: Duration) -> Result<(), Status> {
    let descriptor = ChannelDescriptor::builder().kinds(args.kinds).build()?;
    let mut ctx = Context::new(config)?;
    let identity = join(&mut ctx, timeout)?;

    let received = Arc::new(Mutex::new(0u32));
    let counter = received.clone();
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    let subscriber = ctx.subscriber::<M>();
    let topic = args.topic.to_string();
    subscriber.request_subscribe(
        &identity,
        args.topic,
        move |message: M| {
            let mut received = counter.lock();
            *received += 1;
            println!("  [{}] {}", received, message.render());
        },
        move |status| eprintln!("{} '{}': {}", "Warning:".yellow().bold(), topic, status),
        descriptor,
        move |status| *slot.lock() = Some(status),
    );
    println!("{} {} (Ctrl+C to stop)", "Subscribing".cyan().bold(), args.topic);

    // The result only arrives once a publisher shows up.
    loop {
        ctx.run_for(Duration::from_millis(100))?;
        if let Some(status) = result.lock().take() {
            if !status.ok() {
                return Err(status);
            }
        }
        if args.count.is_some_and(|count| *received.lock() >= count) {
            break;
        }
    }

    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    subscriber.request_unsubscribe(&identity, args.topic, move |status| *slot.lock() = Some(status));
    wait_result(&mut ctx, &result, timeout)
}
