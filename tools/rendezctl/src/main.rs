// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rendez command-line tool
//!
//! Lists what a running Master knows about and talks on topics.
//!
//! # Usage
//!
//! ```bash
//! # List registered nodes
//! rendezctl node ls
//!
//! # Nodes subscribing to a topic
//! rendezctl node ls -s chatter
//!
//! # Topics with their negotiated channel
//! rendezctl --master 10.0.0.5:8881 topic ls
//!
//! # Publish a JSON message five times, then print what arrives
//! rendezctl topic publish pose '{"x": 1.0}' --type json --repeat 5
//! rendezctl topic subscribe pose --type json --count 5
//!
//! # Everything, refreshed every second
//! rendezctl watch --interval 1
//! ```

mod pubsub;
mod query;

use clap::{Args as ClapArgs, Parser, Subcommand};
use colored::Colorize;
use pubsub::{PayloadKind, PublishArgs, SubscribeArgs};
use query::MasterQuery;
use rendez::master::{ServiceSummary, TopicSummary};
use rendez::{ChannelKind, ChannelKinds, Json, NodeConfig, NodeInfo, DEFAULT_MASTER_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tabled::{Table, Tabled};

/// rendez command-line tool
#[derive(Parser, Debug)]
#[command(name = "rendezctl")]
#[command(about = "Inspect a rendez Master and talk on its topics")]
#[command(version)]
struct Args {
    /// Master address
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_MASTER_PORT)))]
    master: SocketAddr,

    /// Connect and read timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Print raw JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Registered nodes
    #[command(subcommand)]
    Node(NodeCommand),

    /// Topics: list, publish, subscribe
    #[command(subcommand)]
    Topic(TopicCommand),

    /// Registered services
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Show nodes, topics and services
    Status,

    /// Watch mode (continuous updates)
    Watch {
        /// Update interval in seconds
        #[arg(short, long, default_value = "1")]
        interval: u64,
    },
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// List nodes, optionally filtered
    Ls(NodeFilter),
}

/// At most one filter applies; no filter lists every node.
#[derive(ClapArgs, Debug, Default, Clone)]
#[group(multiple = false)]
struct NodeFilter {
    /// List every node
    #[arg(short, long)]
    all: bool,

    /// Nodes publishing TOPIC
    #[arg(short, long, value_name = "TOPIC")]
    publishing: Option<String>,

    /// Nodes subscribing to TOPIC
    #[arg(short, long, value_name = "TOPIC")]
    subscribing: Option<String>,

    /// The node called NAME
    #[arg(short, long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum TopicCommand {
    /// List topics and their channels
    Ls,

    /// Publish a message on a topic
    Publish {
        topic: String,

        /// Message text, or a JSON document with `--type json`
        payload: String,

        #[arg(short = 't', long = "type", value_enum, default_value = "string")]
        payload_kind: PayloadKind,

        /// Channel kinds to offer (repeatable)
        #[arg(short = 'k', long = "kind", default_value = "tcp")]
        kinds: Vec<ChannelKind>,

        /// Number of times to send the message
        #[arg(short, long, default_value = "1")]
        repeat: u32,

        /// Delay between two messages in milliseconds
        #[arg(short, long, default_value = "100")]
        interval_ms: u64,
    },

    /// Print the messages published on a topic
    Subscribe {
        topic: String,

        #[arg(short = 't', long = "type", value_enum, default_value = "string")]
        payload_kind: PayloadKind,

        /// Channel kinds to accept (repeatable); any kind by default
        #[arg(short = 'k', long = "kind")]
        kinds: Vec<ChannelKind>,

        /// Stop after this many messages
        #[arg(short, long)]
        count: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// List services
    Ls,
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let result = run(&args, timeout);

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args, timeout: Duration) -> CmdResult {
    if let Commands::Topic(command @ (TopicCommand::Publish { .. } | TopicCommand::Subscribe { .. })) =
        &args.command
    {
        let config = NodeConfig::new(args.master).with_connect_timeout(timeout);
        return cmd_topic_traffic(config, command, timeout);
    }

    let mut query = MasterQuery::connect(args.master, timeout)?;
    match &args.command {
        Commands::Node(NodeCommand::Ls(filter)) => cmd_nodes(&mut query, filter, args.json),
        Commands::Topic(_) => cmd_topics(&mut query, args.json),
        Commands::Service(ServiceCommand::Ls) => cmd_services(&mut query, args.json),
        Commands::Status => cmd_status(&mut query, args.json),
        Commands::Watch { interval } => cmd_watch(&mut query, *interval),
    }
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Client")]
    client: String,
}

impl From<&NodeInfo> for NodeRow {
    fn from(node: &NodeInfo) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name.clone(),
            client: node.client_id.to_string(),
        }
    }
}

#[derive(Tabled)]
struct TopicRow {
    #[tabled(rename = "Topic")]
    topic: String,
    #[tabled(rename = "Schema")]
    schema: String,
    #[tabled(rename = "Publisher")]
    publisher: String,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Subscribers")]
    subscribers: usize,
    #[tabled(rename = "Pending")]
    pending: usize,
}

impl From<&TopicSummary> for TopicRow {
    fn from(topic: &TopicSummary) -> Self {
        let channel = match (&topic.kind, &topic.endpoint) {
            (Some(kind), Some(endpoint)) => format!("{} {}", kind, endpoint),
            (Some(kind), None) => kind.to_string(),
            _ => "-".to_string(),
        };
        Self {
            topic: topic.topic.clone(),
            schema: truncate(&topic.schema_id, 32),
            publisher: topic.publisher.clone().unwrap_or_else(|| "-".to_string()),
            channel,
            subscribers: topic.subscribers,
            pending: topic.pending_subscribers,
        }
    }
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Schema")]
    schema: String,
    #[tabled(rename = "Server")]
    server: String,
    #[tabled(rename = "Clients")]
    clients: usize,
}

impl From<&ServiceSummary> for ServiceRow {
    fn from(service: &ServiceSummary) -> Self {
        Self {
            service: service.service.clone(),
            schema: truncate(&service.schema_id, 32),
            server: service.server.clone().unwrap_or_else(|| "-".to_string()),
            clients: service.clients,
        }
    }
}

/// Keep the nodes `filter` selects. Publisher and subscriber names come
/// from the topic listing.
fn filter_nodes(nodes: Vec<NodeInfo>, topics: &[TopicSummary], filter: &NodeFilter) -> Vec<NodeInfo> {
    let names: Vec<&str> = if let Some(topic) = &filter.publishing {
        topics
            .iter()
            .filter(|t| &t.topic == topic)
            .filter_map(|t| t.publisher.as_deref())
            .collect()
    } else if let Some(topic) = &filter.subscribing {
        topics
            .iter()
            .filter(|t| &t.topic == topic)
            .flat_map(|t| t.subscriber_nodes.iter().map(String::as_str))
            .collect()
    } else if let Some(name) = &filter.name {
        vec![name.as_str()]
    } else {
        return nodes;
    };
    nodes
        .into_iter()
        .filter(|n| names.contains(&n.name.as_str()))
        .collect()
}

fn cmd_nodes(query: &mut MasterQuery, filter: &NodeFilter, json: bool) -> CmdResult {
    let mut nodes = query.nodes()?;
    let narrowed = filter.publishing.is_some() || filter.subscribing.is_some() || filter.name.is_some();
    if !filter.all && narrowed {
        let topics = query.topics()?;
        nodes = filter_nodes(nodes, &topics, filter);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    println!("{}", "Registered Nodes".cyan().bold());
    println!("  Count: {}", nodes.len());
    println!();

    if nodes.is_empty() {
        println!("  {}", "No nodes registered".yellow());
    } else {
        let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn cmd_topics(query: &mut MasterQuery, json: bool) -> CmdResult {
    let topics = query.topics()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&topics)?);
        return Ok(());
    }

    println!("{}", "Topics".cyan().bold());
    println!("  Count: {}", topics.len());
    println!();

    if topics.is_empty() {
        println!("  {}", "No topics".yellow());
    } else {
        let rows: Vec<TopicRow> = topics.iter().map(TopicRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn cmd_services(query: &mut MasterQuery, json: bool) -> CmdResult {
    let services = query.services()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    println!("{}", "Services".cyan().bold());
    println!("  Count: {}", services.len());
    println!();

    if services.is_empty() {
        println!("  {}", "No services".yellow());
    } else {
        let rows: Vec<ServiceRow> = services.iter().map(ServiceRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn cmd_status(query: &mut MasterQuery, json: bool) -> CmdResult {
    if json {
        let snapshot = serde_json::json!({
            "nodes": query.nodes()?,
            "topics": query.topics()?,
            "services": query.services()?,
        });
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("{}", "rendez Master Status".cyan().bold());
    println!("{}", "=".repeat(50));
    println!();

    cmd_nodes(query, &NodeFilter::default(), false)?;
    println!();
    cmd_topics(query, false)?;
    println!();
    cmd_services(query, false)?;
    Ok(())
}

fn cmd_topic_traffic(config: NodeConfig, command: &TopicCommand, timeout: Duration) -> CmdResult {
    match command {
        TopicCommand::Publish {
            topic,
            payload,
            payload_kind,
            kinds,
            repeat,
            interval_ms,
        } => {
            let args = PublishArgs {
                topic,
                payload,
                kinds: kinds_or(kinds, ChannelKinds::TCP),
                repeat: *repeat,
                interval: Duration::from_millis(*interval_ms),
            };
            match payload_kind {
                PayloadKind::String => pubsub::publish::<String>(config, &args, timeout)?,
                PayloadKind::Json => pubsub::publish::<Json<serde_json::Value>>(config, &args, timeout)?,
            }
        }
        TopicCommand::Subscribe {
            topic,
            payload_kind,
            kinds,
            count,
        } => {
            let args = SubscribeArgs {
                topic,
                kinds: kinds_or(kinds, ChannelKinds::ALL),
                count: *count,
            };
            match payload_kind {
                PayloadKind::String => pubsub::subscribe::<String>(config, &args, timeout)?,
                PayloadKind::Json => pubsub::subscribe::<Json<serde_json::Value>>(config, &args, timeout)?,
            }
        }
        TopicCommand::Ls => {}
    }
    Ok(())
}

fn kinds_or(kinds: &[ChannelKind], fallback: ChannelKinds) -> ChannelKinds {
    if kinds.is_empty() {
        fallback
    } else {
        kinds.iter().copied().collect()
    }
}

fn cmd_watch(query: &mut MasterQuery, interval: u64) -> CmdResult {
    println!(
        "{} (interval: {}s, Ctrl+C to stop)",
        "Watch Mode".cyan().bold(),
        interval
    );
    println!();

    loop {
        let nodes = query.nodes()?;
        let topics = query.topics()?;
        let services = query.services()?;

        // Clear screen
        print!("\x1B[2J\x1B[1;1H");
        println!(
            "{} - {}",
            "rendez Watch".cyan().bold(),
            chrono::Local::now().format("%H:%M:%S")
        );
        println!("{}", "=".repeat(50));
        println!("Nodes: {}", nodes.len());

        let pending: usize = topics.iter().map(|t| t.pending_subscribers).sum();
        let orphaned = topics.iter().filter(|t| t.publisher.is_none()).count();
        let pending_label = if pending == 0 {
            pending.to_string().green()
        } else {
            pending.to_string().yellow()
        };
        println!(
            "Topics: {} ({} without publisher, {} pending subscribers)",
            topics.len(),
            orphaned,
            pending_label
        );

        let unserved = services.iter().filter(|s| s.server.is_none()).count();
        println!("Services: {} ({} without server)", services.len(), unserved);

        std::thread::sleep(Duration::from_secs(interval));
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
