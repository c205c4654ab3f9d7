// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rendez - Master-mediated discovery and channel negotiation
//!
//! Independent processes ("nodes") register with a central Master,
//! advertise topics and services, and get a concrete data channel picked
//! for them from the capabilities both ends declare.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rendez::{ChannelDescriptor, ChannelKinds, Context, NodeConfig, NodeIdentity, NodeLifecycle};
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! struct Talker(Arc<Mutex<Option<NodeIdentity>>>);
//!
//! impl NodeLifecycle for Talker {
//!     fn on_did_create(&mut self, identity: NodeIdentity) {
//!         *self.0.lock() = Some(identity);
//!     }
//! }
//!
//! let mut ctx = Context::new(NodeConfig::default())?;
//! let identity = Arc::new(Mutex::new(None));
//! ctx.create_node("talker", Talker(identity.clone()));
//! ctx.run_until_idle()?;
//!
//! # let identity: NodeIdentity = identity.lock().clone().unwrap();
//! let publisher = ctx.publisher::<String>();
//! let descriptor = ChannelDescriptor::with_kinds(ChannelKinds::TCP | ChannelKinds::SHM);
//! publisher.request_publish(&identity, "chatter", descriptor, |status| {
//!     assert!(status.ok());
//! });
//! ctx.run()?;
//! # Ok::<(), rendez::Status>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  Node process                                                |
//! |   Context = EventLoop + MasterClient                         |
//! |   Publisher / Subscriber / ServiceServer / ServiceClient     |
//! +-----------------------------+--------------------------------+
//! |  control plane              |  data plane                    |
//! |  JSON frames to the Master  |  TCP | UDP | UDS | SHM | WS    |
//! +-----------------------------+--------------------------------+
//! |  Master: MasterRegistry + ChannelNegotiator                  |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every callback runs on the process event loop. Background threads only
//! accept, connect and read; they hand their results to the loop.
//!
//! ## Modules Overview
//!
//! - [`event_loop`] - single-threaded task loop
//! - [`master`] - Master protocol, registry, client and transports
//! - [`channel`] - descriptors, channel kinds and the negotiator
//! - [`communication`] - publishers and subscribers
//! - [`rpc`] - service servers and clients
//! - [`transport`] - the five data-plane link kinds

pub mod channel;
pub mod communication;
pub mod config;
pub mod context;
pub mod event_loop;
pub mod master;
pub mod node;
pub mod rpc;
pub mod status;
pub mod transport;

pub use channel::{
    ChannelDescriptor, ChannelEndpoint, ChannelKind, ChannelKinds, ChannelNegotiator, NegotiatedChannel,
    PeerCredentials, SslContext,
};
pub use communication::{Json, Message, Publisher, Subscriber, TopicState};
pub use config::{ConfigError, NodeConfig, DEFAULT_MASTER_PORT};
pub use context::Context;
pub use event_loop::{EventLoop, LoopHandle};
pub use master::{InProcessMaster, MasterClient, MasterRegistry, MasterTransport, TcpMasterTransport};
pub use node::{ClientId, NodeId, NodeIdentity, NodeInfo, NodeLifecycle, NodeStatus, NoopLifecycle};
pub use rpc::{Responder, ServiceClient, ServiceServer, ServiceState, ServiceStatus};
pub use status::{Status, StatusCode};
