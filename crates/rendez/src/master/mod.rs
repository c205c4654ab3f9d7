// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master: the central registry and the node-side connection to it.
//!
//! - [`protocol`]: requests, responses, notifications and their framing
//! - [`registry`]: the registry state machine, shared with `rendez-master`
//! - [`transport`]: TCP and in-process connections
//! - [`client`]: [`MasterClient`], which marshals everything onto the loop

pub mod client;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::MasterClient;
pub use protocol::{
    ClientFrame, MasterRequest, MasterResponse, Notification, ProtocolError, RequestId,
    ServerFrame, ServiceSummary, TopicSummary,
};
pub use registry::{MasterRegistry, Outcome};
pub use transport::{
    InProcessMaster, InProcessTransport, MasterTransport, NotificationSink, ReplyCallback,
    TcpMasterTransport,
};
