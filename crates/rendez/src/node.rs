// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node identity and lifecycle callbacks.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique id handed out by the Master on `RegisterClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Opaque node token assigned by the Master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Lifecycle of a node registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unregistered,
    Registering,
    Registered,
    Error,
}

/// Identity record of a registered node.
///
/// Endpoints hold a copy and use it as a lookup key only; the Master owns
/// the identity's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
    pub client_id: ClientId,
    pub status: NodeStatus,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Node summary returned by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub client_id: ClientId,
}

/// Callbacks implemented by node authors.
///
/// All methods default to no-ops and run on the event loop.
///
/// ```
/// use rendez::node::{NodeIdentity, NodeLifecycle};
///
/// struct Talker {
///     identity: Option<NodeIdentity>,
/// }
///
/// impl NodeLifecycle for Talker {
///     fn on_did_create(&mut self, identity: NodeIdentity) {
///         self.identity = Some(identity);
///     }
/// }
/// ```
pub trait NodeLifecycle: Send + 'static {
    /// Called once, before the registration request is sent.
    fn on_init(&mut self) {}

    /// Called when the Master accepted the node.
    fn on_did_create(&mut self, _identity: NodeIdentity) {}

    /// Called when the registration failed.
    fn on_error(&mut self, _status: Status) {}
}

/// Lifecycle with no behavior, for nodes that only need an identity.
#[derive(Debug, Default)]
pub struct NoopLifecycle;

impl NodeLifecycle for NoopLifecycle {}

/// Alphanumeric name generator for anonymous nodes.
pub(crate) fn random_node_name(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARSET[fastrand::usize(..CHARSET.len())] as char)
        .collect()
}
