// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response services.
//!
//! A [`ServiceServer`] listens on every stream kind it offers and registers
//! the endpoints with the Master. Each [`ServiceClient`] is handed its own
//! channel (the best stream kind both sides share) and keeps following the
//! server: `on_connect` reports every connect and disconnect.
//!
//! Calls are correlated by a 64-bit id, so concurrent calls on one client
//! may complete in any order. A call completes exactly once: with the
//! response, the server's error, `Timeout`, or `Unavailable` when the
//! connection goes away first.

pub mod client;
pub mod server;
mod wire;

pub use client::ServiceClient;
pub use server::{Responder, ServiceServer};
pub use wire::CallId;

use crate::communication::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration state of one (node, service, role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotRegistered,
    Registering,
    Registered,
    Unregistered,
}

impl ServiceState {
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Registering | ServiceState::Registered)
    }
}

/// Connection liveness of a service client, independent of its
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Connected => f.write_str("connected"),
            ServiceStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Schema id a service is registered under.
pub(crate) fn service_schema<Req: Message, Resp: Message>() -> String {
    format!("{}->{}", Req::schema_id(), Resp::schema_id())
}
