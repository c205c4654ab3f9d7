// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic endpoints.
//!
//! A [`Publisher`] or [`Subscriber`] runs its own registration handshake
//! against the Master and then owns the live channel. Results and messages
//! are always delivered on the event loop, registration result first.

pub mod message;
pub mod publisher;
pub mod subscriber;

pub use message::{Json, Message};
pub use publisher::Publisher;
pub use subscriber::Subscriber;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration state of one (node, topic, role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicState {
    /// Never registered, or torn down.
    Unregistered,
    /// Request in flight, or waiting for a publisher.
    Pending,
    /// A channel is negotiated and open.
    Negotiated,
    /// Registration failed; the endpoint may register again.
    Failed,
}

impl TopicState {
    /// Whether a registration is live (pending or negotiated).
    pub fn is_active(self) -> bool {
        matches!(self, TopicState::Pending | TopicState::Negotiated)
    }
}

impl fmt::Display for TopicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicState::Unregistered => "unregistered",
            TopicState::Pending => "pending",
            TopicState::Negotiated => "negotiated",
            TopicState::Failed => "failed",
        };
        f.write_str(s)
    }
}
