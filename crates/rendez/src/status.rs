// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status results delivered by every asynchronous operation.
//!
//! A [`Status`] is the single completion value of a registration request,
//! an unregistration, a publish acknowledgement or an RPC call. It carries a
//! machine-readable [`StatusCode`] and a human-readable message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// Name, topic or service is already registered (or a registration is pending).
    AlreadyExists,
    /// Node, client, topic or service is unknown to the Master.
    NotFound,
    /// Request arguments are malformed.
    InvalidArgument,
    /// Endpoint is in a state that does not allow the operation.
    InvalidState,
    /// Master refused or could not process a registration.
    RegistrationFailed,
    /// No channel kind is common to all participants.
    ChannelMismatch,
    /// A fixed buffer cannot hold what a participant requires.
    BufferTooSmall,
    /// Message schema of the registering party differs from the topic's.
    SchemaMismatch,
    /// Bounded queue is full; the call was rejected instead of blocking.
    Backpressure,
    /// Endpoint was unregistered.
    Unregistered,
    /// Live channel failed (disconnect, malformed frame). Recoverable.
    TransportFailure,
    /// Call did not complete in time.
    Timeout,
    /// Peer or Master is not reachable.
    Unavailable,
    /// Framework bug or unexpected condition.
    Internal,
}

impl StatusCode {
    /// Stable upper-case name, used in log lines and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::InvalidState => "INVALID_STATE",
            StatusCode::RegistrationFailed => "REGISTRATION_FAILED",
            StatusCode::ChannelMismatch => "CHANNEL_MISMATCH",
            StatusCode::BufferTooSmall => "BUFFER_TOO_SMALL",
            StatusCode::SchemaMismatch => "SCHEMA_MISMATCH",
            StatusCode::Backpressure => "BACKPRESSURE",
            StatusCode::Unregistered => "UNREGISTERED",
            StatusCode::TransportFailure => "TRANSPORT_FAILURE",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success or failure of an operation, plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: StatusCode,
    #[serde(default)]
    message: String,
}

impl Status {
    /// Successful status with an empty message.
    pub fn ok_status() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// Build a status with an explicit code.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidState, message)
    }

    pub fn registration_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RegistrationFailed, message)
    }

    pub fn channel_mismatch(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ChannelMismatch, message)
    }

    pub fn buffer_too_small(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BufferTooSmall, message)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SchemaMismatch, message)
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Backpressure, message)
    }

    pub fn unregistered(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unregistered, message)
    }

    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TransportFailure, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// True when the operation succeeded.
    pub fn ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Human-readable message (empty on success).
    pub fn error_message(&self) -> &str {
        &self.message
    }

    /// Convert into a `Result`, mapping success to `Ok(())`.
    pub fn into_result(self) -> Result<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok_status()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        Status::transport_failure(e.to_string())
    }
}

impl From<serde_json::Error> for Status {
    fn from(e: serde_json::Error) -> Self {
        Status::invalid_argument(format!("codec error: {}", e))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Status>;
