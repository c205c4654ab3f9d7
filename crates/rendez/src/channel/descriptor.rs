// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel capability descriptor.
//!
//! A [`ChannelDescriptor`] is what a node submits with every topic or
//! service registration: the set of channel kinds it can speak plus the
//! transport settings it wants. It is immutable once built; every
//! (re)registration sends a fresh copy.
//!
//! The UDS authentication hook is a local callback and never leaves the
//! process. Only [`DescriptorWire`], the serializable projection, is sent
//! to the Master.
//!
//! # Example
//!
//! ```
//! use rendez::channel::{ChannelDescriptor, ChannelKinds};
//!
//! let desc = ChannelDescriptor::builder()
//!     .kinds(ChannelKinds::TCP | ChannelKinds::SHM)
//!     .buffer_size(4096)
//!     .queue_size(16)
//!     .build()
//!     .unwrap();
//! assert_eq!(desc.buffer_size(), 4096);
//! ```

use super::ChannelKinds;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default fixed buffer size per message (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of in-flight messages before backpressure.
pub const DEFAULT_QUEUE_SIZE: usize = 8;

/// Default shared memory segment size (4 MiB).
pub const DEFAULT_SHM_SIZE: usize = 4 * 1024 * 1024;

/// TLS settings attached to a TCP channel.
///
/// Holds file paths only; key material is loaded by the transport when the
/// channel is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslContext {
    /// Name the subscriber expects in the publisher's certificate.
    pub server_name: String,
    /// PEM certificate chain (publisher side).
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key (publisher side).
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// PEM trust anchors (subscriber side).
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

impl SslContext {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            cert_path: None,
            key_path: None,
            ca_path: None,
        }
    }

    pub fn with_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }

    pub fn with_ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca.into());
        self
    }
}

/// Credentials of a peer connected over a Unix domain socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Admission hook run on every UDS peer connection. Returning `false`
/// closes the connection.
pub type UdsAuthHook = Arc<dyn Fn(&PeerCredentials) -> bool + Send + Sync>;

/// Capability and settings record for one registration.
#[derive(Clone)]
pub struct ChannelDescriptor {
    kinds: ChannelKinds,
    buffer_size: usize,
    is_dynamic_buffer: bool,
    queue_size: usize,
    period: Option<Duration>,
    shm_size: usize,
    ssl_context: Option<SslContext>,
    uds_auth_hook: Option<UdsAuthHook>,
}

impl ChannelDescriptor {
    pub fn builder() -> ChannelDescriptorBuilder {
        ChannelDescriptorBuilder::default()
    }

    /// Descriptor with default settings for the given kinds.
    pub fn with_kinds(kinds: ChannelKinds) -> Self {
        Self {
            kinds,
            buffer_size: DEFAULT_BUFFER_SIZE,
            is_dynamic_buffer: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            period: None,
            shm_size: DEFAULT_SHM_SIZE,
            ssl_context: None,
            uds_auth_hook: None,
        }
    }

    pub fn kinds(&self) -> ChannelKinds {
        self.kinds
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_dynamic_buffer(&self) -> bool {
        self.is_dynamic_buffer
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn shm_size(&self) -> usize {
        self.shm_size
    }

    pub fn ssl_context(&self) -> Option<&SslContext> {
        self.ssl_context.as_ref()
    }

    pub fn uds_auth_hook(&self) -> Option<&UdsAuthHook> {
        self.uds_auth_hook.as_ref()
    }

    /// Serializable projection sent to the Master.
    pub fn to_wire(&self) -> DescriptorWire {
        DescriptorWire {
            kinds: self.kinds,
            buffer_size: self.buffer_size,
            is_dynamic_buffer: self.is_dynamic_buffer,
            queue_size: self.queue_size,
            period_ms: self.period.map(|p| p.as_millis() as u64),
            shm_size: self.shm_size,
            ssl_context: self.ssl_context.clone(),
            has_uds_auth_hook: self.uds_auth_hook.is_some(),
        }
    }
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self::with_kinds(ChannelKinds::TCP)
    }
}

impl fmt::Debug for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDescriptor")
            .field("kinds", &self.kinds)
            .field("buffer_size", &self.buffer_size)
            .field("is_dynamic_buffer", &self.is_dynamic_buffer)
            .field("queue_size", &self.queue_size)
            .field("period", &self.period)
            .field("shm_size", &self.shm_size)
            .field("ssl_context", &self.ssl_context)
            .field("uds_auth_hook", &self.uds_auth_hook.is_some())
            .finish()
    }
}

/// Builder for [`ChannelDescriptor`].
///
/// Every setting is declared here explicitly; unset fields take the
/// `DEFAULT_*` constants.
#[derive(Default)]
pub struct ChannelDescriptorBuilder {
    kinds: Option<ChannelKinds>,
    buffer_size: Option<usize>,
    is_dynamic_buffer: bool,
    queue_size: Option<usize>,
    period: Option<Duration>,
    shm_size: Option<usize>,
    ssl_context: Option<SslContext>,
    uds_auth_hook: Option<UdsAuthHook>,
}

impl ChannelDescriptorBuilder {
    pub fn kinds(mut self, kinds: ChannelKinds) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = Some(bytes);
        self
    }

    pub fn dynamic_buffer(mut self, dynamic: bool) -> Self {
        self.is_dynamic_buffer = dynamic;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Requested delivery cadence (advisory, subscriber side).
    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn shm_size(mut self, bytes: usize) -> Self {
        self.shm_size = Some(bytes);
        self
    }

    pub fn ssl_context(mut self, ctx: SslContext) -> Self {
        self.ssl_context = Some(ctx);
        self
    }

    pub fn uds_auth_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerCredentials) -> bool + Send + Sync + 'static,
    {
        self.uds_auth_hook = Some(Arc::new(hook));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when no kind is requested, a size is zero, the
    /// period is zero, or the shared memory segment cannot hold one buffer.
    pub fn build(self) -> Result<ChannelDescriptor, Status> {
        let kinds = self.kinds.unwrap_or(ChannelKinds::TCP);
        if kinds.is_empty() {
            return Err(Status::invalid_argument("no channel kind requested"));
        }
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(Status::invalid_argument("buffer_size must be > 0"));
        }
        let queue_size = self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE);
        if queue_size == 0 {
            return Err(Status::invalid_argument("queue_size must be > 0"));
        }
        if self.period.is_some_and(|p| p.is_zero()) {
            return Err(Status::invalid_argument("period must be > 0"));
        }
        let shm_size = self.shm_size.unwrap_or(DEFAULT_SHM_SIZE);
        if kinds.contains(super::ChannelKind::Shm) && !self.is_dynamic_buffer && shm_size < buffer_size
        {
            return Err(Status::invalid_argument(format!(
                "shm_size {} cannot hold buffer_size {}",
                shm_size, buffer_size
            )));
        }

        Ok(ChannelDescriptor {
            kinds,
            buffer_size,
            is_dynamic_buffer: self.is_dynamic_buffer,
            queue_size,
            period: self.period,
            shm_size,
            ssl_context: self.ssl_context,
            uds_auth_hook: self.uds_auth_hook,
        })
    }
}

/// Wire form of a [`ChannelDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorWire {
    pub kinds: ChannelKinds,
    pub buffer_size: usize,
    #[serde(default)]
    pub is_dynamic_buffer: bool,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub period_ms: Option<u64>,
    #[serde(default = "default_shm_size")]
    pub shm_size: usize,
    #[serde(default)]
    pub ssl_context: Option<SslContext>,
    #[serde(default)]
    pub has_uds_auth_hook: bool,
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_shm_size() -> usize {
    DEFAULT_SHM_SIZE
}

impl DescriptorWire {
    /// Wire descriptor with defaults for the given kinds and buffer.
    pub fn new(kinds: ChannelKinds, buffer_size: usize, is_dynamic_buffer: bool) -> Self {
        Self {
            kinds,
            buffer_size,
            is_dynamic_buffer,
            queue_size: DEFAULT_QUEUE_SIZE,
            period_ms: None,
            shm_size: DEFAULT_SHM_SIZE,
            ssl_context: None,
            has_uds_auth_hook: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn test_builder_defaults() {
        let desc = ChannelDescriptor::builder().build().unwrap();
        assert_eq!(desc.kinds(), ChannelKinds::TCP);
        assert_eq!(desc.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(desc.queue_size(), DEFAULT_QUEUE_SIZE);
        assert!(!desc.is_dynamic_buffer());
        assert!(desc.period().is_none());
    }

    #[test]
    fn test_builder_rejects_empty_kinds() {
        let err = ChannelDescriptor::builder()
            .kinds(ChannelKinds::empty())
            .build()
            .unwrap_err();
        assert_eq!(err.code(), crate::status::StatusCode::InvalidArgument);
    }

    #[test]
    fn test_builder_rejects_small_shm() {
        let res = ChannelDescriptor::builder()
            .kinds(ChannelKinds::SHM)
            .buffer_size(8192)
            .shm_size(4096)
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn test_wire_hides_hook() {
        let desc = ChannelDescriptor::builder()
            .kinds(ChannelKinds::UDS | ChannelKinds::TCP)
            .period(Duration::from_millis(250))
            .uds_auth_hook(|creds| creds.uid == 0)
            .build()
            .unwrap();
        let wire = desc.to_wire();
        assert!(wire.has_uds_auth_hook);
        assert_eq!(wire.period_ms, Some(250));
        assert!(wire.kinds.contains(ChannelKind::Uds));

        let json = serde_json::to_string(&wire).unwrap();
        let back: DescriptorWire = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn test_debug_does_not_require_hook_debug() {
        let desc = ChannelDescriptor::builder()
            .uds_auth_hook(|_| true)
            .build()
            .unwrap();
        let s = format!("{:?}", desc);
        assert!(s.contains("uds_auth_hook: true"));
    }
}
