// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data plane: the live channels behind negotiated topics and services.
//!
//! # Architecture
//!
//! ```text
//! Publisher (event loop)                     Subscriber (event loop)
//!      | try_send                                   ^ LinkEvent (posted)
//!      v                                            |
//! [bounded queue] -> dispatcher thread ==wire==> reader thread
//!                    acceptor thread (new peers)
//! ```
//!
//! Publishers open a listener for every requested kind before they
//! register ([`PendingListeners`]); once the Master picked a kind the other
//! listeners are dropped and the chosen one becomes a [`PublisherLink`].
//! Subscribers attach with a [`SubscriberLink`], which connects and reads
//! on its own thread so the event loop never blocks.
//!
//! Stream kinds (TCP, UDS) carry 4-byte length-prefixed frames, UDP one
//! frame per datagram, WS one binary message per frame, SHM one slot per
//! frame.

pub mod frame;
pub mod publisher;
#[cfg(unix)]
pub mod shm;
pub mod stream;
pub mod subscriber;
pub mod tls;

pub use publisher::{PendingListeners, PublisherLink};
pub use stream::{Connection, StreamListener};
pub use subscriber::SubscriberLink;

use crate::channel::ChannelKind;
use crate::status::Status;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval of acceptor threads and non-blocking readers.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a reader thread reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One complete frame.
    Frame(Vec<u8>),
    /// The link is gone; no further events follow.
    Failed(Status),
}

/// Receiver of [`LinkEvent`]s. Called on the reader thread.
pub type FrameSink = Arc<dyn Fn(LinkEvent) + Send + Sync + 'static>;

/// Data-plane errors.
#[derive(Debug)]
pub enum LinkError {
    Io(io::Error),
    #[cfg(unix)]
    Shm(shm::ShmError),
    Tls(String),
    WebSocket(String),
    /// Kind not available on this platform or for this role.
    Unsupported(ChannelKind),
    /// No listener was opened for the negotiated kind.
    NoListener(ChannelKind),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(unix)]
            LinkError::Shm(e) => write!(f, "shared memory: {}", e),
            LinkError::Tls(msg) => write!(f, "TLS: {}", msg),
            LinkError::WebSocket(msg) => write!(f, "WebSocket: {}", msg),
            LinkError::Unsupported(kind) => write!(f, "{} channels are not supported here", kind),
            LinkError::NoListener(kind) => write!(f, "no {} listener was opened", kind),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Io(e) => Some(e),
            #[cfg(unix)]
            LinkError::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e)
    }
}

#[cfg(unix)]
impl From<shm::ShmError> for LinkError {
    fn from(e: shm::ShmError) -> Self {
        LinkError::Shm(e)
    }
}

impl From<tungstenite::Error> for LinkError {
    fn from(e: tungstenite::Error) -> Self {
        LinkError::WebSocket(e.to_string())
    }
}

impl From<LinkError> for Status {
    fn from(e: LinkError) -> Self {
        match e {
            #[cfg(unix)]
            LinkError::Shm(shm::ShmError::PayloadTooLarge { size, capacity }) => Status::buffer_too_small(
                format!("frame of {} bytes exceeds slot of {} bytes", size, capacity),
            ),
            LinkError::Unsupported(_) => Status::invalid_argument(e.to_string()),
            LinkError::NoListener(_) => Status::internal(e.to_string()),
            other => Status::transport_failure(other.to_string()),
        }
    }
}

pub(crate) fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>, LinkError>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Accept connections on `listener` until `closed` is set.
pub(crate) fn spawn_acceptor<F>(
    name: &str,
    listener: StreamListener,
    closed: Arc<AtomicBool>,
    mut on_connection: F,
) -> Result<JoinHandle<()>, LinkError>
where
    F: FnMut(Connection) + Send + 'static,
{
    spawn_named(name, move || {
        while !closed.load(Ordering::Acquire) {
            match listener.accept() {
                Ok(Some(conn)) => on_connection(conn),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    log::warn!("[transport] accept failed: {}", e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    })
}
