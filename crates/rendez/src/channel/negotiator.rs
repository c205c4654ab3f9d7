// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel negotiation.
//!
//! Runs on the Master on behalf of a topic (or a service client) and turns
//! the capability descriptors of all participants into one
//! [`NegotiatedChannel`].
//!
//! # Rules
//!
//! - Candidate kinds are the publisher's kinds intersected with every
//!   subscriber's kinds. An empty candidate set fails every participant
//!   with `ChannelMismatch`.
//! - The winner is the highest-priority candidate (TCP > WS > UDS > SHM > UDP).
//! - If anyone asked for a dynamic buffer the effective size is the maximum
//!   requested size. Otherwise the publisher's size is authoritative and a
//!   subscriber asking for more fails with `BufferTooSmall`.
//! - An SSL context is attached only to TCP channels.
//! - Late joiners must accept the already-selected kind.

use super::descriptor::{DescriptorWire, SslContext};
use super::{ChannelKind, ChannelKinds};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Transport-specific address of a publisher or service listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelEndpoint {
    Tcp { addr: SocketAddr },
    Udp { addr: SocketAddr },
    Uds { path: PathBuf },
    Shm { name: String, size: usize },
    Ws { addr: SocketAddr },
}

impl ChannelEndpoint {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelEndpoint::Tcp { .. } => ChannelKind::Tcp,
            ChannelEndpoint::Udp { .. } => ChannelKind::Udp,
            ChannelEndpoint::Uds { .. } => ChannelKind::Uds,
            ChannelEndpoint::Shm { .. } => ChannelKind::Shm,
            ChannelEndpoint::Ws { .. } => ChannelKind::Ws,
        }
    }
}

impl fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEndpoint::Tcp { addr } => write!(f, "tcp://{}", addr),
            ChannelEndpoint::Udp { addr } => write!(f, "udp://{}", addr),
            ChannelEndpoint::Uds { path } => write!(f, "uds://{}", path.display()),
            ChannelEndpoint::Shm { name, size } => write!(f, "shm://{} ({} bytes)", name, size),
            ChannelEndpoint::Ws { addr } => write!(f, "ws://{}", addr),
        }
    }
}

/// Concrete channel chosen for a topic or a service client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedChannel {
    pub kind: ChannelKind,
    pub endpoint: ChannelEndpoint,
    pub effective_buffer_size: usize,
    #[serde(default)]
    pub is_dynamic_buffer: bool,
    #[serde(default)]
    pub ssl_context: Option<SslContext>,
}

/// Why a negotiation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// No kind common to all participants.
    ChannelMismatch {
        offered: ChannelKinds,
        requested: ChannelKinds,
    },
    /// Fixed buffer is smaller than a participant's request.
    BufferTooSmall { available: usize, requested: usize },
    /// Publisher did not open a listener for the selected kind.
    MissingEndpoint(ChannelKind),
    /// Service registrations must offer at least one stream kind.
    NoStreamKind(ChannelKinds),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelMismatch { offered, requested } => {
                write!(f, "no common channel kind (offered {}, requested {})", offered, requested)
            }
            Self::BufferTooSmall {
                available,
                requested,
            } => write!(
                f,
                "fixed buffer of {} bytes cannot hold requested {} bytes",
                available, requested
            ),
            Self::MissingEndpoint(kind) => write!(f, "no {} endpoint advertised", kind),
            Self::NoStreamKind(kinds) => {
                write!(f, "services need a stream kind (tcp or uds), got {}", kinds)
            }
        }
    }
}

impl std::error::Error for NegotiationError {}

impl From<NegotiationError> for Status {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::ChannelMismatch { .. } => Status::channel_mismatch(e.to_string()),
            NegotiationError::BufferTooSmall { .. } => Status::buffer_too_small(e.to_string()),
            NegotiationError::MissingEndpoint(_) => Status::registration_failed(e.to_string()),
            NegotiationError::NoStreamKind(_) => Status::invalid_argument(e.to_string()),
        }
    }
}

/// Result of a publisher-driven negotiation.
#[derive(Debug, Clone)]
pub struct Negotiation {
    /// The selected channel.
    pub channel: NegotiatedChannel,
    /// Indices (into the subscriber slice) of subscribers that could not
    /// be admitted, with the reason. All other subscribers are admitted.
    pub rejected: Vec<(usize, NegotiationError)>,
}

/// Stateless negotiation rules.
pub struct ChannelNegotiator;

impl ChannelNegotiator {
    /// Negotiate a topic channel between a publisher and the subscribers
    /// currently waiting on the topic.
    ///
    /// # Errors
    ///
    /// Fails as a whole on `ChannelMismatch` (every participant is affected)
    /// or when the publisher has no endpoint for the selected kind.
    /// Per-subscriber buffer failures are reported in
    /// [`Negotiation::rejected`] instead.
    pub fn negotiate(
        publisher: &DescriptorWire,
        endpoints: &[ChannelEndpoint],
        subscribers: &[&DescriptorWire],
    ) -> Result<Negotiation, NegotiationError> {
        let requested = subscribers
            .iter()
            .fold(ChannelKinds::ALL, |acc, s| acc & s.kinds);
        let candidate = publisher.kinds & requested;
        let kind = candidate
            .best()
            .ok_or(NegotiationError::ChannelMismatch {
                offered: publisher.kinds,
                requested,
            })?;
        let endpoint = find_endpoint(endpoints, kind)?;

        let dynamic = publisher.is_dynamic_buffer || subscribers.iter().any(|s| s.is_dynamic_buffer);
        let mut rejected = Vec::new();
        let effective_buffer_size = if dynamic {
            subscribers
                .iter()
                .map(|s| s.buffer_size)
                .fold(publisher.buffer_size, usize::max)
        } else {
            for (idx, sub) in subscribers.iter().enumerate() {
                if sub.buffer_size > publisher.buffer_size {
                    rejected.push((
                        idx,
                        NegotiationError::BufferTooSmall {
                            available: publisher.buffer_size,
                            requested: sub.buffer_size,
                        },
                    ));
                }
            }
            publisher.buffer_size
        };

        let ssl_context = if kind == ChannelKind::Tcp {
            publisher
                .ssl_context
                .clone()
                .or_else(|| subscribers.iter().find_map(|s| s.ssl_context.clone()))
        } else {
            None
        };

        log::debug!(
            "[negotiator] selected {} from {} (buffer={} dynamic={} rejected={})",
            kind,
            candidate,
            effective_buffer_size,
            dynamic,
            rejected.len()
        );

        Ok(Negotiation {
            channel: NegotiatedChannel {
                kind,
                endpoint,
                effective_buffer_size,
                is_dynamic_buffer: dynamic,
                ssl_context,
            },
            rejected,
        })
    }

    /// Admit a subscriber to a topic whose channel is already negotiated.
    ///
    /// Returns the channel as seen by the newcomer. With a dynamic buffer
    /// the effective size grows to the newcomer's request.
    pub fn admit(
        channel: &NegotiatedChannel,
        subscriber: &DescriptorWire,
    ) -> Result<NegotiatedChannel, NegotiationError> {
        if !subscriber.kinds.contains(channel.kind) {
            return Err(NegotiationError::ChannelMismatch {
                offered: channel.kind.into(),
                requested: subscriber.kinds,
            });
        }

        let mut admitted = channel.clone();
        if channel.is_dynamic_buffer {
            admitted.effective_buffer_size =
                channel.effective_buffer_size.max(subscriber.buffer_size);
        } else if !subscriber.is_dynamic_buffer
            && subscriber.buffer_size > channel.effective_buffer_size
        {
            return Err(NegotiationError::BufferTooSmall {
                available: channel.effective_buffer_size,
                requested: subscriber.buffer_size,
            });
        }
        if admitted.kind == ChannelKind::Tcp && admitted.ssl_context.is_none() {
            admitted.ssl_context = subscriber.ssl_context.clone();
        }
        Ok(admitted)
    }

    /// Pick the channel one service client uses to reach the server.
    ///
    /// Only stream kinds are eligible. Service channels never carry an SSL
    /// context.
    pub fn negotiate_service(
        server: &DescriptorWire,
        endpoints: &[ChannelEndpoint],
        client: &DescriptorWire,
    ) -> Result<NegotiatedChannel, NegotiationError> {
        let requested = client.kinds.streams();
        if requested.is_empty() {
            return Err(NegotiationError::NoStreamKind(client.kinds));
        }
        let offered = server.kinds.streams();
        let kind = (offered & requested)
            .best()
            .ok_or(NegotiationError::ChannelMismatch { offered, requested })?;
        let endpoint = find_endpoint(endpoints, kind)?;

        let dynamic = server.is_dynamic_buffer || client.is_dynamic_buffer;
        let effective_buffer_size = if dynamic {
            server.buffer_size.max(client.buffer_size)
        } else if client.buffer_size > server.buffer_size {
            return Err(NegotiationError::BufferTooSmall {
                available: server.buffer_size,
                requested: client.buffer_size,
            });
        } else {
            server.buffer_size
        };

        // TLS is only layered on topic channels.
        Ok(NegotiatedChannel {
            kind,
            endpoint,
            effective_buffer_size,
            is_dynamic_buffer: dynamic,
            ssl_context: None,
        })
    }
}

fn find_endpoint(
    endpoints: &[ChannelEndpoint],
    kind: ChannelKind,
) -> Result<ChannelEndpoint, NegotiationError> {
    endpoints
        .iter()
        .find(|e| e.kind() == kind)
        .cloned()
        .ok_or(NegotiationError::MissingEndpoint(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<ChannelEndpoint> {
        vec![
            ChannelEndpoint::Tcp {
                addr: "127.0.0.1:4000".parse().unwrap(),
            },
            ChannelEndpoint::Udp {
                addr: "127.0.0.1:4001".parse().unwrap(),
            },
            ChannelEndpoint::Uds {
                path: PathBuf::from("/tmp/rendez-test.sock"),
            },
            ChannelEndpoint::Shm {
                name: "/rendez_test".into(),
                size: 1 << 20,
            },
            ChannelEndpoint::Ws {
                addr: "127.0.0.1:4002".parse().unwrap(),
            },
        ]
    }

    fn wire(kinds: ChannelKinds, buffer: usize, dynamic: bool) -> DescriptorWire {
        DescriptorWire::new(kinds, buffer, dynamic)
    }

    #[test]
    fn test_tcp_shm_vs_shm_udp_selects_shm() {
        let publisher = wire(ChannelKinds::TCP | ChannelKinds::SHM, 1024, false);
        let sub = wire(ChannelKinds::SHM | ChannelKinds::UDP, 1024, false);
        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&sub]).unwrap();
        assert_eq!(n.channel.kind, ChannelKind::Shm);
        assert!(n.rejected.is_empty());
    }

    #[test]
    fn test_no_subscribers_uses_publisher_kinds() {
        let publisher = wire(ChannelKinds::UDP | ChannelKinds::WS, 512, false);
        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[]).unwrap();
        assert_eq!(n.channel.kind, ChannelKind::Ws);
        assert_eq!(n.channel.effective_buffer_size, 512);
    }

    #[test]
    fn test_empty_intersection_is_mismatch() {
        let publisher = wire(ChannelKinds::TCP, 512, false);
        let a = wire(ChannelKinds::TCP | ChannelKinds::UDP, 512, false);
        let b = wire(ChannelKinds::UDP, 512, false);
        let err = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&a, &b]).unwrap_err();
        assert!(matches!(err, NegotiationError::ChannelMismatch { .. }));
        let status: Status = err.into();
        assert_eq!(status.code(), crate::status::StatusCode::ChannelMismatch);
    }

    #[test]
    fn test_fixed_buffer_rejects_larger_subscriber() {
        let publisher = wire(ChannelKinds::TCP, 512, false);
        let small = wire(ChannelKinds::TCP, 256, false);
        let large = wire(ChannelKinds::TCP, 1024, false);
        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&small, &large]).unwrap();
        assert_eq!(n.channel.effective_buffer_size, 512);
        assert_eq!(n.rejected.len(), 1);
        assert_eq!(n.rejected[0].0, 1);
        assert!(matches!(
            n.rejected[0].1,
            NegotiationError::BufferTooSmall {
                available: 512,
                requested: 1024
            }
        ));
    }

    #[test]
    fn test_dynamic_buffer_takes_max() {
        let publisher = wire(ChannelKinds::TCP, 512, false);
        let sub = wire(ChannelKinds::TCP, 4096, true);
        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&sub]).unwrap();
        assert_eq!(n.channel.effective_buffer_size, 4096);
        assert!(n.channel.is_dynamic_buffer);
        assert!(n.rejected.is_empty());
    }

    #[test]
    fn test_ssl_only_on_tcp() {
        let mut publisher = wire(ChannelKinds::TCP | ChannelKinds::UDS, 512, false);
        publisher.ssl_context = Some(SslContext::new("localhost"));
        let tcp_sub = wire(ChannelKinds::TCP, 512, false);
        let uds_sub = wire(ChannelKinds::UDS, 512, false);

        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&tcp_sub]).unwrap();
        assert!(n.channel.ssl_context.is_some());

        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[&uds_sub]).unwrap();
        assert_eq!(n.channel.kind, ChannelKind::Uds);
        assert!(n.channel.ssl_context.is_none());
    }

    #[test]
    fn test_missing_endpoint() {
        let publisher = wire(ChannelKinds::TCP, 512, false);
        let err = ChannelNegotiator::negotiate(&publisher, &[], &[]).unwrap_err();
        assert_eq!(err, NegotiationError::MissingEndpoint(ChannelKind::Tcp));
    }

    #[test]
    fn test_late_joiner_must_contain_selected_kind() {
        let publisher = wire(ChannelKinds::SHM, 512, false);
        let n = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[]).unwrap();
        let udp_only = wire(ChannelKinds::UDP, 512, false);
        assert!(matches!(
            ChannelNegotiator::admit(&n.channel, &udp_only),
            Err(NegotiationError::ChannelMismatch { .. })
        ));
        let shm = wire(ChannelKinds::SHM | ChannelKinds::UDP, 256, false);
        let admitted = ChannelNegotiator::admit(&n.channel, &shm).unwrap();
        assert_eq!(admitted.kind, ChannelKind::Shm);
    }

    #[test]
    fn test_late_joiner_buffer_rules() {
        let publisher = wire(ChannelKinds::TCP, 512, false);
        let fixed = ChannelNegotiator::negotiate(&publisher, &endpoints(), &[])
            .unwrap()
            .channel;
        let big = wire(ChannelKinds::TCP, 1024, false);
        assert!(ChannelNegotiator::admit(&fixed, &big).is_err());
        let big_dynamic = wire(ChannelKinds::TCP, 1024, true);
        assert_eq!(
            ChannelNegotiator::admit(&fixed, &big_dynamic)
                .unwrap()
                .effective_buffer_size,
            512
        );

        let dyn_pub = wire(ChannelKinds::TCP, 512, true);
        let dynamic = ChannelNegotiator::negotiate(&dyn_pub, &endpoints(), &[])
            .unwrap()
            .channel;
        let admitted = ChannelNegotiator::admit(&dynamic, &big).unwrap();
        assert_eq!(admitted.effective_buffer_size, 1024);
    }

    #[test]
    fn test_service_negotiation_streams_only() {
        let server = wire(ChannelKinds::TCP | ChannelKinds::UDS, 512, false);
        let client = wire(ChannelKinds::UDS | ChannelKinds::SHM, 512, false);
        let ch = ChannelNegotiator::negotiate_service(&server, &endpoints(), &client).unwrap();
        assert_eq!(ch.kind, ChannelKind::Uds);

        let shm_only = wire(ChannelKinds::SHM, 512, false);
        assert!(matches!(
            ChannelNegotiator::negotiate_service(&server, &endpoints(), &shm_only),
            Err(NegotiationError::NoStreamKind(_))
        ));
    }
}
