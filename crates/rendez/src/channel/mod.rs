// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel kinds, capability descriptors and negotiation.
//!
//! A node advertises the transports it can speak as a [`ChannelKinds`] set
//! inside a [`ChannelDescriptor`]. The Master intersects the publisher's and
//! subscribers' sets and picks one concrete [`ChannelKind`] using a fixed
//! priority order (see [`ChannelKind::PRIORITY`]).

pub mod descriptor;
pub mod negotiator;

pub use descriptor::{
    ChannelDescriptor, ChannelDescriptorBuilder, DescriptorWire, PeerCredentials, SslContext,
    UdsAuthHook, DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_SIZE, DEFAULT_SHM_SIZE,
};
pub use negotiator::{
    ChannelEndpoint, ChannelNegotiator, NegotiatedChannel, Negotiation, NegotiationError,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// One concrete transport mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Reliable byte stream over TCP.
    Tcp,
    /// Datagrams over UDP, one frame per datagram.
    Udp,
    /// Unix domain stream socket.
    Uds,
    /// POSIX shared memory ring.
    Shm,
    /// WebSocket binary messages.
    Ws,
}

impl ChannelKind {
    /// Selection order, highest priority first.
    pub const PRIORITY: [ChannelKind; 5] = [
        ChannelKind::Tcp,
        ChannelKind::Ws,
        ChannelKind::Uds,
        ChannelKind::Shm,
        ChannelKind::Udp,
    ];

    const fn bit(self) -> u8 {
        match self {
            ChannelKind::Tcp => 1 << 0,
            ChannelKind::Udp => 1 << 1,
            ChannelKind::Uds => 1 << 2,
            ChannelKind::Shm => 1 << 3,
            ChannelKind::Ws => 1 << 4,
        }
    }

    /// Stream kinds preserve ordering and carry RPC traffic.
    pub fn is_stream(self) -> bool {
        matches!(self, ChannelKind::Tcp | ChannelKind::Uds)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Tcp => "tcp",
            ChannelKind::Udp => "udp",
            ChannelKind::Uds => "uds",
            ChannelKind::Shm => "shm",
            ChannelKind::Ws => "ws",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ChannelKind::Tcp),
            "udp" => Ok(ChannelKind::Udp),
            "uds" => Ok(ChannelKind::Uds),
            "shm" => Ok(ChannelKind::Shm),
            "ws" => Ok(ChannelKind::Ws),
            other => Err(format!("unknown channel kind '{}'", other)),
        }
    }
}

/// Bitset of [`ChannelKind`] values, combinable with `|`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKinds(u8);

impl ChannelKinds {
    pub const TCP: ChannelKinds = ChannelKinds(ChannelKind::Tcp.bit());
    pub const UDP: ChannelKinds = ChannelKinds(ChannelKind::Udp.bit());
    pub const UDS: ChannelKinds = ChannelKinds(ChannelKind::Uds.bit());
    pub const SHM: ChannelKinds = ChannelKinds(ChannelKind::Shm.bit());
    pub const WS: ChannelKinds = ChannelKinds(ChannelKind::Ws.bit());
    pub const ALL: ChannelKinds = ChannelKinds(0b1_1111);

    pub const fn empty() -> Self {
        ChannelKinds(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: ChannelKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: ChannelKind) {
        self.0 |= kind.bit();
    }

    pub fn intersection(self, other: ChannelKinds) -> ChannelKinds {
        ChannelKinds(self.0 & other.0)
    }

    /// Highest-priority member, if any.
    pub fn best(self) -> Option<ChannelKind> {
        ChannelKind::PRIORITY
            .iter()
            .copied()
            .find(|k| self.contains(*k))
    }

    /// Members in priority order.
    pub fn iter(self) -> impl Iterator<Item = ChannelKind> {
        ChannelKind::PRIORITY
            .into_iter()
            .filter(move |k| self.contains(*k))
    }

    /// Only the kinds usable for request/response traffic.
    pub fn streams(self) -> ChannelKinds {
        self.iter()
            .filter(|k| k.is_stream())
            .fold(ChannelKinds::empty(), |acc, k| acc | k)
    }
}

impl From<ChannelKind> for ChannelKinds {
    fn from(kind: ChannelKind) -> Self {
        ChannelKinds(kind.bit())
    }
}

impl FromIterator<ChannelKind> for ChannelKinds {
    fn from_iter<I: IntoIterator<Item = ChannelKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ChannelKinds::empty(), |acc, k| acc | k)
    }
}

impl BitOr for ChannelKinds {
    type Output = ChannelKinds;

    fn bitor(self, rhs: ChannelKinds) -> ChannelKinds {
        ChannelKinds(self.0 | rhs.0)
    }
}

impl BitOr<ChannelKind> for ChannelKinds {
    type Output = ChannelKinds;

    fn bitor(self, rhs: ChannelKind) -> ChannelKinds {
        ChannelKinds(self.0 | rhs.bit())
    }
}

impl BitOrAssign for ChannelKinds {
    fn bitor_assign(&mut self, rhs: ChannelKinds) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ChannelKinds {
    type Output = ChannelKinds;

    fn bitand(self, rhs: ChannelKinds) -> ChannelKinds {
        self.intersection(rhs)
    }
}

impl fmt::Debug for ChannelKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ChannelKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ChannelKind::as_str).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_follows_priority() {
        let kinds = ChannelKinds::SHM | ChannelKinds::UDP | ChannelKinds::UDS;
        assert_eq!(kinds.best(), Some(ChannelKind::Uds));
        assert_eq!((ChannelKinds::UDP | ChannelKinds::WS).best(), Some(ChannelKind::Ws));
        assert_eq!(ChannelKinds::ALL.best(), Some(ChannelKind::Tcp));
        assert_eq!(ChannelKinds::empty().best(), None);
    }

    #[test]
    fn test_intersection() {
        let a = ChannelKinds::TCP | ChannelKinds::SHM;
        let b = ChannelKinds::SHM | ChannelKinds::UDP;
        let c = a & b;
        assert!(c.contains(ChannelKind::Shm));
        assert!(!c.contains(ChannelKind::Tcp));
        assert!((ChannelKinds::TCP & ChannelKinds::UDP).is_empty());
    }

    #[test]
    fn test_streams_filter() {
        let kinds = ChannelKinds::ALL.streams();
        assert_eq!(kinds, ChannelKinds::TCP | ChannelKinds::UDS);
        assert!(ChannelKinds::SHM.streams().is_empty());
    }

    #[test]
    fn test_parse_and_display() {
        let kind: ChannelKind = "SHM".parse().unwrap();
        assert_eq!(kind, ChannelKind::Shm);
        assert!("carrier-pigeon".parse::<ChannelKind>().is_err());
        let kinds: ChannelKinds = [ChannelKind::Udp, ChannelKind::Tcp].into_iter().collect();
        assert_eq!(kinds.to_string(), "{tcp,udp}");
    }
}
