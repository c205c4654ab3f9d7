// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher side of a topic channel.

use super::frame::write_frame;
use super::stream::{Connection, StreamListener};
use super::tls::TlsAcceptor;
use super::{spawn_acceptor, spawn_named, LinkError};
use crate::channel::{ChannelDescriptor, ChannelEndpoint, ChannelKind, ChannelKinds, NegotiatedChannel};
use crate::config::NodeConfig;
use crate::status::Status;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tungstenite::{Message, WebSocket};

/// Datagram a UDP subscriber sends to join a channel.
pub(crate) const UDP_JOIN: &[u8] = b"RZJOIN";
/// Datagram a UDP subscriber sends when it leaves.
pub(crate) const UDP_LEAVE: &[u8] = b"RZLEAVE";

/// A slow peer is dropped after this long on one write.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// Largest payload one IPv4 UDP datagram carries.
pub(crate) const UDP_MAX_PAYLOAD: usize = 65_507;

enum Listener {
    Stream {
        kind: ChannelKind,
        listener: StreamListener,
    },
    Udp(UdpSocket),
    #[cfg(unix)]
    Shm { name: String, size: usize },
}

impl Listener {
    fn kind(&self) -> ChannelKind {
        match self {
            Listener::Stream { kind, .. } => *kind,
            Listener::Udp(_) => ChannelKind::Udp,
            #[cfg(unix)]
            Listener::Shm { .. } => ChannelKind::Shm,
        }
    }

    fn endpoint(&self) -> Result<ChannelEndpoint, LinkError> {
        match self {
            Listener::Stream { kind, listener } => listener.endpoint(*kind),
            Listener::Udp(socket) => Ok(ChannelEndpoint::Udp {
                addr: socket.local_addr()?,
            }),
            #[cfg(unix)]
            Listener::Shm { name, size } => Ok(ChannelEndpoint::Shm {
                name: name.clone(),
                size: *size,
            }),
        }
    }
}

/// Listeners opened for every kind a publisher offers, before negotiation.
pub struct PendingListeners {
    listeners: Vec<Listener>,
    hint: String,
}

impl PendingListeners {
    /// Open one listener per kind in `descriptor`. Kinds this platform
    /// cannot serve are skipped; it is an error if none is left.
    pub fn open(descriptor: &ChannelDescriptor, config: &NodeConfig, hint: &str) -> Result<Self, LinkError> {
        let mut listeners = Vec::new();
        for kind in descriptor.kinds().iter() {
            let listener = match kind {
                ChannelKind::Tcp | ChannelKind::Ws | ChannelKind::Uds => {
                    match StreamListener::bind(kind, config, hint) {
                        Ok(listener) => Listener::Stream { kind, listener },
                        Err(LinkError::Unsupported(k)) => {
                            log::debug!("[transport] skipping {} for '{}'", k, hint);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                ChannelKind::Udp => {
                    Listener::Udp(UdpSocket::bind(SocketAddr::new(config.bind_address, 0))?)
                }
                #[cfg(unix)]
                ChannelKind::Shm => Listener::Shm {
                    name: super::shm::segment_name(),
                    size: descriptor.shm_size(),
                },
                #[cfg(not(unix))]
                ChannelKind::Shm => {
                    log::debug!("[transport] skipping shm for '{}'", hint);
                    continue;
                }
            };
            listeners.push(listener);
        }
        if listeners.is_empty() {
            return Err(LinkError::Unsupported(
                descriptor.kinds().best().unwrap_or(ChannelKind::Tcp),
            ));
        }
        Ok(Self {
            listeners,
            hint: hint.to_string(),
        })
    }

    /// Kinds that actually got a listener.
    pub fn kinds(&self) -> ChannelKinds {
        self.listeners.iter().map(Listener::kind).collect()
    }

    pub fn endpoints(&self) -> Result<Vec<ChannelEndpoint>, LinkError> {
        self.listeners.iter().map(Listener::endpoint).collect()
    }

    /// Keep the listener of the negotiated kind and start serving peers.
    pub fn activate(
        self,
        channel: &NegotiatedChannel,
        descriptor: &ChannelDescriptor,
    ) -> Result<PublisherLink, LinkError> {
        let hint = self.hint;
        let listener = self
            .listeners
            .into_iter()
            .find(|l| l.kind() == channel.kind)
            .ok_or(LinkError::NoListener(channel.kind))?;
        PublisherLink::start(listener, channel, descriptor, &hint)
    }
}

trait Peer: Send {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    fn label(&self) -> String;
}

struct StreamPeer {
    writer: Box<dyn Write + Send>,
    label: String,
}

impl Peer for StreamPeer {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        write_frame(&mut *self.writer, frame, u32::MAX as usize)
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

struct UdpPeer {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl Peer for UdpPeer {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.addr).map(|_| ())
    }

    fn label(&self) -> String {
        format!("udp://{}", self.addr)
    }
}

struct WsPeer {
    ws: WebSocket<TcpStream>,
    label: String,
}

impl Peer for WsPeer {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.ws
            .send(Message::Binary(frame.to_vec()))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

impl Drop for WsPeer {
    fn drop(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

#[cfg(unix)]
struct ShmPeer {
    ring: super::shm::ShmRingWriter,
}

#[cfg(unix)]
impl Peer for ShmPeer {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.ring
            .push(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }

    fn label(&self) -> String {
        format!("shm://{}", self.ring.name())
    }
}

struct LinkShared {
    closed: Arc<AtomicBool>,
    peers: Mutex<Vec<Box<dyn Peer>>>,
}

impl LinkShared {
    fn add(&self, peer: Box<dyn Peer>) {
        log::debug!("[transport] peer {} joined", peer.label());
        self.peers.lock().push(peer);
    }
}

/// Live publisher end of a negotiated channel.
///
/// Frames are queued without blocking and written to every peer by a
/// dispatcher thread. A fixed buffer bounds both the queue (`queue_size`
/// frames) and the frame size (`effective_buffer_size` bytes).
pub struct PublisherLink {
    kind: ChannelKind,
    endpoint: ChannelEndpoint,
    tx: Option<Sender<Vec<u8>>>,
    queue_size: Option<usize>,
    max_frame: Option<usize>,
    shared: Arc<LinkShared>,
}

impl PublisherLink {
    fn start(
        listener: Listener,
        channel: &NegotiatedChannel,
        descriptor: &ChannelDescriptor,
        hint: &str,
    ) -> Result<Self, LinkError> {
        let dynamic = channel.is_dynamic_buffer || descriptor.is_dynamic_buffer();
        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = if dynamic {
            channel::unbounded()
        } else {
            channel::bounded(descriptor.queue_size())
        };
        let shared = Arc::new(LinkShared {
            closed: Arc::new(AtomicBool::new(false)),
            peers: Mutex::new(Vec::new()),
        });
        let endpoint = listener.endpoint()?;
        let mut max_frame = if dynamic {
            None
        } else {
            Some(channel.effective_buffer_size)
        };

        match listener {
            Listener::Stream {
                kind: ChannelKind::Ws,
                listener,
            } => {
                let peers = shared.clone();
                spawn_acceptor(
                    "rendez-ws-accept",
                    listener,
                    shared.closed.clone(),
                    move |conn| match accept_ws(conn) {
                        Ok(peer) => peers.add(Box::new(peer)),
                        Err(e) => log::warn!("[transport] ws handshake failed: {}", e),
                    },
                )?;
            }
            Listener::Stream { kind, listener } => {
                let tls = match (&channel.ssl_context, kind) {
                    (Some(channel_ctx), ChannelKind::Tcp) => {
                        let ctx = descriptor.ssl_context().unwrap_or(channel_ctx);
                        Some(TlsAcceptor::new(ctx)?)
                    }
                    _ => None,
                };
                let hook = descriptor.uds_auth_hook().cloned();
                let peers = shared.clone();
                spawn_acceptor(
                    "rendez-accept",
                    listener,
                    shared.closed.clone(),
                    move |conn| {
                        if kind == ChannelKind::Uds {
                            if let Some(hook) = &hook {
                                let admitted = conn.peer_credentials().map(|c| (c, hook(&c)));
                                match admitted {
                                    Some((_, true)) => {}
                                    Some((creds, false)) => {
                                        log::warn!("[transport] uds peer {:?} rejected by auth hook", creds);
                                        return;
                                    }
                                    None => {
                                        log::warn!("[transport] uds peer without credentials rejected");
                                        return;
                                    }
                                }
                            }
                        }
                        match accept_stream(conn, tls.as_ref()) {
                            Ok(peer) => peers.add(Box::new(peer)),
                            Err(e) => log::warn!("[transport] accept failed: {}", e),
                        }
                    },
                )?;
            }
            Listener::Udp(socket) => {
                // One frame is one datagram, dynamic buffer or not.
                max_frame = Some(max_frame.map_or(UDP_MAX_PAYLOAD, |m| m.min(UDP_MAX_PAYLOAD)));
                let socket = Arc::new(socket);
                socket.set_read_timeout(Some(super::POLL_INTERVAL * 5))?;
                let peers = shared.clone();
                spawn_named("rendez-udp-join", move || serve_udp_joins(socket, peers))?;
            }
            #[cfg(unix)]
            Listener::Shm { name, size } => {
                let slot = channel.effective_buffer_size.max(descriptor.buffer_size());
                let ring = super::shm::ShmRingWriter::create(&name, size, slot)?;
                max_frame = Some(ring.slot_size());
                shared.add(Box::new(ShmPeer { ring }));
            }
        }

        let dispatch = shared.clone();
        spawn_named("rendez-dispatch", move || {
            while let Ok(frame) = rx.recv() {
                let mut peers = dispatch.peers.lock();
                peers.retain_mut(|peer| match peer.send(&frame) {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("[transport] dropping peer {}: {}", peer.label(), e);
                        false
                    }
                });
            }
            dispatch.peers.lock().clear();
        })?;

        log::info!("[transport] '{}' publishing on {}", hint, endpoint);
        Ok(Self {
            kind: channel.kind,
            endpoint,
            tx: Some(tx),
            queue_size: (!dynamic).then(|| descriptor.queue_size()),
            max_frame,
            shared,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Queue one frame. Never blocks.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), Status> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Status::unregistered("channel is closed"));
        };
        if let Some(max) = self.max_frame {
            if frame.len() > max {
                return Err(Status::buffer_too_small(format!(
                    "message of {} bytes exceeds the {}-byte channel buffer",
                    frame.len(),
                    max
                )));
            }
        }
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Status::backpressure(format!(
                "send queue of {} messages is full",
                self.queue_size.unwrap_or_default()
            )),
            TrySendError::Disconnected(_) => Status::transport_failure("dispatcher stopped"),
        })
    }

    /// Stop serving. Never blocks: the background threads wind down on
    /// their own and peers see the connection close once the dispatcher
    /// finished its current write.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx = None;
        if let Some(mut peers) = self.shared.peers.try_lock() {
            peers.clear();
        }
        log::debug!("[transport] closed {}", self.endpoint);
    }
}

impl Drop for PublisherLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_stream(conn: Connection, tls: Option<&TlsAcceptor>) -> Result<StreamPeer, LinkError> {
    conn.set_write_timeout(Some(PEER_WRITE_TIMEOUT))?;
    let label = conn.describe();
    let writer: Box<dyn Write + Send> = match tls {
        Some(tls) => {
            let stream = conn.into_tcp().ok_or(LinkError::Unsupported(ChannelKind::Uds))?;
            stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
            tls.accept(stream)?
        }
        None => Box::new(conn),
    };
    Ok(StreamPeer { writer, label })
}

fn accept_ws(conn: Connection) -> Result<WsPeer, LinkError> {
    let label = format!("ws+{}", conn.describe());
    let stream = conn.into_tcp().ok_or(LinkError::Unsupported(ChannelKind::Ws))?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(PEER_WRITE_TIMEOUT))?;
    let ws = tungstenite::accept(stream).map_err(|e| LinkError::WebSocket(e.to_string()))?;
    Ok(WsPeer { ws, label })
}

fn serve_udp_joins(socket: Arc<UdpSocket>, shared: Arc<LinkShared>) {
    let mut joined = HashSet::new();
    let mut buf = [0u8; 64];
    while !shared.closed.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) if &buf[..n] == UDP_JOIN => {
                if joined.insert(addr) {
                    shared.add(Box::new(UdpPeer {
                        socket: socket.clone(),
                        addr,
                    }));
                }
            }
            Ok((n, addr)) if &buf[..n] == UDP_LEAVE => {
                if joined.remove(&addr) {
                    let label = format!("udp://{}", addr);
                    shared.peers.lock().retain(|p| p.label() != label);
                    log::debug!("[transport] peer {} left", label);
                }
            }
            Ok((_, addr)) => log::debug!("[transport] ignoring datagram from {}", addr),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                log::warn!("[transport] udp join socket failed: {}", e);
                break;
            }
        }
    }
}
