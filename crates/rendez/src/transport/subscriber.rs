// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber side of a topic channel.

use super::frame::read_frame;
use super::publisher::{UDP_JOIN, UDP_LEAVE};
use super::stream::Connection;
use super::tls::TlsConnector;
use super::{spawn_named, FrameSink, LinkError, LinkEvent, POLL_INTERVAL};
use crate::channel::{ChannelDescriptor, ChannelEndpoint, NegotiatedChannel, SslContext};
use crate::config::NodeConfig;
use crate::status::Status;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tungstenite::Message;

/// UDP subscribers repeat their join this often.
const UDP_REJOIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65_536;

enum Closer {
    Stream(Connection),
    Tcp(TcpStream),
    Udp { socket: UdpSocket, publisher: SocketAddr },
}

impl Closer {
    fn close(self) {
        match self {
            Closer::Stream(conn) => conn.shutdown(),
            Closer::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Closer::Udp { socket, publisher } => {
                let _ = socket.send_to(UDP_LEAVE, publisher);
            }
        }
    }
}

struct ReaderShared {
    closed: AtomicBool,
    closer: Mutex<Option<Closer>>,
}

impl ReaderShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register how to interrupt the reader. Returns false if the link was
    /// closed meanwhile (the closer is then run right away).
    fn arm(&self, closer: Closer) -> bool {
        let mut slot = self.closer.lock();
        if self.is_closed() {
            drop(slot);
            closer.close();
            return false;
        }
        *slot = Some(closer);
        true
    }
}

/// Live subscriber end of a negotiated channel.
///
/// Connecting and reading happen on a background thread; every frame and
/// the final failure (if any) are handed to the sink.
pub struct SubscriberLink {
    shared: Arc<ReaderShared>,
    thread: Option<JoinHandle<()>>,
    endpoint: ChannelEndpoint,
}

impl SubscriberLink {
    /// Start attaching to `channel`. Never blocks.
    pub fn connect(
        channel: &NegotiatedChannel,
        local: &ChannelDescriptor,
        config: &NodeConfig,
        sink: FrameSink,
    ) -> Result<Self, LinkError> {
        let shared = Arc::new(ReaderShared {
            closed: AtomicBool::new(false),
            closer: Mutex::new(None),
        });
        let max_frame = if channel.is_dynamic_buffer {
            config.max_message_size
        } else {
            channel.effective_buffer_size
        };
        let tls = match (&channel.endpoint, &channel.ssl_context) {
            (ChannelEndpoint::Tcp { .. }, Some(channel_ctx)) => {
                let ctx = pick_client_ctx(local.ssl_context(), channel_ctx);
                Some(TlsConnector::new(ctx)?)
            }
            _ => None,
        };
        let reader = Reader {
            endpoint: channel.endpoint.clone(),
            max_frame,
            timeout: config.connect_timeout(),
            bind: SocketAddr::new(config.bind_address, 0),
            tls,
            shared: shared.clone(),
            sink: sink.clone(),
        };
        let thread = spawn_named("rendez-sub-rx", move || {
            let shared = reader.shared.clone();
            let outcome = reader.run();
            if shared.is_closed() {
                return;
            }
            let status = match outcome {
                Ok(()) => Status::transport_failure("publisher closed the channel"),
                Err(e) => Status::from(e),
            };
            sink(LinkEvent::Failed(status));
        })?;
        Ok(Self {
            shared,
            thread: Some(thread),
            endpoint: channel.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    /// Stop reading. No event is delivered after this returns.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(closer) = self.shared.closer.lock().take() {
            closer.close();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SubscriberLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Prefer the local context when it carries trust anchors.
fn pick_client_ctx<'a>(local: Option<&'a SslContext>, channel: &'a SslContext) -> &'a SslContext {
    match local {
        Some(ctx) if ctx.ca_path.is_some() => ctx,
        _ => channel,
    }
}

struct Reader {
    endpoint: ChannelEndpoint,
    max_frame: usize,
    timeout: Duration,
    bind: SocketAddr,
    tls: Option<TlsConnector>,
    shared: Arc<ReaderShared>,
    sink: FrameSink,
}

impl Reader {
    /// `Ok(())` means the publisher closed the channel (or we were closed).
    fn run(self) -> Result<(), LinkError> {
        match self.endpoint.clone() {
            ChannelEndpoint::Tcp { .. } | ChannelEndpoint::Uds { .. } => self.run_stream(),
            ChannelEndpoint::Ws { addr } => self.run_ws(addr),
            ChannelEndpoint::Udp { addr } => self.run_udp(addr),
            #[cfg(unix)]
            ChannelEndpoint::Shm { name, size } => self.run_shm(&name, size),
            #[cfg(not(unix))]
            ChannelEndpoint::Shm { .. } => Err(LinkError::Unsupported(crate::channel::ChannelKind::Shm)),
        }
    }

    fn run_stream(self) -> Result<(), LinkError> {
        let conn = Connection::connect(&self.endpoint, self.timeout)?;
        if !self.shared.arm(Closer::Stream(conn.try_clone()?)) {
            return Ok(());
        }
        let mut reader: Box<dyn Read + Send> = match &self.tls {
            Some(tls) => {
                let stream = conn
                    .into_tcp()
                    .ok_or_else(|| LinkError::Tls("TLS requires a TCP channel".into()))?;
                tls.connect(stream)?
            }
            None => Box::new(conn),
        };
        log::debug!("[transport] attached to {}", self.endpoint);
        while let Some(frame) = read_frame(&mut *reader, self.max_frame)? {
            (self.sink)(LinkEvent::Frame(frame));
        }
        Ok(())
    }

    fn run_ws(self, addr: SocketAddr) -> Result<(), LinkError> {
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_nodelay(true).ok();
        if !self.shared.arm(Closer::Tcp(stream.try_clone()?)) {
            return Ok(());
        }
        let url = format!("ws://{}/", addr);
        let (mut ws, _) = tungstenite::client::client(url.as_str(), stream)
            .map_err(|e| LinkError::WebSocket(e.to_string()))?;
        log::debug!("[transport] attached to {}", self.endpoint);
        loop {
            match ws.read() {
                Ok(Message::Binary(frame)) => {
                    if frame.len() > self.max_frame {
                        return Err(LinkError::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame of {} bytes exceeds limit {}", frame.len(), self.max_frame),
                        )));
                    }
                    (self.sink)(LinkEvent::Frame(frame));
                }
                Ok(Message::Close(_)) => return Ok(()),
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn run_udp(self, publisher: SocketAddr) -> Result<(), LinkError> {
        let socket = UdpSocket::bind(self.bind)?;
        socket.set_read_timeout(Some(POLL_INTERVAL * 5))?;
        if !self.shared.arm(Closer::Udp {
            socket: socket.try_clone()?,
            publisher,
        }) {
            return Ok(());
        }
        socket.send_to(UDP_JOIN, publisher)?;
        let mut last_join = Instant::now();
        log::debug!("[transport] joined {}", self.endpoint);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !self.shared.is_closed() {
            if last_join.elapsed() >= UDP_REJOIN_INTERVAL {
                socket.send_to(UDP_JOIN, publisher)?;
                last_join = Instant::now();
            }
            match socket.recv_from(&mut buf) {
                Ok((n, from)) if from == publisher => {
                    if n > self.max_frame {
                        log::warn!("[transport] dropping {}-byte datagram over limit {}", n, self.max_frame);
                        continue;
                    }
                    (self.sink)(LinkEvent::Frame(buf[..n].to_vec()));
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn run_shm(self, name: &str, size: usize) -> Result<(), LinkError> {
        use super::shm::ShmError;

        let mut ring = self.attach_shm(name, size)?;
        log::debug!("[transport] attached to {}", self.endpoint);
        let mut buf = Vec::with_capacity(ring.slot_size());
        let mut idle = 0u32;
        while !self.shared.is_closed() {
            match ring.try_pop(&mut buf) {
                Ok(true) => {
                    idle = 0;
                    (self.sink)(LinkEvent::Frame(std::mem::take(&mut buf)));
                }
                Ok(false) => {
                    if ring.is_closed() {
                        return Ok(());
                    }
                    idle = idle.saturating_add(1);
                    if idle < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::sleep(Duration::from_micros(500));
                    }
                }
                Err(ShmError::Overrun { skipped }) => {
                    log::warn!("[transport] {} overrun, {} messages lost", self.endpoint, skipped);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// The publisher creates its segment only once it is active, so a
    /// missing or half-initialised segment is waited for until the connect
    /// timeout.
    #[cfg(unix)]
    fn attach_shm(&self, name: &str, size: usize) -> Result<super::shm::ShmRingReader, LinkError> {
        use super::shm::{ShmError, ShmRingReader};

        let deadline = Instant::now() + self.timeout;
        loop {
            match ShmRingReader::attach(name, size) {
                Ok(ring) => return Ok(ring),
                Err(ShmError::NotFound(_)) | Err(ShmError::Corruption)
                    if Instant::now() < deadline && !self.shared.is_closed() =>
                {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, ChannelKinds};
    use crate::transport::PendingListeners;
    use crossbeam::channel::{self, Receiver};

    fn collecting_sink() -> (FrameSink, Receiver<LinkEvent>) {
        let (tx, rx) = channel::unbounded();
        let sink: FrameSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    fn negotiated(kind: ChannelKind, endpoint: ChannelEndpoint, size: usize) -> NegotiatedChannel {
        NegotiatedChannel {
            kind,
            endpoint,
            effective_buffer_size: size,
            is_dynamic_buffer: false,
            ssl_context: None,
        }
    }

    /// Publish `count` frames until one round arrives at the subscriber.
    fn round_trip(kind: ChannelKinds, config: &NodeConfig) {
        let descriptor = ChannelDescriptor::builder()
            .kinds(kind)
            .buffer_size(1024)
            .build()
            .unwrap();
        let pending = PendingListeners::open(&descriptor, config, "chatter").unwrap();
        let endpoint = pending.endpoints().unwrap().remove(0);
        let channel = negotiated(endpoint.kind(), endpoint, 1024);
        let publisher = pending.activate(&channel, &descriptor).unwrap();

        let (sink, rx) = collecting_sink();
        let mut subscriber = SubscriberLink::connect(&channel, &descriptor, config, sink).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            let _ = publisher.try_send(b"hello".to_vec());
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                received = Some(event);
            }
        }
        assert_eq!(received, Some(LinkEvent::Frame(b"hello".to_vec())));
        subscriber.close();
    }

    #[test]
    fn test_tcp_round_trip() {
        round_trip(ChannelKinds::TCP, &NodeConfig::default());
    }

    #[test]
    fn test_udp_round_trip() {
        round_trip(ChannelKinds::UDP, &NodeConfig::default());
    }

    #[test]
    fn test_ws_round_trip() {
        round_trip(ChannelKinds::WS, &NodeConfig::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_uds_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        round_trip(ChannelKinds::UDS, &NodeConfig::default().with_uds_dir(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_shm_round_trip() {
        round_trip(ChannelKinds::SHM, &NodeConfig::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_shm_subscriber_waits_for_segment() {
        let config = NodeConfig::default();
        let descriptor = ChannelDescriptor::builder()
            .kinds(ChannelKinds::SHM)
            .buffer_size(1024)
            .build()
            .unwrap();
        let pending = PendingListeners::open(&descriptor, &config, "early").unwrap();
        let endpoint = pending.endpoints().unwrap().remove(0);
        let channel = negotiated(ChannelKind::Shm, endpoint, 1024);

        // Attach before the segment exists.
        let (sink, rx) = collecting_sink();
        let mut subscriber = SubscriberLink::connect(&channel, &descriptor, &config, sink).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let publisher = pending.activate(&channel, &descriptor).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            let _ = publisher.try_send(b"late".to_vec());
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                received = Some(event);
            }
        }
        assert_eq!(received, Some(LinkEvent::Frame(b"late".to_vec())));
        subscriber.close();
    }

    #[test]
    fn test_publisher_close_reports_failure() {
        let config = NodeConfig::default();
        let descriptor = ChannelDescriptor::default();
        let pending = PendingListeners::open(&descriptor, &config, "t").unwrap();
        let endpoint = pending.endpoints().unwrap().remove(0);
        let channel = negotiated(ChannelKind::Tcp, endpoint, descriptor.buffer_size());
        let mut publisher = pending.activate(&channel, &descriptor).unwrap();

        let (sink, rx) = collecting_sink();
        let _subscriber = SubscriberLink::connect(&channel, &descriptor, &config, sink).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.peer_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        publisher.close();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            LinkEvent::Failed(status) => {
                assert_eq!(status.code(), crate::status::StatusCode::TransportFailure)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_suppresses_failure() {
        let config = NodeConfig::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = ChannelEndpoint::Tcp {
            addr: listener.local_addr().unwrap(),
        };
        let channel = negotiated(ChannelKind::Tcp, endpoint, 64);
        let (sink, rx) = collecting_sink();
        let mut subscriber =
            SubscriberLink::connect(&channel, &ChannelDescriptor::default(), &config, sink).unwrap();
        let (_server, _) = listener.accept().unwrap();
        subscriber.close();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_connect_refused_reports_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let channel = negotiated(ChannelKind::Tcp, ChannelEndpoint::Tcp { addr }, 64);
        let (sink, rx) = collecting_sink();
        let _subscriber = SubscriberLink::connect(
            &channel,
            &ChannelDescriptor::default(),
            &NodeConfig::default(),
            sink,
        )
        .unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            LinkEvent::Failed(_)
        ));
    }
}
