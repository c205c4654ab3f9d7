// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connections from a node process to the Master.
//!
//! [`MasterTransport`] is the seam between [`MasterClient`](super::MasterClient)
//! and the Master. Two implementations ship:
//!
//! - [`TcpMasterTransport`]: length-prefixed JSON over TCP to a
//!   `rendez-master` server. A reader thread completes pending requests and
//!   forwards notifications.
//! - [`InProcessMaster`]: a registry living in the same process, used by
//!   tests and single-process deployments.
//!
//! Reply callbacks and notification sinks run on whatever thread the
//! transport uses; `MasterClient` marshals them onto the event loop.

use super::protocol::{
    read_frame, write_frame, ClientFrame, MasterRequest, MasterResponse, Notification,
    RequestId, ServerFrame,
};
use super::registry::MasterRegistry;
use crate::node::ClientId;
use crate::status::Status;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Completion of one Master request.
pub type ReplyCallback = Box<dyn FnOnce(Result<MasterResponse, Status>) + Send + 'static>;

/// Receiver of unsolicited notifications.
pub type NotificationSink = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// Connection to a Master.
pub trait MasterTransport: Send + Sync + 'static {
    /// Establish the connection and register this process as a client.
    ///
    /// This is the only blocking call of the protocol.
    fn connect(&self) -> Result<ClientId, Status>;

    /// Send `request`; `on_reply` is invoked exactly once.
    fn call(&self, request: MasterRequest, on_reply: ReplyCallback);

    /// Install the notification receiver. Must be called before `connect`.
    fn set_notification_sink(&self, sink: NotificationSink);

    /// Close the connection. Pending requests fail with `Unavailable`.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

struct TcpShared {
    pending: Mutex<HashMap<RequestId, ReplyCallback>>,
    sink: Mutex<Option<NotificationSink>>,
    closed: AtomicBool,
}

impl TcpShared {
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<ReplyCallback> = self.pending.lock().drain().map(|(_, cb)| cb).collect();
        for cb in drained {
            cb(Err(Status::unavailable(reason.to_string())));
        }
    }
}

/// Master connection over TCP.
pub struct TcpMasterTransport {
    address: SocketAddr,
    connect_timeout: Duration,
    max_message_size: usize,
    writer: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
    shared: Arc<TcpShared>,
}

impl TcpMasterTransport {
    pub fn new(address: SocketAddr, connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            address,
            connect_timeout,
            max_message_size,
            writer: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shared: Arc::new(TcpShared {
                pending: Mutex::new(HashMap::new()),
                sink: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn spawn_reader(&self, mut stream: TcpStream) -> Result<(), Status> {
        let shared = self.shared.clone();
        let max = self.max_message_size;
        let address = self.address;
        thread::Builder::new()
            .name("rendez-master-rx".into())
            .spawn(move || {
                loop {
                    match read_frame::<_, ServerFrame>(&mut stream, max) {
                        Ok(Some(ServerFrame::Response { id, response })) => {
                            let cb = shared.pending.lock().remove(&id);
                            match cb {
                                Some(cb) => cb(Ok(response)),
                                None => log::warn!("[master-client] reply for unknown request {}", id),
                            }
                        }
                        Ok(Some(ServerFrame::Notification { notification })) => {
                            let sink = shared.sink.lock().clone();
                            match sink {
                                Some(sink) => sink(notification),
                                None => log::debug!("[master-client] dropped notification, no sink"),
                            }
                        }
                        Ok(None) => {
                            log::warn!("[master-client] master {} closed the connection", address);
                            break;
                        }
                        Err(e) => {
                            if !shared.closed.load(Ordering::Acquire) {
                                log::warn!("[master-client] connection to {} failed: {}", address, e);
                            }
                            break;
                        }
                    }
                }
                shared.closed.store(true, Ordering::Release);
                shared.fail_pending("connection to master lost");
            })
            .map(|_| ())
            .map_err(|e| Status::internal(format!("failed to spawn reader: {}", e)))
    }
}

impl MasterTransport for TcpMasterTransport {
    fn connect(&self) -> Result<ClientId, Status> {
        let mut stream = TcpStream::connect_timeout(&self.address, self.connect_timeout)
            .map_err(|e| Status::unavailable(format!("cannot reach master {}: {}", self.address, e)))?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(self.connect_timeout))?;

        let frame = ClientFrame {
            id: 0,
            request: MasterRequest::RegisterClient,
        };
        write_frame(&mut stream, &frame, self.max_message_size)?;
        let client_id = match read_frame::<_, ServerFrame>(&mut stream, self.max_message_size)? {
            Some(ServerFrame::Response {
                response: MasterResponse::ClientRegistered { client_id },
                ..
            }) => client_id,
            Some(ServerFrame::Response {
                response: MasterResponse::Error { status },
                ..
            }) => return Err(status),
            Some(other) => {
                return Err(Status::registration_failed(format!(
                    "unexpected reply to register_client: {:?}",
                    other
                )))
            }
            None => return Err(Status::unavailable("master closed the connection")),
        };
        stream.set_read_timeout(None)?;

        let reader = stream.try_clone()?;
        *self.writer.lock() = Some(stream);
        self.shared.closed.store(false, Ordering::Release);
        self.spawn_reader(reader)?;
        log::info!("[master-client] connected to {} as {}", self.address, client_id);
        Ok(client_id)
    }

    fn call(&self, request: MasterRequest, on_reply: ReplyCallback) {
        if self.shared.closed.load(Ordering::Acquire) {
            on_reply(Err(Status::unavailable("not connected to master")));
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("[master-client] -> {} #{}", request.name(), id);
        self.shared.pending.lock().insert(id, on_reply);

        let frame = ClientFrame { id, request };
        let result = {
            let mut writer = self.writer.lock();
            match writer.as_mut() {
                Some(stream) => write_frame(stream, &frame, self.max_message_size).map_err(Status::from),
                None => Err(Status::unavailable("not connected to master")),
            }
        };
        if let Err(status) = result {
            let cb = self.shared.pending.lock().remove(&id);
            if let Some(cb) = cb {
                cb(Err(status));
            }
        }
    }

    fn set_notification_sink(&self, sink: NotificationSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.fail_pending("connection closed");
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

struct InProcessState {
    registry: MasterRegistry,
    sinks: HashMap<ClientId, NotificationSink>,
}

/// A Master living inside the current process.
///
/// Cloning shares the same registry. Every [`InProcessMaster::transport`]
/// acts as a separate client, so several contexts in one test can talk to
/// each other through it.
#[derive(Clone)]
pub struct InProcessMaster {
    state: Arc<Mutex<InProcessState>>,
}

impl InProcessMaster {
    pub fn new() -> Self {
        Self::with_registry(MasterRegistry::new())
    }

    pub fn with_registry(registry: MasterRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(InProcessState {
                registry,
                sinks: HashMap::new(),
            })),
        }
    }

    /// New client connection to this Master.
    pub fn transport(&self) -> InProcessTransport {
        InProcessTransport {
            master: self.clone(),
            client_id: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    /// Drop a client as if its connection was lost.
    pub fn disconnect_client(&self, client_id: ClientId) {
        let notifications = {
            let mut state = self.state.lock();
            state.sinks.remove(&client_id);
            state.registry.remove_client(client_id)
        };
        self.deliver(notifications);
    }

    /// Expire clients whose lease is older than `lease`.
    pub fn expire_clients(&self, lease: Duration) -> Vec<ClientId> {
        let (expired, notifications) = {
            let mut state = self.state.lock();
            let (expired, notifications) = state.registry.expire_clients(lease);
            for id in &expired {
                state.sinks.remove(id);
            }
            (expired, notifications)
        };
        self.deliver(notifications);
        expired
    }

    /// Run `f` against the registry.
    pub fn with_registry_ref<R>(&self, f: impl FnOnce(&MasterRegistry) -> R) -> R {
        f(&self.state.lock().registry)
    }

    fn deliver(&self, notifications: Vec<(ClientId, Notification)>) {
        for (client_id, notification) in notifications {
            let sink = self.state.lock().sinks.get(&client_id).cloned();
            match sink {
                Some(sink) => sink(notification),
                None => log::debug!("[master] no sink for {}", client_id),
            }
        }
    }
}

impl Default for InProcessMaster {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection to an [`InProcessMaster`].
pub struct InProcessTransport {
    master: InProcessMaster,
    client_id: Mutex<Option<ClientId>>,
    sink: Mutex<Option<NotificationSink>>,
}

impl InProcessTransport {
    pub fn client_id(&self) -> Option<ClientId> {
        *self.client_id.lock()
    }
}

impl MasterTransport for InProcessTransport {
    fn connect(&self) -> Result<ClientId, Status> {
        let mut state = self.master.state.lock();
        let client_id = state.registry.register_client();
        if let Some(sink) = self.sink.lock().clone() {
            state.sinks.insert(client_id, sink);
        }
        *self.client_id.lock() = Some(client_id);
        Ok(client_id)
    }

    fn call(&self, request: MasterRequest, on_reply: ReplyCallback) {
        if self.client_id.lock().is_none() {
            on_reply(Err(Status::unavailable("not connected to master")));
            return;
        }
        let outcome = self.master.state.lock().registry.handle(request);
        on_reply(Ok(outcome.response));
        self.master.deliver(outcome.notifications);
    }

    fn set_notification_sink(&self, sink: NotificationSink) {
        *self.sink.lock() = Some(sink);
    }

    fn close(&self) {
        if let Some(client_id) = self.client_id.lock().take() {
            self.master.disconnect_client(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_in_process_register_node() {
        let master = InProcessMaster::new();
        let transport = master.transport();
        let client_id = transport.connect().unwrap();

        let (tx, rx) = mpsc::channel();
        transport.call(
            MasterRequest::RegisterNode {
                client_id,
                name: "n".into(),
            },
            Box::new(move |r| tx.send(r).unwrap()),
        );
        match rx.recv().unwrap().unwrap() {
            MasterResponse::NodeRegistered { identity } => assert_eq!(identity.name, "n"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(master.with_registry_ref(|r| r.node_count()), 1);

        transport.close();
        assert_eq!(master.with_registry_ref(|r| r.node_count()), 0);
    }

    #[test]
    fn test_in_process_call_before_connect() {
        let master = InProcessMaster::new();
        let transport = master.transport();
        let (tx, rx) = mpsc::channel();
        transport.call(MasterRequest::ListNodes, Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.recv().unwrap().is_err());
    }

    #[test]
    fn test_tcp_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = TcpMasterTransport::new(addr, Duration::from_millis(200), 1 << 20);
        let err = transport.connect().unwrap_err();
        assert_eq!(err.code(), crate::status::StatusCode::Unavailable);
    }

    #[test]
    fn test_tcp_round_trip_against_stub_master() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut registry = MasterRegistry::new();
            while let Ok(Some(frame)) = read_frame::<_, ClientFrame>(&mut stream, 1 << 20) {
                let outcome = registry.handle(frame.request);
                let reply = ServerFrame::Response {
                    id: frame.id,
                    response: outcome.response,
                };
                if write_frame(&mut stream, &reply, 1 << 20).is_err() {
                    break;
                }
            }
        });

        let transport = TcpMasterTransport::new(addr, Duration::from_secs(2), 1 << 20);
        let client_id = transport.connect().unwrap();
        let (tx, rx) = mpsc::channel();
        transport.call(
            MasterRequest::RegisterNode {
                client_id,
                name: "tcp-node".into(),
            },
            Box::new(move |r| tx.send(r).unwrap()),
        );
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert!(matches!(reply, MasterResponse::NodeRegistered { .. }));

        transport.close();
        server.join().unwrap();
    }
}
