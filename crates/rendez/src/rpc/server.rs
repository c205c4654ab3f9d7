// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server.

use super::wire::{CallId, RpcFrame};
use super::{service_schema, ServiceState};
use crate::channel::{ChannelDescriptor, ChannelEndpoint, ChannelKind, ChannelKinds};
use crate::communication::Message;
use crate::master::client::Role;
use crate::master::{MasterClient, MasterRequest, MasterResponse};
use crate::node::{NodeId, NodeIdentity};
use crate::status::{Status, StatusCode};
use crate::transport::frame::{read_frame, write_frame};
use crate::transport::{spawn_acceptor, spawn_named, Connection, LinkError, StreamListener};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const REPLY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

type Handler<Req, Resp> = Box<dyn FnMut(Req, Responder<Resp>) + Send>;

/// Accepted caller connections, keyed by a per-server connection id.
///
/// Replies are queued to a writer thread per connection so a slow caller
/// never stalls the event loop; each read half lives on its own thread.
struct Peers {
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    max_frame: usize,
    writers: Mutex<HashMap<u64, PeerWriter>>,
}

struct PeerWriter {
    conn: Connection,
    tx: Sender<Vec<u8>>,
}

impl Peers {
    fn send(&self, conn_id: u64, frame: &RpcFrame) -> Result<(), Status> {
        let bytes = frame.encode()?;
        if bytes.len() > self.max_frame {
            return Err(Status::buffer_too_small(format!(
                "reply of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                self.max_frame
            )));
        }
        let writers = self.writers.lock();
        let writer = writers
            .get(&conn_id)
            .ok_or_else(|| Status::unavailable("caller disconnected"))?;
        writer
            .tx
            .send(bytes)
            .map_err(|_| Status::unavailable("caller disconnected"))
    }

    /// Register `conn` and start its writer thread.
    fn attach(self: &Arc<Self>, conn: Connection) -> Result<u64, LinkError> {
        let mut out = conn.try_clone()?;
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = channel::unbounded();
        let peers = Arc::downgrade(self);
        spawn_named("rendez-rpc-tx", move || {
            while let Ok(bytes) = rx.recv() {
                if let Err(e) = write_frame(&mut out, &bytes, usize::MAX) {
                    log::debug!("[service] connection {} write failed: {}", conn_id, e);
                    if let Some(peers) = peers.upgrade() {
                        peers.detach(conn_id);
                    }
                    break;
                }
            }
        })?;
        self.writers.lock().insert(conn_id, PeerWriter { conn, tx });
        Ok(conn_id)
    }

    fn detach(&self, conn_id: u64) {
        if let Some(writer) = self.writers.lock().remove(&conn_id) {
            writer.conn.shutdown();
        }
    }

    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        for (_, writer) in self.writers.lock().drain() {
            writer.conn.shutdown();
        }
    }
}

struct ReplyTo {
    peers: Weak<Peers>,
    conn_id: u64,
    call_id: CallId,
}

impl ReplyTo {
    fn send(self, result: Result<Vec<u8>, Status>) {
        let Some(peers) = self.peers.upgrade() else {
            log::debug!("[service] reply to call {} after the server closed", self.call_id);
            return;
        };
        let frame = RpcFrame::Reply {
            id: self.call_id,
            result,
        };
        match peers.send(self.conn_id, &frame) {
            Ok(()) => {}
            Err(status) if status.code() == StatusCode::BufferTooSmall => {
                log::warn!("[service] reply to call {} is too large: {}", self.call_id, status);
                let frame = RpcFrame::Reply {
                    id: self.call_id,
                    result: Err(status),
                };
                if let Err(status) = peers.send(self.conn_id, &frame) {
                    log::warn!("[service] cannot reply to call {}: {}", self.call_id, status);
                }
            }
            Err(status) => log::warn!("[service] cannot reply to call {}: {}", self.call_id, status),
        }
    }
}

/// One pending reply. Consumed by [`done`](Self::done), so a call is
/// answered at most once.
///
/// Dropping a responder without answering fails the call with `Internal`.
pub struct Responder<Resp: Message> {
    reply: Option<ReplyTo>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp: Message> Responder<Resp> {
    pub fn call_id(&self) -> CallId {
        self.reply.as_ref().map_or(0, |r| r.call_id)
    }

    /// Send the response, or the failure, back to the caller.
    pub fn done(mut self, result: Result<Resp, Status>) {
        if let Some(reply) = self.reply.take() {
            reply.send(result.and_then(|response| response.encode()));
        }
    }
}

impl<Resp: Message> Drop for Responder<Resp> {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            log::error!("[service] handler dropped call {} without responding", reply.call_id);
            reply.send(Err(Status::internal("service handler did not respond")));
        }
    }
}

struct Registration {
    node_id: NodeId,
    service: String,
}

struct ServerState<Req, Resp: Message> {
    state: ServiceState,
    registration: Option<Registration>,
    epoch: u64,
    peers: Option<Arc<Peers>>,
    handler: Option<Arc<Mutex<Handler<Req, Resp>>>>,
    endpoints: Vec<ChannelEndpoint>,
    /// Calls that arrived before the Master confirmed the registration.
    deferred: Vec<(u64, CallId, Vec<u8>)>,
}

impl<Req, Resp: Message> ServerState<Req, Resp> {
    fn teardown(&mut self, next: ServiceState) -> Option<Registration> {
        self.epoch += 1;
        self.state = next;
        self.deferred.clear();
        self.endpoints.clear();
        // Acceptor threads notice the closed flag and exit on their own.
        if let Some(peers) = self.peers.take() {
            peers.close_all();
        }
        self.registration.take()
    }
}

struct ServerInner<Req: Message, Resp: Message> {
    client: MasterClient,
    state: Mutex<ServerState<Req, Resp>>,
}

impl<Req: Message, Resp: Message> ServerInner<Req, Resp> {
    fn unregister_at_master<F>(&self, reg: Registration, on_reply: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        self.client.release(reg.node_id, &reg.service, Role::ServiceServer);
        self.client.call(
            MasterRequest::UnregisterServiceServer {
                node_id: reg.node_id,
                service: reg.service,
            },
            move |result| on_reply(result.err().unwrap_or_else(Status::ok_status)),
        );
    }

    fn finish_register(&self, epoch: u64, result: Result<MasterResponse, Status>) -> Status {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return Status::unregistered("service was unregistered before the Master replied");
        }
        let status = match result {
            Ok(MasterResponse::Ack) => Status::ok_status(),
            Ok(other) => Status::internal(format!(
                "unexpected reply to register_service_server: {:?}",
                other
            )),
            Err(status) => status,
        };
        if !status.ok() {
            if let Some(reg) = state.teardown(ServiceState::Unregistered) {
                log::warn!("[service] registering '{}' failed: {}", reg.service, status);
                self.client.release(reg.node_id, &reg.service, Role::ServiceServer);
            }
            return status;
        }
        state.state = ServiceState::Registered;
        if let Some(reg) = &state.registration {
            log::info!("[service] '{}' registered", reg.service);
        }
        status
    }

    /// Run calls that were held back until the registration result was out.
    fn flush_deferred(&self) {
        let deferred = std::mem::take(&mut self.state.lock().deferred);
        for (conn_id, call_id, payload) in deferred {
            self.on_request(conn_id, call_id, payload);
        }
    }

    fn on_request(&self, conn_id: u64, call_id: CallId, payload: Vec<u8>) {
        let (handler, peers) = {
            let mut state = self.state.lock();
            match state.state {
                ServiceState::Registered => {}
                ServiceState::Registering => {
                    state.deferred.push((conn_id, call_id, payload));
                    return;
                }
                ServiceState::NotRegistered | ServiceState::Unregistered => return,
            }
            match (state.handler.clone(), state.peers.clone()) {
                (Some(handler), Some(peers)) => (handler, peers),
                _ => return,
            }
        };
        let reply = ReplyTo {
            peers: Arc::downgrade(&peers),
            conn_id,
            call_id,
        };
        match Req::decode(&payload) {
            Ok(request) => {
                let responder = Responder {
                    reply: Some(reply),
                    _marker: PhantomData,
                };
                (handler.lock())(request, responder);
            }
            Err(status) => {
                log::warn!("[service] call {} carries a malformed request: {}", call_id, status);
                reply.send(Err(status));
            }
        }
    }
}

impl<Req: Message, Resp: Message> Drop for ServerInner<Req, Resp> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.state.is_active() {
            if let Some(reg) = state.teardown(ServiceState::Unregistered) {
                self.unregister_at_master(reg, |_| {});
            }
        }
    }
}

/// Serving end of one service.
pub struct ServiceServer<Req: Message, Resp: Message> {
    inner: Arc<ServerInner<Req, Resp>>,
}

impl<Req: Message, Resp: Message> Clone for ServiceServer<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req: Message, Resp: Message> ServiceServer<Req, Resp> {
    pub fn new(client: &MasterClient) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                client: client.clone(),
                state: Mutex::new(ServerState {
                    state: ServiceState::NotRegistered,
                    registration: None,
                    epoch: 0,
                    peers: None,
                    handler: None,
                    endpoints: Vec::new(),
                    deferred: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ServiceState::Registered
    }

    /// Endpoints advertised to the Master while registered.
    pub fn endpoints(&self) -> Vec<ChannelEndpoint> {
        self.inner.state.lock().endpoints.clone()
    }

    /// Number of callers currently connected.
    pub fn connection_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .peers
            .as_ref()
            .map_or(0, |p| p.writers.lock().len())
    }

    /// Serve `service` with `handler`.
    ///
    /// Listeners are opened on every stream kind of `descriptor` and
    /// advertised to the Master. `handler` runs on the event loop once per
    /// call and answers through the [`Responder`], possibly later.
    pub fn request_register<H, F>(
        &self,
        identity: &NodeIdentity,
        service: &str,
        descriptor: ChannelDescriptor,
        handler: H,
        on_result: F,
    ) where
        H: FnMut(Req, Responder<Resp>) + Send + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        let client = &self.inner.client;
        if self.state().is_active() {
            let status = Status::already_exists(format!("service server for '{}' is already registered", service));
            client.handle().post_task(move || on_result(status));
            return;
        }
        if let Err(status) = client.claim(identity.id, service, Role::ServiceServer) {
            client.handle().post_task(move || on_result(status));
            return;
        }
        let (listeners, endpoints) = match open_listeners(&descriptor, client, service) {
            Ok(opened) => opened,
            Err(status) => {
                client.release(identity.id, service, Role::ServiceServer);
                client.handle().post_task(move || on_result(status));
                return;
            }
        };
        let mut wire = descriptor.to_wire();
        wire.kinds = listeners.iter().map(|(kind, _)| *kind).collect::<ChannelKinds>();

        let peers = Arc::new(Peers {
            closed: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            max_frame: client.config().max_message_size,
            writers: Mutex::new(HashMap::new()),
        });
        for (kind, listener) in listeners {
            let on_connection = accept_handler(
                Arc::downgrade(&self.inner),
                peers.clone(),
                descriptor.clone(),
                kind,
                service.to_string(),
            );
            if let Err(e) = spawn_acceptor("rendez-rpc-accept", listener, peers.closed.clone(), on_connection) {
                log::warn!("[service] cannot serve '{}' over {}: {}", service, kind, e);
            }
        }

        let epoch = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.state = ServiceState::Registering;
            state.registration = Some(Registration {
                node_id: identity.id,
                service: service.to_string(),
            });
            state.peers = Some(peers);
            state.handler = Some(Arc::new(Mutex::new(Box::new(handler))));
            state.endpoints = endpoints.clone();
            state.epoch
        };

        log::debug!("[service] registering server '{}' for {}", service, identity);
        let request = MasterRequest::RegisterServiceServer {
            node_id: identity.id,
            service: service.to_string(),
            schema_id: service_schema::<Req, Resp>(),
            descriptor: wire,
            endpoints: endpoints.clone(),
        };
        let weak = Arc::downgrade(&self.inner);
        client.call(request, move |result| {
            let Some(inner) = weak.upgrade() else {
                on_result(Status::unregistered("service server was dropped"));
                return;
            };
            let status = inner.finish_register(epoch, result);
            on_result(status);
            inner.flush_deferred();
        });
    }

    /// Stop serving and unregister. Idempotent.
    pub fn request_unregister<F>(&self, identity: &NodeIdentity, service: &str, on_result: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let reg = {
            let mut state = self.inner.state.lock();
            let matches = state
                .registration
                .as_ref()
                .is_some_and(|r| r.node_id == identity.id && r.service == service);
            if matches && state.state.is_active() {
                state.teardown(ServiceState::Unregistered)
            } else {
                None
            }
        };
        match reg {
            Some(reg) => self.inner.unregister_at_master(reg, on_result),
            None => self
                .inner
                .client
                .handle()
                .post_task(move || on_result(Status::ok_status())),
        }
    }
}

type Opened = (Vec<(ChannelKind, StreamListener)>, Vec<ChannelEndpoint>);

fn open_listeners(descriptor: &ChannelDescriptor, client: &MasterClient, service: &str) -> Result<Opened, Status> {
    let streams = descriptor.kinds().streams();
    if streams.is_empty() {
        return Err(Status::invalid_argument(format!(
            "service '{}' needs a stream kind (tcp or uds), got {}",
            service,
            descriptor.kinds()
        )));
    }
    let mut listeners = Vec::new();
    let mut endpoints = Vec::new();
    for kind in streams.iter() {
        match StreamListener::bind(kind, client.config(), service) {
            Ok(listener) => {
                endpoints.push(listener.endpoint(kind).map_err(Status::from)?);
                listeners.push((kind, listener));
            }
            Err(LinkError::Unsupported(kind)) => {
                log::debug!("[service] {} is not available here, skipping", kind);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if listeners.is_empty() {
        return Err(Status::invalid_argument(format!(
            "none of {} can be served here",
            streams
        )));
    }
    Ok((listeners, endpoints))
}

fn accept_handler<Req: Message, Resp: Message>(
    weak: Weak<ServerInner<Req, Resp>>,
    peers: Arc<Peers>,
    descriptor: ChannelDescriptor,
    kind: ChannelKind,
    service: String,
) -> impl FnMut(Connection) + Send + 'static {
    let handle = weak.upgrade().map(|inner| inner.client.handle().clone());
    move |conn: Connection| {
        let Some(handle) = handle.clone() else {
            return;
        };
        if let (ChannelKind::Uds, Some(hook)) = (kind, descriptor.uds_auth_hook()) {
            match conn.peer_credentials() {
                Some(creds) if hook(&creds) => {}
                Some(creds) => {
                    log::warn!("[service] '{}' refused UDS peer pid {}", service, creds.pid);
                    conn.shutdown();
                    return;
                }
                None => {
                    log::warn!("[service] '{}' refused UDS peer without credentials", service);
                    conn.shutdown();
                    return;
                }
            }
        }
        let reader = match conn.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("[service] '{}' cannot split connection: {}", service, e);
                return;
            }
        };
        if let Err(e) = conn.set_write_timeout(Some(REPLY_WRITE_TIMEOUT)) {
            log::debug!("[service] cannot set write timeout: {}", e);
        }
        log::debug!("[service] '{}' accepted {}", service, conn.describe());
        let conn_id = match peers.attach(conn) {
            Ok(conn_id) => conn_id,
            Err(e) => {
                log::warn!("[service] '{}' cannot start a writer: {}", service, e);
                return;
            }
        };

        let peers = peers.clone();
        let weak = weak.clone();
        let spawned = spawn_named("rendez-rpc-srv", move || {
            serve_connection(reader, conn_id, &peers, |call_id, payload| {
                let weak = weak.clone();
                handle.post_task(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_request(conn_id, call_id, payload);
                    }
                });
            });
        });
        if let Err(e) = spawned {
            log::warn!("[service] '{}' cannot start a reader: {}", service, e);
        }
    }
}

fn serve_connection<F>(mut reader: Connection, conn_id: u64, peers: &Peers, mut on_call: F)
where
    F: FnMut(CallId, Vec<u8>),
{
    loop {
        match read_frame(&mut reader, peers.max_frame) {
            Ok(Some(bytes)) => match RpcFrame::decode(&bytes) {
                Ok(RpcFrame::Request { id, payload }) => on_call(id, payload),
                Ok(RpcFrame::Reply { id, .. }) => {
                    log::warn!("[service] caller sent a reply frame for call {}", id);
                }
                Err(status) => {
                    log::warn!("[service] dropping connection: {}", status);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                if !peers.closed.load(Ordering::Acquire) {
                    log::debug!("[service] connection {} ended: {}", conn_id, e);
                }
                break;
            }
        }
    }
    peers.detach(conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::event_loop::EventLoop;
    use crate::master::InProcessMaster;
    use crate::node::NodeLifecycle;
    use crate::channel::ChannelEndpoint;
    use crate::status::StatusCode;
    use std::net::TcpStream;

    struct Capture(Arc<Mutex<Option<NodeIdentity>>>);

    impl NodeLifecycle for Capture {
        fn on_did_create(&mut self, identity: NodeIdentity) {
            *self.0.lock() = Some(identity);
        }
    }

    fn setup() -> (EventLoop, MasterClient, NodeIdentity) {
        setup_with(NodeConfig::default())
    }

    fn setup_with(config: NodeConfig) -> (EventLoop, MasterClient, NodeIdentity) {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = MasterClient::new(
            config.with_heartbeat_interval(Duration::from_millis(10)),
            Arc::new(master.transport()),
            event_loop.handle(),
        );
        client.start().unwrap();
        let slot = Arc::new(Mutex::new(None));
        client.request_register_node("server", Capture(slot.clone()));
        event_loop.run_until_idle();
        let identity = slot.lock().clone().unwrap();
        (event_loop, client, identity)
    }

    fn register(
        server: &ServiceServer<String, String>,
        event_loop: &mut EventLoop,
        identity: &NodeIdentity,
        descriptor: ChannelDescriptor,
    ) -> Status {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        server.request_register(
            identity,
            "echo",
            descriptor,
            |request: String, responder: Responder<String>| {
                if request == "ignore" {
                    return;
                }
                responder.done(Ok(request.to_uppercase()));
            },
            move |status| *slot.lock() = Some(status),
        );
        event_loop.run_until_idle();
        let status = result.lock().take();
        status.unwrap()
    }

    fn raw_call(stream: &mut TcpStream, id: CallId, body: &str) -> RpcFrame {
        let frame = RpcFrame::Request {
            id,
            payload: body.as_bytes().to_vec(),
        };
        write_frame(stream, &frame.encode().unwrap(), 1024).unwrap();
        let bytes = read_frame(stream, 1024).unwrap().unwrap();
        RpcFrame::decode(&bytes).unwrap()
    }

    #[test]
    fn test_rejects_datagram_only_descriptor() {
        let (mut event_loop, client, identity) = setup();
        let server = ServiceServer::<String, String>::new(&client);
        let status = register(
            &server,
            &mut event_loop,
            &identity,
            ChannelDescriptor::with_kinds(ChannelKinds::UDP),
        );
        assert_eq!(status.code(), StatusCode::InvalidArgument);
        assert_eq!(server.state(), ServiceState::NotRegistered);
    }

    #[test]
    fn test_serves_raw_calls_and_guards_dropped_responder() {
        let (mut event_loop, client, identity) = setup();
        let server = ServiceServer::<String, String>::new(&client);
        let status = register(&server, &mut event_loop, &identity, ChannelDescriptor::default());
        assert!(status.ok());
        assert!(server.is_registered());

        let addr = match server.endpoints().first() {
            Some(ChannelEndpoint::Tcp { addr }) => *addr,
            other => panic!("unexpected endpoint {:?}", other),
        };
        let caller = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let upper = raw_call(&mut stream, 1, "hello");
            let ignored = raw_call(&mut stream, 2, "ignore");
            (upper, ignored)
        });
        assert!(event_loop.run_until(Duration::from_secs(5), || caller.is_finished()));
        let (upper, ignored) = caller.join().unwrap();

        assert_eq!(
            upper,
            RpcFrame::Reply {
                id: 1,
                result: Ok(b"HELLO".to_vec()),
            }
        );
        match ignored {
            RpcFrame::Reply { id: 2, result: Err(status) } => {
                assert_eq!(status.code(), StatusCode::Internal)
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (mut event_loop, client, identity) = setup();
        let server = ServiceServer::<String, String>::new(&client);
        assert!(register(&server, &mut event_loop, &identity, ChannelDescriptor::default()).ok());

        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let results = results.clone();
            server.request_unregister(&identity, "echo", move |s| results.lock().push(s.code()));
        }
        event_loop.run_until_idle();
        assert_eq!(*results.lock(), vec![StatusCode::Ok, StatusCode::Ok]);
        assert_eq!(server.state(), ServiceState::Unregistered);
        assert_eq!(server.connection_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_uds_auth_hook_refuses_caller() {
        use std::os::unix::net::UnixStream;

        let dir = tempfile::tempdir().unwrap();
        let (mut event_loop, client, identity) =
            setup_with(NodeConfig::default().with_uds_dir(dir.path()));
        let server = ServiceServer::<String, String>::new(&client);
        let descriptor = ChannelDescriptor::builder()
            .kinds(ChannelKinds::TCP | ChannelKinds::UDS)
            .uds_auth_hook(|_| false)
            .build()
            .unwrap();
        assert!(register(&server, &mut event_loop, &identity, descriptor).ok());

        let endpoints = server.endpoints();
        let path = endpoints
            .iter()
            .find_map(|e| match e {
                ChannelEndpoint::Uds { path } => Some(path.clone()),
                _ => None,
            })
            .unwrap();
        let addr = endpoints
            .iter()
            .find_map(|e| match e {
                ChannelEndpoint::Tcp { addr } => Some(*addr),
                _ => None,
            })
            .unwrap();

        let caller = std::thread::spawn(move || {
            let mut refused = UnixStream::connect(&path).unwrap();
            refused.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let frame = RpcFrame::Request {
                id: 1,
                payload: b"hello".to_vec(),
            };
            let _ = write_frame(&mut refused, &frame.encode().unwrap(), 1024);
            let refused_closed = read_frame(&mut refused, 1024).map_or(true, |f| f.is_none());

            // The hook only guards the UDS listener.
            let mut stream = TcpStream::connect(addr).unwrap();
            (refused_closed, raw_call(&mut stream, 2, "hello"))
        });
        assert!(event_loop.run_until(Duration::from_secs(5), || caller.is_finished()));
        let (refused_closed, reply) = caller.join().unwrap();

        assert!(refused_closed);
        assert_eq!(
            reply,
            RpcFrame::Reply {
                id: 2,
                result: Ok(b"HELLO".to_vec()),
            }
        );
    }

    #[test]
    fn test_reply_after_caller_left_is_dropped() {
        let (mut event_loop, client, identity) = setup();
        let server = ServiceServer::<String, String>::new(&client);
        let held = Arc::new(Mutex::new(None));
        let slot = held.clone();
        server.request_register(
            &identity,
            "hold",
            ChannelDescriptor::default(),
            move |_: String, responder: Responder<String>| *slot.lock() = Some(responder),
            |_| {},
        );
        event_loop.run_until_idle();

        let addr = match server.endpoints().first() {
            Some(ChannelEndpoint::Tcp { addr }) => *addr,
            other => panic!("unexpected endpoint {:?}", other),
        };
        let mut stream = TcpStream::connect(addr).unwrap();
        let frame = RpcFrame::Request {
            id: 7,
            payload: b"wait".to_vec(),
        };
        write_frame(&mut stream, &frame.encode().unwrap(), 1024).unwrap();
        assert!(event_loop.run_until(Duration::from_secs(5), || held.lock().is_some()));

        drop(stream);
        assert!(event_loop.run_until(Duration::from_secs(5), || server.connection_count() == 0));
        let responder = held.lock().take().unwrap();
        responder.done(Ok("late".to_string()));
        assert!(server.is_registered());
    }
}
