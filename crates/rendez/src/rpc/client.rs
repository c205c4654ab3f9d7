// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client.

use super::wire::{CallId, RpcFrame};
use super::{service_schema, ServiceState, ServiceStatus};
use crate::channel::descriptor::DEFAULT_QUEUE_SIZE;
use crate::channel::{ChannelDescriptor, NegotiatedChannel};
use crate::communication::Message;
use crate::master::client::{Role, WatchKey};
use crate::master::{MasterClient, MasterRequest, MasterResponse, Notification};
use crate::node::{NodeId, NodeIdentity};
use crate::status::Status;
use crate::transport::frame::{read_frame, write_frame};
use crate::transport::{spawn_named, Connection, LinkError};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CALL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

type CallCallback<Resp> = Box<dyn FnOnce(Result<Resp, Status>) + Send>;
type ConnectCallback = Arc<Mutex<Box<dyn FnMut(ServiceStatus) + Send>>>;

/// What the connection thread reports back to the loop.
enum LinkEvent {
    /// Carries the queue feeding the connection's writer thread.
    Connected(Sender<Vec<u8>>),
    Reply(CallId, Result<Vec<u8>, Status>),
    Lost(Status),
}

/// Connection to the server, owned jointly by the loop side and the
/// connection thread.
struct ClientLink {
    closed: AtomicBool,
    conn: Mutex<Option<Connection>>,
}

impl ClientLink {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = self.conn.lock().take() {
            conn.shutdown();
        }
    }
}

struct Registration {
    node_id: NodeId,
    service: String,
}

struct ClientState<Resp> {
    state: ServiceState,
    connection: ServiceStatus,
    registration: Option<Registration>,
    channel: Option<NegotiatedChannel>,
    epoch: u64,
    link_gen: u64,
    link: Option<Arc<ClientLink>>,
    /// Queue to the writer thread, present while connected.
    writer: Option<Sender<Vec<u8>>>,
    reconnects_left: u32,
    next_call: CallId,
    /// Calls allowed in flight before `call` fails with `Backpressure`.
    max_in_flight: usize,
    calls: HashMap<CallId, CallCallback<Resp>>,
    on_connect: Option<ConnectCallback>,
}

impl<Resp> ClientState<Resp> {
    /// Drop the connection. Returns the calls that can no longer complete
    /// and whether a `Disconnected` must be reported.
    fn drop_link(&mut self) -> (Vec<CallCallback<Resp>>, bool) {
        self.link_gen += 1;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.writer = None;
        let was_connected = self.connection == ServiceStatus::Connected;
        self.connection = ServiceStatus::Disconnected;
        (self.calls.drain().map(|(_, cb)| cb).collect(), was_connected)
    }
}

struct ClientInner<Req: Message, Resp: Message> {
    client: MasterClient,
    state: Mutex<ClientState<Resp>>,
    _marker: PhantomData<fn(Req)>,
}

impl<Req: Message, Resp: Message> ClientInner<Req, Resp> {
    fn forget(&self, reg: &Registration) {
        self.client.release(reg.node_id, &reg.service, Role::ServiceClient);
        self.client
            .unwatch(reg.node_id, &WatchKey::Service(reg.service.clone()));
    }

    fn notify_lost(&self, calls: Vec<CallCallback<Resp>>, disconnected: bool, status: &Status) {
        for call in calls {
            call(Err(status.clone()));
        }
        if disconnected {
            let on_connect = self.state.lock().on_connect.clone();
            if let Some(on_connect) = on_connect {
                (on_connect.lock())(ServiceStatus::Disconnected);
            }
        }
    }

    fn finish_register(self: &Arc<Self>, epoch: u64, result: Result<MasterResponse, Status>) -> Status {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return Status::unregistered("service client was unregistered before the Master replied");
        }
        let channel = match result {
            Ok(MasterResponse::ServiceClientRegistered { channel }) => channel,
            other => {
                let status = match other {
                    Err(status) => status,
                    Ok(response) => Status::internal(format!(
                        "unexpected reply to register_service_client: {:?}",
                        response
                    )),
                };
                state.epoch += 1;
                state.state = ServiceState::Unregistered;
                if let Some(reg) = state.registration.take() {
                    log::warn!("[service-client] registering '{}' failed: {}", reg.service, status);
                    self.forget(&reg);
                }
                return status;
            }
        };
        state.state = ServiceState::Registered;
        drop(state);
        if let Some(channel) = channel {
            self.attach(channel);
        }
        Status::ok_status()
    }

    fn on_notification(self: &Arc<Self>, notification: Notification) {
        match notification {
            Notification::ServiceAvailable { channel, .. } => {
                if self.state.lock().state.is_active() {
                    self.attach(channel);
                }
            }
            Notification::ServiceUnavailable { service, .. } => {
                let (calls, disconnected) = {
                    let mut state = self.state.lock();
                    if !state.state.is_active() {
                        return;
                    }
                    state.channel = None;
                    state.drop_link()
                };
                log::info!("[service-client] server of '{}' went away", service);
                self.notify_lost(calls, disconnected, &Status::unavailable("service server went away"));
            }
            _ => {}
        }
    }

    /// Connect to `channel` on a background thread.
    fn attach(self: &Arc<Self>, channel: NegotiatedChannel) {
        let (calls, disconnected) = {
            let mut state = self.state.lock();
            let lost = state.drop_link();
            let generation = state.link_gen;
            let link = Arc::new(ClientLink {
                closed: AtomicBool::new(false),
                conn: Mutex::new(None),
            });
            state.link = Some(link.clone());
            state.channel = Some(channel.clone());

            let weak = Arc::downgrade(self);
            let handle = self.client.handle().clone();
            let post = move |event: LinkEvent| {
                let weak = weak.clone();
                handle.post_task(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_link_event(generation, event);
                    }
                });
            };
            let timeout = self.client.config().connect_timeout();
            let max_frame = self.client.config().max_message_size;
            let spawned = spawn_named("rendez-rpc-cli", move || {
                run_connection(&channel, timeout, max_frame, &link, post);
            });
            if let Err(e) = spawned {
                log::warn!("[service-client] cannot start connection thread: {}", e);
            }
            lost
        };
        self.notify_lost(calls, disconnected, &Status::unavailable("service channel was replaced"));
    }

    fn on_link_event(self: &Arc<Self>, generation: u64, event: LinkEvent) {
        let mut state = self.state.lock();
        if state.link_gen != generation || !state.state.is_active() {
            return;
        }
        match event {
            LinkEvent::Connected(writer) => {
                state.writer = Some(writer);
                state.connection = ServiceStatus::Connected;
                state.reconnects_left = self.client.config().reconnect_attempts;
                let on_connect = state.on_connect.clone();
                drop(state);
                log::debug!("[service-client] connected");
                if let Some(on_connect) = on_connect {
                    (on_connect.lock())(ServiceStatus::Connected);
                }
            }
            LinkEvent::Reply(id, result) => {
                let Some(callback) = state.calls.remove(&id) else {
                    log::debug!("[service-client] reply for unknown or expired call {}", id);
                    return;
                };
                drop(state);
                callback(result.and_then(|bytes| Resp::decode(&bytes)));
            }
            LinkEvent::Lost(status) => {
                let (calls, disconnected) = state.drop_link();
                let retry = match state.channel.clone() {
                    Some(channel) if state.reconnects_left > 0 => {
                        state.reconnects_left -= 1;
                        Some((channel, state.link_gen))
                    }
                    _ => None,
                };
                drop(state);
                log::warn!("[service-client] connection lost: {}", status);
                if let Some((channel, generation)) = retry {
                    let weak = Arc::downgrade(self);
                    self.client.handle().post_delayed_task(
                        move || {
                            if let Some(inner) = weak.upgrade() {
                                let current = inner.state.lock().link_gen == generation;
                                if current {
                                    inner.attach(channel);
                                }
                            }
                        },
                        self.client.config().reconnect_delay(),
                    );
                }
                self.notify_lost(calls, disconnected, &Status::unavailable(status.error_message()));
            }
        }
    }

    fn expire(&self, id: CallId, timeout: Duration) {
        let callback = self.state.lock().calls.remove(&id);
        if let Some(callback) = callback {
            callback(Err(Status::timeout(format!(
                "call {} did not complete within {:?}",
                id, timeout
            ))));
        }
    }

    /// Queue one call for the writer thread. Returns the callback back on
    /// failure.
    fn send(
        self: &Arc<Self>,
        request: &Req,
        timeout: Duration,
        on_result: CallCallback<Resp>,
    ) -> Result<(), (CallCallback<Resp>, Status)> {
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(status) => return Err((on_result, status)),
        };
        let mut state = self.state.lock();
        if !state.state.is_active() {
            return Err((on_result, Status::unregistered("service client is not registered")));
        }
        if state.connection != ServiceStatus::Connected {
            return Err((on_result, Status::unavailable("service server is not connected")));
        }
        if state.calls.len() >= state.max_in_flight {
            let status = Status::backpressure(format!("{} calls already in flight", state.calls.len()));
            return Err((on_result, status));
        }
        let id = state.next_call;
        state.next_call += 1;
        let bytes = match (RpcFrame::Request { id, payload }).encode() {
            Ok(bytes) => bytes,
            Err(status) => return Err((on_result, status)),
        };
        let max_frame = self.client.config().max_message_size;
        if bytes.len() > max_frame {
            let status = Status::buffer_too_small(format!(
                "call of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                max_frame
            ));
            return Err((on_result, status));
        }
        let queued = match state.writer.as_ref() {
            Some(writer) => writer.send(bytes).is_ok(),
            None => false,
        };
        if !queued {
            return Err((on_result, Status::unavailable("service server is not connected")));
        }
        state.calls.insert(id, on_result);
        drop(state);

        let weak = Arc::downgrade(self);
        self.client.handle().post_delayed_task(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(id, timeout);
                }
            },
            timeout,
        );
        Ok(())
    }
}

impl<Req: Message, Resp: Message> Drop for ClientInner<Req, Resp> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.state.is_active() {
            return;
        }
        state.drop_link();
        state.state = ServiceState::Unregistered;
        if let Some(reg) = state.registration.take() {
            self.forget(&reg);
            self.client.call(
                MasterRequest::UnregisterServiceClient {
                    node_id: reg.node_id,
                    service: reg.service,
                },
                |_| {},
            );
        }
    }
}

fn run_connection<F>(
    channel: &NegotiatedChannel,
    timeout: Duration,
    max_frame: usize,
    link: &ClientLink,
    post: F,
) where
    F: Fn(LinkEvent),
{
    let conn = match Connection::connect(&channel.endpoint, timeout) {
        Ok(conn) => conn,
        Err(e) => {
            if !link.closed.load(Ordering::Acquire) {
                post(LinkEvent::Lost(e.into()));
            }
            return;
        }
    };
    let writer = match start_writer(&conn) {
        Ok(writer) => writer,
        Err(e) => {
            post(LinkEvent::Lost(e.into()));
            return;
        }
    };
    {
        let mut slot = link.conn.lock();
        if link.closed.load(Ordering::Acquire) {
            conn.shutdown();
            return;
        }
        match conn.try_clone() {
            Ok(closer) => *slot = Some(closer),
            Err(e) => {
                drop(slot);
                post(LinkEvent::Lost(e.into()));
                return;
            }
        }
    }
    post(LinkEvent::Connected(writer));

    let mut reader = conn;
    let outcome = loop {
        match read_frame(&mut reader, max_frame) {
            Ok(Some(bytes)) => match RpcFrame::decode(&bytes) {
                Ok(RpcFrame::Reply { id, result }) => post(LinkEvent::Reply(id, result)),
                Ok(RpcFrame::Request { id, .. }) => {
                    log::warn!("[service-client] server sent a request frame ({})", id);
                }
                Err(status) => break status,
            },
            Ok(None) => break Status::unavailable("service server closed the connection"),
            Err(e) => break Status::from(e),
        }
    };
    if !link.closed.load(Ordering::Acquire) {
        post(LinkEvent::Lost(outcome));
    }
}

/// Spawn the thread writing queued calls to `conn`. It stops once the
/// queue is dropped; a failed write shuts the connection down so the
/// reader reports the loss.
fn start_writer(conn: &Connection) -> Result<Sender<Vec<u8>>, LinkError> {
    let mut out = conn.try_clone()?;
    out.set_write_timeout(Some(CALL_WRITE_TIMEOUT))?;
    let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = channel::unbounded();
    spawn_named("rendez-rpc-cli-tx", move || {
        while let Ok(bytes) = rx.recv() {
            if let Err(e) = write_frame(&mut out, &bytes, usize::MAX) {
                log::warn!("[service-client] write failed: {}", e);
                out.shutdown();
                break;
            }
        }
    })?;
    Ok(tx)
}

/// Calling end of one service.
///
/// `call` may be issued only while connected; `on_connect` tells when that
/// is. Results always arrive on the event loop.
pub struct ServiceClient<Req: Message, Resp: Message> {
    inner: Arc<ClientInner<Req, Resp>>,
}

impl<Req: Message, Resp: Message> Clone for ServiceClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req: Message, Resp: Message> ServiceClient<Req, Resp> {
    pub fn new(client: &MasterClient) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                client: client.clone(),
                state: Mutex::new(ClientState {
                    state: ServiceState::NotRegistered,
                    connection: ServiceStatus::Disconnected,
                    registration: None,
                    channel: None,
                    epoch: 0,
                    link_gen: 0,
                    link: None,
                    writer: None,
                    reconnects_left: 0,
                    next_call: 1,
                    max_in_flight: DEFAULT_QUEUE_SIZE,
                    calls: HashMap::new(),
                    on_connect: None,
                }),
                _marker: PhantomData,
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.lock().state
    }

    pub fn connection(&self) -> ServiceStatus {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection() == ServiceStatus::Connected
    }

    /// Calls sent and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().calls.len()
    }

    /// Register as a client of `service`.
    ///
    /// `on_result` reports the registration. `on_connect` then fires on
    /// every connect and every disconnect; a client may stay registered
    /// without a server for any length of time.
    pub fn request_register<C, F>(
        &self,
        identity: &NodeIdentity,
        service: &str,
        descriptor: ChannelDescriptor,
        on_connect: C,
        on_result: F,
    ) where
        C: FnMut(ServiceStatus) + Send + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        let client = &self.inner.client;
        if self.state().is_active() {
            let status = Status::already_exists(format!("service client for '{}' is already registered", service));
            client.handle().post_task(move || on_result(status));
            return;
        }
        if let Err(status) = client.claim(identity.id, service, Role::ServiceClient) {
            client.handle().post_task(move || on_result(status));
            return;
        }

        let wire = descriptor.to_wire();
        let epoch = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.state = ServiceState::Registering;
            state.connection = ServiceStatus::Disconnected;
            state.registration = Some(Registration {
                node_id: identity.id,
                service: service.to_string(),
            });
            state.channel = None;
            state.reconnects_left = client.config().reconnect_attempts;
            state.max_in_flight = if descriptor.is_dynamic_buffer() {
                usize::MAX
            } else {
                descriptor.queue_size()
            };
            state.on_connect = Some(Arc::new(Mutex::new(Box::new(on_connect))));
            state.epoch
        };

        let weak = Arc::downgrade(&self.inner);
        client.watch(
            identity.id,
            WatchKey::Service(service.to_string()),
            Arc::new(move |notification| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_notification(notification);
                }
            }),
        );

        log::debug!("[service-client] registering '{}' for {}", service, identity);
        let request = MasterRequest::RegisterServiceClient {
            node_id: identity.id,
            service: service.to_string(),
            schema_id: service_schema::<Req, Resp>(),
            descriptor: wire,
        };
        let weak = Arc::downgrade(&self.inner);
        client.call(request, move |result| {
            let status = match weak.upgrade() {
                Some(inner) => inner.finish_register(epoch, result),
                None => Status::unregistered("service client was dropped"),
            };
            on_result(status);
        });
    }

    /// Call the service with the configured default timeout.
    pub fn call<F>(&self, request: &Req, on_result: F)
    where
        F: FnOnce(Result<Resp, Status>) + Send + 'static,
    {
        let timeout = self.inner.client.config().rpc_timeout();
        self.call_with_timeout(request, timeout, on_result);
    }

    /// Call the service. `on_result` runs exactly once: with the response,
    /// the server's error, `Timeout` after `timeout`, `Unavailable` when not
    /// connected or when the connection drops, or `Unregistered`.
    pub fn call_with_timeout<F>(&self, request: &Req, timeout: Duration, on_result: F)
    where
        F: FnOnce(Result<Resp, Status>) + Send + 'static,
    {
        if let Err((on_result, status)) = self.inner.send(request, timeout, Box::new(on_result)) {
            self.inner
                .client
                .handle()
                .post_task(move || on_result(Err(status)));
        }
    }

    /// Disconnect and unregister. Idempotent. In-flight calls fail with
    /// `Unregistered`.
    pub fn request_unregister<F>(&self, identity: &NodeIdentity, service: &str, on_result: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let torn_down = {
            let mut state = self.inner.state.lock();
            let matches = state
                .registration
                .as_ref()
                .is_some_and(|r| r.node_id == identity.id && r.service == service);
            if matches && state.state.is_active() {
                state.epoch += 1;
                state.state = ServiceState::Unregistered;
                state.channel = None;
                let (calls, _) = state.drop_link();
                state.registration.take().map(|reg| (reg, calls))
            } else {
                None
            }
        };
        let handle = self.inner.client.handle().clone();
        let Some((reg, calls)) = torn_down else {
            handle.post_task(move || on_result(Status::ok_status()));
            return;
        };
        handle.post_task(move || {
            for call in calls {
                call(Err(Status::unregistered("service client was unregistered")));
            }
        });
        self.inner.forget(&reg);
        self.inner.client.call(
            MasterRequest::UnregisterServiceClient {
                node_id: reg.node_id,
                service: reg.service,
            },
            move |result| on_result(result.err().unwrap_or_else(Status::ok_status)),
        );
    }
}
