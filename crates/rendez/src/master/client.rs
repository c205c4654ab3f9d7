// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-side Master client.
//!
//! [`MasterClient`] owns the process connection to the Master. Every reply
//! and notification coming back from the transport is re-posted onto the
//! event loop before any user callback runs, so node code only ever sees a
//! single thread.

use super::protocol::{MasterRequest, MasterResponse, Notification, ServiceSummary, TopicSummary};
use super::transport::MasterTransport;
use crate::config::NodeConfig;
use crate::event_loop::LoopHandle;
use crate::node::{ClientId, NodeId, NodeIdentity, NodeInfo, NodeLifecycle, NodeStatus};
use crate::status::Status;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Handler for notifications addressed to one endpoint.
pub(crate) type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// What an endpoint watches at the Master.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WatchKey {
    Topic(String),
    Service(String),
}

impl WatchKey {
    fn of(notification: &Notification) -> Self {
        match notification {
            Notification::TopicNegotiated { topic, .. }
            | Notification::TopicFailed { topic, .. }
            | Notification::TopicClosed { topic, .. } => WatchKey::Topic(topic.clone()),
            Notification::ServiceAvailable { service, .. }
            | Notification::ServiceUnavailable { service, .. } => {
                WatchKey::Service(service.clone())
            }
        }
    }
}

/// Endpoint role, used to refuse a second live registration for the same
/// (node, name, role) before anything reaches the Master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Role {
    Publisher,
    Subscriber,
    ServiceServer,
    ServiceClient,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::ServiceServer => "service server",
            Role::ServiceClient => "service client",
        }
    }
}

#[derive(Default)]
struct Bootstrap {
    any_node_created: bool,
    failure: Option<Status>,
}

struct Inner {
    transport: Arc<dyn MasterTransport>,
    handle: LoopHandle,
    config: NodeConfig,
    client_id: Mutex<Option<ClientId>>,
    watchers: Mutex<HashMap<(NodeId, WatchKey), NotificationHandler>>,
    claims: Mutex<HashSet<(NodeId, String, Role)>>,
    lifecycles: Mutex<HashMap<NodeId, Box<dyn NodeLifecycle>>>,
    bootstrap: Mutex<Bootstrap>,
    closed: AtomicBool,
}

impl Inner {
    fn dispatch(&self, notification: Notification) {
        let key = (notification.node_id(), WatchKey::of(&notification));
        let watcher = self.watchers.lock().get(&key).cloned();
        match watcher {
            Some(watcher) => watcher(notification),
            None => log::debug!(
                "[master-client] no watcher for {:?} on {}",
                key.1,
                key.0
            ),
        }
    }
}

/// Process-wide connection to the Master.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct MasterClient {
    inner: Arc<Inner>,
}

impl MasterClient {
    /// Create a client over `transport`. Nothing is sent until [`start`](Self::start).
    pub fn new(config: NodeConfig, transport: Arc<dyn MasterTransport>, handle: LoopHandle) -> Self {
        let inner = Arc::new(Inner {
            transport,
            handle,
            config,
            client_id: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
            lifecycles: Mutex::new(HashMap::new()),
            bootstrap: Mutex::new(Bootstrap::default()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let handle = inner.handle.clone();
        inner.transport.set_notification_sink(Arc::new(move |notification| {
            let weak = weak.clone();
            handle.post_task(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(notification);
                }
            });
        }));

        Self { inner }
    }

    /// Connect to the Master and start the heartbeat.
    ///
    /// This is the only blocking call; it returns once the Master handed out
    /// a client id or the connection failed.
    pub fn start(&self) -> Result<ClientId, Status> {
        if let Some(id) = *self.inner.client_id.lock() {
            return Ok(id);
        }
        let client_id = self.inner.transport.connect()?;
        *self.inner.client_id.lock() = Some(client_id);
        self.inner.closed.store(false, Ordering::Release);
        schedule_heartbeat(Arc::downgrade(&self.inner));
        Ok(client_id)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        *self.inner.client_id.lock()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.inner.handle
    }

    /// Register a node named `name` (empty lets the Master pick one).
    ///
    /// On the loop: `lifecycle.on_init()` runs, the request is sent, and the
    /// reply ends in either `on_did_create` or `on_error`. A rejected name is
    /// never retried.
    ///
    /// If this is the first node of the process and it fails, the event loop
    /// is stopped and [`Context::run`](crate::Context::run) returns the
    /// failure.
    pub fn request_register_node<L>(&self, name: impl Into<String>, lifecycle: L)
    where
        L: NodeLifecycle,
    {
        let name = name.into();
        let this = self.clone();
        self.inner.handle.post_task(move || {
            let mut lifecycle: Box<dyn NodeLifecycle> = Box::new(lifecycle);
            lifecycle.on_init();

            let Some(client_id) = this.client_id() else {
                this.finish_register(
                    lifecycle,
                    Err(Status::invalid_state("master client is not started")),
                );
                return;
            };

            log::debug!("[master-client] registering node '{}'", name);
            let request = MasterRequest::RegisterNode { client_id, name };
            let inner = this.clone();
            this.call(request, move |result| {
                let result = result.and_then(|response| match response {
                    MasterResponse::NodeRegistered { identity } => Ok(identity),
                    other => Err(unexpected("register_node", &other)),
                });
                inner.finish_register(lifecycle, result);
            });
        });
    }

    fn finish_register(&self, mut lifecycle: Box<dyn NodeLifecycle>, result: Result<NodeIdentity, Status>) {
        match result {
            Ok(mut identity) => {
                identity.status = NodeStatus::Registered;
                log::info!("[master-client] node {} registered", identity);
                self.inner.bootstrap.lock().any_node_created = true;
                let id = identity.id;
                lifecycle.on_did_create(identity);
                self.inner.lifecycles.lock().insert(id, lifecycle);
            }
            Err(status) => {
                log::warn!("[master-client] node registration failed: {}", status);
                let fatal = {
                    let mut bootstrap = self.inner.bootstrap.lock();
                    if bootstrap.any_node_created {
                        false
                    } else {
                        bootstrap.failure.get_or_insert_with(|| status.clone());
                        true
                    }
                };
                lifecycle.on_error(status);
                if fatal {
                    self.inner.handle.stop();
                }
            }
        }
    }

    /// Unregister a node. Unknown nodes succeed, so this is idempotent.
    ///
    /// The node's topics and services are torn down at the Master.
    pub fn request_unregister_node<F>(&self, identity: &NodeIdentity, on_result: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let node_id = identity.id;
        self.inner.lifecycles.lock().remove(&node_id);
        self.inner.claims.lock().retain(|(node, _, _)| *node != node_id);
        self.inner.watchers.lock().retain(|(node, _), _| *node != node_id);

        let client_id = match self.client_id() {
            Some(id) => id,
            None => {
                self.inner.handle.post_task(move || on_result(Status::ok_status()));
                return;
            }
        };
        self.call(MasterRequest::UnregisterNode { client_id, node_id }, move |result| {
            on_result(result.err().unwrap_or_else(Status::ok_status));
        });
    }

    pub fn request_list_nodes<F>(&self, on_result: F)
    where
        F: FnOnce(Result<Vec<NodeInfo>, Status>) + Send + 'static,
    {
        self.call(MasterRequest::ListNodes, move |result| {
            on_result(result.and_then(|response| match response {
                MasterResponse::Nodes { nodes } => Ok(nodes),
                other => Err(unexpected("list_nodes", &other)),
            }));
        });
    }

    pub fn request_list_topics<F>(&self, on_result: F)
    where
        F: FnOnce(Result<Vec<TopicSummary>, Status>) + Send + 'static,
    {
        self.call(MasterRequest::ListTopics, move |result| {
            on_result(result.and_then(|response| match response {
                MasterResponse::Topics { topics } => Ok(topics),
                other => Err(unexpected("list_topics", &other)),
            }));
        });
    }

    pub fn request_list_services<F>(&self, on_result: F)
    where
        F: FnOnce(Result<Vec<ServiceSummary>, Status>) + Send + 'static,
    {
        self.call(MasterRequest::ListServices, move |result| {
            on_result(result.and_then(|response| match response {
                MasterResponse::Services { services } => Ok(services),
                other => Err(unexpected("list_services", &other)),
            }));
        });
    }

    /// Number of nodes registered by this process and still alive.
    pub fn node_count(&self) -> usize {
        self.inner.lifecycles.lock().len()
    }

    /// Close the Master connection. Pending requests fail with `Unavailable`.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.transport.close();
            *self.inner.client_id.lock() = None;
        }
    }

    /// Send `request`; `on_reply` runs on the loop. `Error` responses are
    /// turned into `Err`.
    pub(crate) fn call<F>(&self, request: MasterRequest, on_reply: F)
    where
        F: FnOnce(Result<MasterResponse, Status>) + Send + 'static,
    {
        let handle = self.inner.handle.clone();
        self.inner.transport.call(
            request,
            Box::new(move |result| {
                let result = result.and_then(|response| match response {
                    MasterResponse::Error { status } => Err(status),
                    other => Ok(other),
                });
                handle.post_task(move || on_reply(result));
            }),
        );
    }

    /// Reserve (node, name, role). Fails with `AlreadyExists` while a
    /// previous reservation is live.
    pub(crate) fn claim(&self, node_id: NodeId, name: &str, role: Role) -> Result<(), Status> {
        if self.inner.claims.lock().insert((node_id, name.to_string(), role)) {
            Ok(())
        } else {
            Err(Status::already_exists(format!(
                "{} for '{}' is already registered or pending on {}",
                role.as_str(),
                name,
                node_id
            )))
        }
    }

    pub(crate) fn release(&self, node_id: NodeId, name: &str, role: Role) {
        self.inner.claims.lock().remove(&(node_id, name.to_string(), role));
    }

    pub(crate) fn watch(&self, node_id: NodeId, key: WatchKey, handler: NotificationHandler) {
        self.inner.watchers.lock().insert((node_id, key), handler);
    }

    pub(crate) fn unwatch(&self, node_id: NodeId, key: &WatchKey) {
        self.inner.watchers.lock().remove(&(node_id, key.clone()));
    }

    /// Failure of the first node registration, if the process never got a node.
    pub(crate) fn take_bootstrap_failure(&self) -> Option<Status> {
        self.inner.bootstrap.lock().failure.take()
    }
}

fn schedule_heartbeat(weak: Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let interval = inner.config.heartbeat_interval();
    inner.handle.post_delayed_task(
        move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            let client_id = *inner.client_id.lock();
            if let Some(client_id) = client_id {
                inner.transport.call(
                    MasterRequest::Heartbeat { client_id },
                    Box::new(move |result| match result {
                        Ok(MasterResponse::Error { status }) | Err(status) => {
                            log::warn!("[master-client] heartbeat for {} failed: {}", client_id, status);
                        }
                        Ok(_) => {}
                    }),
                );
            }
            drop(inner);
            schedule_heartbeat(weak);
        },
        interval,
    );
}

fn unexpected(what: &str, response: &MasterResponse) -> Status {
    Status::internal(format!("unexpected reply to {}: {:?}", what, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::master::InProcessMaster;
    use crate::status::StatusCode;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        identity: Arc<Mutex<Option<NodeIdentity>>>,
    }

    impl NodeLifecycle for Recorder {
        fn on_init(&mut self) {
            self.events.lock().push("init".into());
        }

        fn on_did_create(&mut self, identity: NodeIdentity) {
            self.events.lock().push(format!("created {}", identity.name));
            *self.identity.lock() = Some(identity);
        }

        fn on_error(&mut self, status: Status) {
            self.events.lock().push(format!("error {}", status.code()));
        }
    }

    fn client(master: &InProcessMaster, event_loop: &EventLoop) -> MasterClient {
        let client = MasterClient::new(
            NodeConfig::default(),
            Arc::new(master.transport()),
            event_loop.handle(),
        );
        client.start().expect("start");
        client
    }

    #[test]
    fn test_register_node_runs_lifecycle_in_order() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = client(&master, &event_loop);

        let recorder = Recorder::default();
        client.request_register_node("talker", recorder.clone());
        event_loop.run_until_idle();

        assert_eq!(*recorder.events.lock(), vec!["init", "created talker"]);
        let identity = recorder.identity.lock().clone().expect("identity");
        assert_eq!(identity.status, NodeStatus::Registered);
        assert_eq!(client.node_count(), 1);
    }

    #[test]
    fn test_duplicate_name_reports_error_without_stopping_loop() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = client(&master, &event_loop);

        let first = Recorder::default();
        let second = Recorder::default();
        client.request_register_node("talker", first.clone());
        client.request_register_node("talker", second.clone());
        event_loop.run_until_idle();

        assert_eq!(*second.events.lock(), vec!["init", "error ALREADY_EXISTS"]);
        assert!(client.take_bootstrap_failure().is_none());
    }

    #[test]
    fn test_first_registration_failure_is_recorded() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let other = client(&master, &event_loop);
        other.request_register_node("taken", Recorder::default());
        event_loop.run_until_idle();

        let client = client(&master, &event_loop);
        client.request_register_node("taken", Recorder::default());
        event_loop.run_until_idle();

        let failure = client.take_bootstrap_failure().expect("failure");
        assert_eq!(failure.code(), StatusCode::AlreadyExists);
        assert_eq!(failure.error_message(), "Node 'taken' is already registered.");
    }

    #[test]
    fn test_register_before_start_fails() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = MasterClient::new(
            NodeConfig::default(),
            Arc::new(master.transport()),
            event_loop.handle(),
        );
        let recorder = Recorder::default();
        client.request_register_node("early", recorder.clone());
        event_loop.run_until_idle();
        assert_eq!(*recorder.events.lock(), vec!["init", "error INVALID_STATE"]);
    }

    #[test]
    fn test_unregister_node_is_idempotent() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = client(&master, &event_loop);
        let recorder = Recorder::default();
        client.request_register_node("talker", recorder.clone());
        event_loop.run_until_idle();
        let identity = recorder.identity.lock().clone().expect("identity");

        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let results = results.clone();
            client.request_unregister_node(&identity, move |status| results.lock().push(status.ok()));
        }
        event_loop.run_until_idle();
        assert_eq!(*results.lock(), vec![true, true]);
        assert_eq!(master.with_registry_ref(|r| r.node_count()), 0);
    }

    #[test]
    fn test_claims_reject_duplicates_until_released() {
        let master = InProcessMaster::new();
        let event_loop = EventLoop::new();
        let client = client(&master, &event_loop);

        client.claim(NodeId(1), "chatter", Role::Publisher).expect("first claim");
        let err = client
            .claim(NodeId(1), "chatter", Role::Publisher)
            .expect_err("second claim");
        assert_eq!(err.code(), StatusCode::AlreadyExists);
        client.claim(NodeId(1), "chatter", Role::Subscriber).expect("other role");

        client.release(NodeId(1), "chatter", Role::Publisher);
        client.claim(NodeId(1), "chatter", Role::Publisher).expect("after release");
    }

    #[test]
    fn test_list_nodes() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = client(&master, &event_loop);
        client.request_register_node("a", Recorder::default());
        client.request_register_node("b", Recorder::default());
        event_loop.run_until_idle();

        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        client.request_list_nodes(move |result| {
            *sink.lock() = result
                .expect("list")
                .into_iter()
                .map(|n| n.name)
                .collect::<Vec<_>>();
        });
        event_loop.run_until_idle();
        assert_eq!(*names.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_heartbeat_keeps_lease() {
        let master = InProcessMaster::new();
        let mut event_loop = EventLoop::new();
        let client = MasterClient::new(
            NodeConfig::default().with_heartbeat_interval(Duration::from_millis(10)),
            Arc::new(master.transport()),
            event_loop.handle(),
        );
        client.start().expect("start");

        event_loop.run_for(Duration::from_millis(120));
        assert!(master.expire_clients(Duration::from_millis(60)).is_empty());

        client.close();
        event_loop.run_for(Duration::from_millis(20));
        assert_eq!(master.with_registry_ref(|r| r.client_count()), 0);
    }
}
