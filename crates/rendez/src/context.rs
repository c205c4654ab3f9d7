// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process runtime: one event loop plus one Master connection.

use crate::communication::{Message, Publisher, Subscriber};
use crate::config::NodeConfig;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::master::{MasterClient, MasterTransport, TcpMasterTransport};
use crate::node::{ClientId, NodeLifecycle};
use crate::rpc::{ServiceClient, ServiceServer};
use crate::status::Status;
use std::sync::Arc;
use std::time::Duration;

/// Owns the [`EventLoop`] and the [`MasterClient`] of a process.
///
/// ```no_run
/// use rendez::{Context, NodeConfig, NoopLifecycle};
///
/// let mut ctx = Context::new(NodeConfig::default())?;
/// ctx.create_node("talker", NoopLifecycle);
/// ctx.run()?;
/// # Ok::<(), rendez::Status>(())
/// ```
pub struct Context {
    event_loop: EventLoop,
    client: MasterClient,
}

impl Context {
    /// Context talking to the Master at `config.master_address` over TCP.
    pub fn new(config: NodeConfig) -> Result<Self, Status> {
        config.validate()?;
        let transport = TcpMasterTransport::new(
            config.master_address,
            config.connect_timeout(),
            config.max_message_size,
        );
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Context over an arbitrary Master transport (e.g. an in-process Master).
    pub fn with_transport(config: NodeConfig, transport: Arc<dyn MasterTransport>) -> Self {
        let event_loop = EventLoop::new();
        let client = MasterClient::new(config, transport, event_loop.handle());
        Self { event_loop, client }
    }

    pub fn client(&self) -> &MasterClient {
        &self.client
    }

    pub fn handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn config(&self) -> &NodeConfig {
        self.client.config()
    }

    /// Connect to the Master. Called by the `run*` methods when needed.
    pub fn start(&self) -> Result<ClientId, Status> {
        self.client.start()
    }

    /// Queue a node registration; see [`MasterClient::request_register_node`].
    pub fn create_node<L: NodeLifecycle>(&self, name: impl Into<String>, lifecycle: L) {
        self.client.request_register_node(name, lifecycle);
    }

    pub fn publisher<M: Message>(&self) -> Publisher<M> {
        Publisher::new(&self.client)
    }

    pub fn subscriber<M: Message>(&self) -> Subscriber<M> {
        Subscriber::new(&self.client)
    }

    pub fn service_server<Req: Message, Resp: Message>(&self) -> ServiceServer<Req, Resp> {
        ServiceServer::new(&self.client)
    }

    pub fn service_client<Req: Message, Resp: Message>(&self) -> ServiceClient<Req, Resp> {
        ServiceClient::new(&self.client)
    }

    /// Run until [`stop`](Self::stop) is called.
    ///
    /// Returns the failure of the first node registration if the process
    /// never got a node; the loop stops on its own in that case.
    pub fn run(&mut self) -> Result<(), Status> {
        self.start()?;
        self.event_loop.run();
        self.bootstrap_result()
    }

    pub fn run_for(&mut self, duration: Duration) -> Result<(), Status> {
        self.start()?;
        self.event_loop.run_for(duration);
        self.bootstrap_result()
    }

    /// Run until `done` holds or `timeout` elapses. Returns whether `done`
    /// became true.
    pub fn run_until<F>(&mut self, timeout: Duration, done: F) -> Result<bool, Status>
    where
        F: FnMut() -> bool,
    {
        self.start()?;
        let reached = self.event_loop.run_until(timeout, done);
        self.bootstrap_result().map(|()| reached)
    }

    /// Run every task that is ready now.
    pub fn run_until_idle(&mut self) -> Result<(), Status> {
        self.start()?;
        self.event_loop.run_until_idle();
        self.bootstrap_result()
    }

    pub fn stop(&self) {
        self.event_loop.stop();
    }

    fn bootstrap_result(&self) -> Result<(), Status> {
        match self.client.take_bootstrap_failure() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::InProcessMaster;
    use crate::node::{NodeIdentity, NoopLifecycle};
    use crate::status::StatusCode;
    use parking_lot::Mutex;

    #[test]
    fn test_run_returns_bootstrap_failure() {
        let master = InProcessMaster::new();
        let mut first = Context::with_transport(NodeConfig::default(), Arc::new(master.transport()));
        first.create_node("camera", NoopLifecycle);
        first.run_until_idle().unwrap();

        let mut second = Context::with_transport(NodeConfig::default(), Arc::new(master.transport()));
        second.create_node("camera", NoopLifecycle);
        let err = second.run().unwrap_err();
        assert_eq!(err.code(), StatusCode::AlreadyExists);
    }

    #[test]
    fn test_later_failure_does_not_stop_run() {
        let master = InProcessMaster::new();
        let mut ctx = Context::with_transport(NodeConfig::default(), Arc::new(master.transport()));
        ctx.create_node("a", NoopLifecycle);
        ctx.create_node("a", NoopLifecycle);
        assert!(ctx.run_for(Duration::from_millis(30)).is_ok());
        assert_eq!(ctx.client().node_count(), 1);
    }

    #[test]
    fn test_empty_name_gets_generated_name() {
        struct Named(Arc<Mutex<Option<NodeIdentity>>>);
        impl NodeLifecycle for Named {
            fn on_did_create(&mut self, identity: NodeIdentity) {
                *self.0.lock() = Some(identity);
            }
        }

        let master = InProcessMaster::new();
        let mut ctx = Context::with_transport(NodeConfig::default(), Arc::new(master.transport()));
        let slot = Arc::new(Mutex::new(None));
        ctx.create_node("", Named(slot.clone()));
        ctx.run_until_idle().unwrap();
        let identity = slot.lock().clone().unwrap();
        assert_eq!(identity.name.len(), 12);
    }

    #[test]
    fn test_new_validates_config() {
        let config = NodeConfig {
            heartbeat_interval_ms: 0,
            ..NodeConfig::default()
        };
        assert!(Context::new(config).is_err());
    }
}
