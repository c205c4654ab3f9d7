// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master server core.
//!
//! One tokio task per connection. Every request runs against the shared
//! [`MasterRegistry`]; the resulting notifications are queued to their
//! clients through the [`NotificationRouter`] while the registry lock is
//! still held, so each client sees registry changes in the order they
//! happened.

use crate::config::ServerConfig;
use rendez::master::{ClientFrame, MasterRequest, MasterResponse, ServerFrame};
use rendez::{ClientId, MasterRegistry, NodeId, Status};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod router;

pub use connection::{ClientConnection, ConnectionError, FrameReader};
pub use router::{NotificationRouter, RouterStats};

/// Master server - node registry and channel negotiation over TCP.
#[derive(Clone)]
pub struct MasterServer {
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<MasterRegistry>>,
    router: Arc<RwLock<NotificationRouter>>,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

/// Who may send a request.
enum Scope {
    /// Anyone, including connections that never registered (rendezctl).
    Open,
    /// The connection's own client.
    Client(ClientId),
    /// A node owned by the connection's client.
    Node(NodeId),
}

fn scope(request: &MasterRequest) -> Scope {
    match request {
        MasterRequest::RegisterClient
        | MasterRequest::ListNodes
        | MasterRequest::ListTopics
        | MasterRequest::ListServices => Scope::Open,
        MasterRequest::Heartbeat { client_id }
        | MasterRequest::RegisterNode { client_id, .. }
        | MasterRequest::UnregisterNode { client_id, .. } => Scope::Client(*client_id),
        MasterRequest::PublishTopic { node_id, .. }
        | MasterRequest::UnpublishTopic { node_id, .. }
        | MasterRequest::SubscribeTopic { node_id, .. }
        | MasterRequest::UnsubscribeTopic { node_id, .. }
        | MasterRequest::RegisterServiceServer { node_id, .. }
        | MasterRequest::UnregisterServiceServer { node_id, .. }
        | MasterRequest::RegisterServiceClient { node_id, .. }
        | MasterRequest::UnregisterServiceClient { node_id, .. } => Scope::Node(*node_id),
    }
}

impl MasterServer {
    /// Create a new Master server.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let registry = MasterRegistry::new().with_max_nodes_per_client(config.max_nodes_per_client);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(registry)),
            router: Arc::new(RwLock::new(NotificationRouter::new())),
            shutdown: Arc::new(shutdown),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        info!("Master listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let lease_checker = self.clone();
        tokio::spawn(async move { lease_checker.check_leases().await });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            if let Err(e) = self.configure_stream(&stream) {
                                warn!("Cannot configure socket of {}: {}", peer_addr, e);
                            }
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn configure_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        if self.config.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(self.config.tcp_keepalive_time());
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }

    /// Periodically drop clients whose heartbeats stopped.
    async fn check_leases(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let lease = self.config.lease_duration();
        let mut ticker = tokio::time::interval(self.config.lease_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut registry = self.registry.write().await;
                    let (expired, notifications) = registry.expire_clients(lease);
                    if expired.is_empty() {
                        continue;
                    }
                    let mut router = self.router.write().await;
                    for client_id in &expired {
                        info!("Lease of {} expired", client_id);
                        router.unregister(*client_id);
                    }
                    router.dispatch(notifications);
                }
                _ = shutdown.changed() => {
                    debug!("Lease checker shutting down");
                    break;
                }
            }
        }
    }

    /// Handle a client connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let (mut conn, mut reader) =
            ClientConnection::split(stream, peer_addr, self.config.max_message_size);
        let mut shutdown = self.shutdown.subscribe();

        let (inbound_tx, mut inbound_rx) = unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.read_frame().await;
                let more = matches!(result, Ok(Some(_)));
                if inbound_tx.send(result).is_err() || !more {
                    break;
                }
            }
        });

        // Moves into the router on RegisterClient; after that the router
        // holds the only sender and dropping it closes this connection.
        let (outbound_tx, mut outbound_rx) = unbounded_channel::<ServerFrame>();
        let mut outbox = Some(outbound_tx);

        let result = loop {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(Ok(Some(frame))) => {
                            if let Err(e) = self.process_frame(&mut conn, frame, &mut outbox).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(None)) | None => {
                            debug!("Connection closed: {}", peer_addr);
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            warn!("Read error from {}: {}", peer_addr, e);
                            break Ok(());
                        }
                    }
                }
                queued = outbound_rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if let Err(e) = conn.send_frame(&frame).await {
                                warn!("Failed to notify {}: {}", peer_addr, e);
                                break Ok(());
                            }
                        }
                        None => {
                            info!("Closing connection {} after lease expiry", peer_addr);
                            break Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Connection handler shutting down: {}", peer_addr);
                    break Ok(());
                }
            }
        };
        reader_task.abort();

        if let Some(client_id) = conn.client_id() {
            let mut registry = self.registry.write().await;
            let notifications = registry.remove_client(client_id);
            let mut router = self.router.write().await;
            router.unregister(client_id);
            router.dispatch(notifications);
            info!("Removed {} on disconnect", client_id);
        }

        result
    }

    /// Answer one request and route the notifications it caused.
    async fn process_frame(
        &self,
        conn: &mut ClientConnection,
        frame: ClientFrame,
        outbox: &mut Option<UnboundedSender<ServerFrame>>,
    ) -> Result<(), ServerError> {
        let ClientFrame { id, request } = frame;
        debug!("<- {} #{} from {}", request.name(), id, conn.peer_addr());

        let response = {
            let mut registry = self.registry.write().await;
            match self.authorize(conn, &registry, &request) {
                Err(status) => MasterResponse::error(status),
                Ok(()) => {
                    let registering = matches!(request, MasterRequest::RegisterClient);
                    let outcome = registry.handle(request);
                    let mut router = self.router.write().await;
                    if let MasterResponse::ClientRegistered { client_id } = &outcome.response {
                        if registering {
                            conn.set_client_id(*client_id);
                            if let Some(tx) = outbox.take() {
                                router.register(*client_id, tx);
                            }
                            info!("Registered {} from {}", client_id, conn.peer_addr());
                        }
                    }
                    router.dispatch(outcome.notifications);
                    outcome.response
                }
            }
        };

        if let MasterResponse::Error { status } = &response {
            debug!("-> #{} failed: {}", id, status);
        }
        conn.send_frame(&ServerFrame::Response { id, response }).await?;
        Ok(())
    }

    fn authorize(
        &self,
        conn: &ClientConnection,
        registry: &MasterRegistry,
        request: &MasterRequest,
    ) -> Result<(), Status> {
        let owner = conn.client_id();
        match scope(request) {
            Scope::Open => {
                if matches!(request, MasterRequest::RegisterClient) {
                    if owner.is_some() {
                        return Err(Status::invalid_state("connection already registered a client"));
                    }
                    if registry.client_count() >= self.config.max_clients {
                        warn!("Max clients reached, rejecting {}", conn.peer_addr());
                        return Err(Status::registration_failed("max clients reached"));
                    }
                }
                Ok(())
            }
            Scope::Client(client_id) => match owner {
                None => Err(Status::invalid_state("register_client must come first")),
                Some(own) if own != client_id => Err(Status::invalid_argument(format!(
                    "{} does not belong to this connection",
                    client_id
                ))),
                Some(_) => Ok(()),
            },
            Scope::Node(node_id) => match (owner, registry.node_owner(node_id)) {
                (None, _) => Err(Status::invalid_state("register_client must come first")),
                (Some(own), Some(node_owner)) if own != node_owner => Err(Status::invalid_argument(
                    format!("{} does not belong to this connection", node_id),
                )),
                // Unknown nodes are reported by the registry itself.
                _ => Ok(()),
            },
        }
    }

    /// Signal the server and every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.client_count()
    }

    pub async fn node_count(&self) -> usize {
        self.registry.read().await.node_count()
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn router_stats(&self) -> RouterStats {
        self.router.read().await.stats().clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Server error types.
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "Configuration error: {}", s),
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::AlreadyRunning => write!(f, "Server already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ConnectionError> for ServerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(s) => Self::Io(s),
            ConnectionError::Protocol(s) => Self::Protocol(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendez::master::protocol::{read_frame, write_frame};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    const MAX: usize = 1024 * 1024;

    async fn start(config: ServerConfig) -> (MasterServer, SocketAddr) {
        let server = MasterServer::new(config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    /// Blocking request/response exchange, run off the runtime threads.
    async fn exchange(addr: SocketAddr, requests: Vec<MasterRequest>) -> Vec<MasterResponse> {
        tokio::task::spawn_blocking(move || {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            let mut responses = Vec::new();
            for (id, request) in requests.into_iter().enumerate() {
                write_frame(&mut stream, &ClientFrame { id: id as u64, request }, MAX).unwrap();
                loop {
                    match read_frame::<_, ServerFrame>(&mut stream, MAX).unwrap() {
                        Some(ServerFrame::Response { response, .. }) => {
                            responses.push(response);
                            break;
                        }
                        Some(ServerFrame::Notification { .. }) => continue,
                        None => panic!("server closed the connection"),
                    }
                }
            }
            responses
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_client_and_node() {
        let (server, addr) = start(ServerConfig::default()).await;
        let responses = exchange(
            addr,
            vec![
                MasterRequest::RegisterClient,
                MasterRequest::RegisterNode {
                    client_id: ClientId(1),
                    name: "talker".into(),
                },
                MasterRequest::ListNodes,
            ],
        )
        .await;

        assert_eq!(
            responses[0],
            MasterResponse::ClientRegistered {
                client_id: ClientId(1)
            }
        );
        assert!(matches!(responses[1], MasterResponse::NodeRegistered { .. }));
        match &responses[2] {
            MasterResponse::Nodes { nodes } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].name, "talker");
            }
            other => panic!("unexpected response {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_requests_before_register_client_are_refused() {
        let (server, addr) = start(ServerConfig::default()).await;
        let responses = exchange(
            addr,
            vec![
                MasterRequest::Heartbeat {
                    client_id: ClientId(9),
                },
                MasterRequest::ListTopics,
            ],
        )
        .await;

        assert_eq!(
            responses[0].status().code(),
            rendez::StatusCode::InvalidState
        );
        assert_eq!(responses[1], MasterResponse::Topics { topics: Vec::new() });
        server.shutdown();
    }

    #[tokio::test]
    async fn test_foreign_client_id_is_refused() {
        let (server, addr) = start(ServerConfig::default()).await;
        let responses = exchange(
            addr,
            vec![
                MasterRequest::RegisterClient,
                MasterRequest::RegisterNode {
                    client_id: ClientId(42),
                    name: "spoof".into(),
                },
            ],
        )
        .await;
        assert_eq!(
            responses[1].status().code(),
            rendez::StatusCode::InvalidArgument
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_max_clients() {
        let config = ServerConfig {
            max_clients: 1,
            ..Default::default()
        };
        let (server, addr) = start(config).await;

        // The first connection stays open and keeps its client.
        let first = tokio::task::spawn_blocking(move || {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            let frame = ClientFrame {
                id: 0,
                request: MasterRequest::RegisterClient,
            };
            write_frame(&mut stream, &frame, MAX).unwrap();
            let _: Option<ServerFrame> = read_frame(&mut stream, MAX).unwrap();
            stream
        })
        .await
        .unwrap();

        let responses = exchange(addr, vec![MasterRequest::RegisterClient]).await;
        assert_eq!(
            responses[0].status().code(),
            rendez::StatusCode::RegistrationFailed
        );
        drop(first);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_removes_client() {
        let (server, addr) = start(ServerConfig::default()).await;
        exchange(
            addr,
            vec![
                MasterRequest::RegisterClient,
                MasterRequest::RegisterNode {
                    client_id: ClientId(1),
                    name: "gone".into(),
                },
            ],
        )
        .await;

        let mut removed = false;
        for _ in 0..100 {
            if server.client_count().await == 0 {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);
        assert_eq!(server.node_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_serve_twice_fails() {
        let (server, _addr) = start(ServerConfig::default()).await;
        for _ in 0..100 {
            if server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(ServerError::AlreadyRunning)
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            lease_duration_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            MasterServer::new(config).await,
            Err(ServerError::Config(_))
        ));
    }
}
