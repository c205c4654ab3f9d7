// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master registry: clients, nodes, topics and services.
//!
//! The registry is the single source of truth for who is registered. It is
//! transport-agnostic: every operation returns an [`Outcome`] holding the
//! reply for the caller plus the notifications to push to other clients.
//! Both the `rendez-master` server and the in-process Master drive it.

use super::protocol::{MasterRequest, MasterResponse, Notification, ServiceSummary, TopicSummary};
use crate::channel::{ChannelEndpoint, ChannelNegotiator, DescriptorWire, NegotiatedChannel};
use crate::node::{random_node_name, ClientId, NodeId, NodeIdentity, NodeInfo, NodeStatus};
use crate::status::Status;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Length of generated node names.
const GENERATED_NAME_LEN: usize = 12;

/// Reply plus fan-out produced by one registry operation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub response: MasterResponse,
    pub notifications: Vec<(ClientId, Notification)>,
}

impl Outcome {
    fn reply(response: MasterResponse) -> Self {
        Self {
            response,
            notifications: Vec::new(),
        }
    }

    fn ack() -> Self {
        Self::reply(MasterResponse::Ack)
    }

    fn error(status: Status) -> Self {
        Self::reply(MasterResponse::error(status))
    }
}

#[derive(Debug)]
struct ClientRecord {
    last_seen: Instant,
    nodes: HashSet<NodeId>,
}

#[derive(Debug, Clone)]
struct PublisherRecord {
    node_id: NodeId,
    client_id: ClientId,
    channel: NegotiatedChannel,
}

#[derive(Debug, Clone)]
struct SubscriberRecord {
    client_id: ClientId,
    schema_id: String,
    descriptor: DescriptorWire,
    channel: Option<NegotiatedChannel>,
    /// Lost its publisher after a successful negotiation. Such a
    /// subscriber already got its registration result, so a later
    /// publisher that cannot serve it leaves it waiting.
    reattaching: bool,
}

#[derive(Debug, Default)]
struct TopicRecord {
    schema_id: String,
    publisher: Option<PublisherRecord>,
    subscribers: BTreeMap<NodeId, SubscriberRecord>,
}

impl TopicRecord {
    fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ServerRecord {
    node_id: NodeId,
    descriptor: DescriptorWire,
    endpoints: Vec<ChannelEndpoint>,
}

#[derive(Debug, Clone)]
struct ServiceClientRecord {
    client_id: ClientId,
    schema_id: String,
    descriptor: DescriptorWire,
    connected: bool,
}

#[derive(Debug, Default)]
struct ServiceRecord {
    schema_id: String,
    server: Option<ServerRecord>,
    clients: BTreeMap<NodeId, ServiceClientRecord>,
}

/// Registry of clients, nodes, topics and services.
#[derive(Debug)]
pub struct MasterRegistry {
    clients: HashMap<ClientId, ClientRecord>,
    nodes: HashMap<NodeId, NodeInfo>,
    names: HashMap<String, NodeId>,
    topics: BTreeMap<String, TopicRecord>,
    services: BTreeMap<String, ServiceRecord>,
    next_client_id: u64,
    next_node_id: u64,
    max_nodes_per_client: usize,
}

impl MasterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            nodes: HashMap::new(),
            names: HashMap::new(),
            topics: BTreeMap::new(),
            services: BTreeMap::new(),
            next_client_id: 1,
            next_node_id: 1,
            max_nodes_per_client: usize::MAX,
        }
    }

    /// Limit the number of nodes one client may register.
    pub fn with_max_nodes_per_client(mut self, max: usize) -> Self {
        self.max_nodes_per_client = max;
        self
    }

    /// Dispatch a decoded request.
    ///
    /// `RegisterClient` allocates a new client; the transport is expected to
    /// bind the returned id to its connection.
    pub fn handle(&mut self, request: MasterRequest) -> Outcome {
        match request {
            MasterRequest::RegisterClient => Outcome::reply(MasterResponse::ClientRegistered {
                client_id: self.register_client(),
            }),
            MasterRequest::Heartbeat { client_id } => match self.heartbeat(client_id) {
                Ok(()) => Outcome::ack(),
                Err(s) => Outcome::error(s),
            },
            MasterRequest::RegisterNode { client_id, name } => self.register_node(client_id, name),
            MasterRequest::UnregisterNode { client_id, node_id } => {
                self.unregister_node(client_id, node_id)
            }
            MasterRequest::ListNodes => Outcome::reply(MasterResponse::Nodes {
                nodes: self.list_nodes(),
            }),
            MasterRequest::ListTopics => Outcome::reply(MasterResponse::Topics {
                topics: self.list_topics(),
            }),
            MasterRequest::ListServices => Outcome::reply(MasterResponse::Services {
                services: self.list_services(),
            }),
            MasterRequest::PublishTopic {
                node_id,
                topic,
                schema_id,
                descriptor,
                endpoints,
            } => self.publish_topic(node_id, topic, schema_id, descriptor, endpoints),
            MasterRequest::UnpublishTopic { node_id, topic } => self.unpublish_topic(node_id, &topic),
            MasterRequest::SubscribeTopic {
                node_id,
                topic,
                schema_id,
                descriptor,
            } => self.subscribe_topic(node_id, topic, schema_id, descriptor),
            MasterRequest::UnsubscribeTopic { node_id, topic } => {
                self.unsubscribe_topic(node_id, &topic)
            }
            MasterRequest::RegisterServiceServer {
                node_id,
                service,
                schema_id,
                descriptor,
                endpoints,
            } => self.register_service_server(node_id, service, schema_id, descriptor, endpoints),
            MasterRequest::UnregisterServiceServer { node_id, service } => {
                self.unregister_service_server(node_id, &service)
            }
            MasterRequest::RegisterServiceClient {
                node_id,
                service,
                schema_id,
                descriptor,
            } => self.register_service_client(node_id, service, schema_id, descriptor),
            MasterRequest::UnregisterServiceClient { node_id, service } => {
                self.unregister_service_client(node_id, &service)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Clients
    // ---------------------------------------------------------------------

    /// Allocate a new client id.
    pub fn register_client(&mut self) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.clients.insert(
            id,
            ClientRecord {
                last_seen: Instant::now(),
                nodes: HashSet::new(),
            },
        );
        log::debug!("[master] registered {}", id);
        id
    }

    /// Refresh a client's lease.
    pub fn heartbeat(&mut self, client_id: ClientId) -> Result<(), Status> {
        match self.clients.get_mut(&client_id) {
            Some(c) => {
                c.last_seen = Instant::now();
                Ok(())
            }
            None => Err(Status::not_found(format!("{} is not registered", client_id))),
        }
    }

    /// Drop a client and everything its nodes registered.
    pub fn remove_client(&mut self, client_id: ClientId) -> Vec<(ClientId, Notification)> {
        let Some(record) = self.clients.remove(&client_id) else {
            return Vec::new();
        };
        let mut notifications = Vec::new();
        for node_id in record.nodes {
            notifications.extend(self.drop_node(node_id));
        }
        log::info!("[master] removed {}", client_id);
        notifications
    }

    /// Remove clients whose lease expired. Returns the removed ids and the
    /// notifications produced by tearing down their registrations.
    pub fn expire_clients(
        &mut self,
        lease: Duration,
    ) -> (Vec<ClientId>, Vec<(ClientId, Notification)>) {
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.last_seen.elapsed() > lease)
            .map(|(id, _)| *id)
            .collect();
        let mut notifications = Vec::new();
        for id in &expired {
            log::info!("[master] lease expired for {}", id);
            notifications.extend(self.remove_client(*id));
        }
        // Expired clients cannot receive anything.
        notifications.retain(|(c, _)| !expired.contains(c));
        (expired, notifications)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    fn register_node(&mut self, client_id: ClientId, name: String) -> Outcome {
        let Some(client) = self.clients.get(&client_id) else {
            return Outcome::error(Status::not_found(format!("{} is not registered", client_id)));
        };
        if client.nodes.len() >= self.max_nodes_per_client {
            return Outcome::error(Status::registration_failed(format!(
                "{} reached the limit of {} nodes",
                client_id, self.max_nodes_per_client
            )));
        }

        let name = if name.is_empty() {
            loop {
                let candidate = random_node_name(GENERATED_NAME_LEN);
                if !self.names.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else if self.names.contains_key(&name) {
            return Outcome::error(Status::already_exists(format!(
                "Node '{}' is already registered.",
                name
            )));
        } else {
            name
        };

        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        let info = NodeInfo {
            id,
            name: name.clone(),
            client_id,
        };
        self.names.insert(name.clone(), id);
        self.nodes.insert(id, info);
        if let Some(c) = self.clients.get_mut(&client_id) {
            c.nodes.insert(id);
        }
        log::info!("[master] registered node '{}' ({}) for {}", name, id, client_id);

        Outcome::reply(MasterResponse::NodeRegistered {
            identity: NodeIdentity {
                id,
                name,
                client_id,
                status: NodeStatus::Registered,
            },
        })
    }

    fn unregister_node(&mut self, client_id: ClientId, node_id: NodeId) -> Outcome {
        let owner = self.nodes.get(&node_id).map(|n| n.client_id);
        match owner {
            None => Outcome::ack(),
            Some(owner) if owner != client_id => Outcome::error(Status::invalid_argument(
                format!("{} is not owned by {}", node_id, client_id),
            )),
            Some(_) => {
                if let Some(c) = self.clients.get_mut(&client_id) {
                    c.nodes.remove(&node_id);
                }
                Outcome {
                    response: MasterResponse::Ack,
                    notifications: self.drop_node(node_id),
                }
            }
        }
    }

    /// Remove a node and all its topic and service registrations.
    fn drop_node(&mut self, node_id: NodeId) -> Vec<(ClientId, Notification)> {
        let Some(info) = self.nodes.remove(&node_id) else {
            return Vec::new();
        };
        self.names.remove(&info.name);

        let mut notifications = Vec::new();
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in topics {
            notifications.extend(self.unpublish_topic(node_id, &topic).notifications);
            self.unsubscribe_topic(node_id, &topic);
        }
        let services: Vec<String> = self.services.keys().cloned().collect();
        for service in services {
            notifications.extend(self.unregister_service_server(node_id, &service).notifications);
            self.unregister_service_client(node_id, &service);
        }
        log::info!("[master] unregistered node '{}' ({})", info.name, node_id);
        notifications
    }

    fn node_client(&self, node_id: NodeId) -> Result<ClientId, Status> {
        self.nodes
            .get(&node_id)
            .map(|n| n.client_id)
            .ok_or_else(|| Status::not_found(format!("{} is not registered", node_id)))
    }

    /// Client owning `node_id`, if the node is registered.
    pub fn node_owner(&self, node_id: NodeId) -> Option<ClientId> {
        self.nodes.get(&node_id).map(|n| n.client_id)
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ---------------------------------------------------------------------
    // Topics
    // ---------------------------------------------------------------------

    fn publish_topic(
        &mut self,
        node_id: NodeId,
        topic: String,
        schema_id: String,
        descriptor: DescriptorWire,
        endpoints: Vec<ChannelEndpoint>,
    ) -> Outcome {
        let client_id = match self.node_client(node_id) {
            Ok(c) => c,
            Err(s) => return Outcome::error(s),
        };
        let record = self.topics.entry(topic.clone()).or_default();
        if let Some(existing) = &record.publisher {
            return Outcome::error(Status::already_exists(format!(
                "Topic '{}' is already published by {}",
                topic, existing.node_id
            )));
        }

        // Subscribers on a different schema cannot take part. Fresh ones
        // fail; reattaching ones keep waiting for a matching publisher.
        let mut notifications = Vec::new();
        let mismatched: Vec<(NodeId, bool)> = record
            .subscribers
            .iter()
            .filter(|(_, s)| s.schema_id != schema_id)
            .map(|(id, s)| (*id, s.reattaching))
            .collect();
        for (sub_id, reattaching) in &mismatched {
            if *reattaching {
                continue;
            }
            if let Some(sub) = record.subscribers.remove(sub_id) {
                notifications.push((
                    sub.client_id,
                    Notification::TopicFailed {
                        node_id: *sub_id,
                        topic: topic.clone(),
                        status: Status::schema_mismatch(format!(
                            "topic '{}' carries '{}', subscriber expects '{}'",
                            topic, schema_id, sub.schema_id
                        )),
                    },
                ));
            }
        }

        let pending: Vec<NodeId> = record
            .subscribers
            .iter()
            .filter(|(_, s)| s.schema_id == schema_id)
            .map(|(id, _)| *id)
            .collect();
        let descriptors: Vec<&DescriptorWire> = pending
            .iter()
            .filter_map(|id| record.subscribers.get(id))
            .map(|s| &s.descriptor)
            .collect();

        let negotiation = match ChannelNegotiator::negotiate(&descriptor, &endpoints, &descriptors) {
            Ok(n) => n,
            Err(e) => {
                let status: Status = e.into();
                log::debug!("[master] negotiation for '{}' failed: {}", topic, status);
                for sub_id in pending {
                    let reattaching = record
                        .subscribers
                        .get(&sub_id)
                        .is_some_and(|s| s.reattaching);
                    if reattaching {
                        continue;
                    }
                    if let Some(sub) = record.subscribers.remove(&sub_id) {
                        notifications.push((
                            sub.client_id,
                            Notification::TopicFailed {
                                node_id: sub_id,
                                topic: topic.clone(),
                                status: status.clone(),
                            },
                        ));
                    }
                }
                if record.is_empty() {
                    self.topics.remove(&topic);
                }
                return Outcome {
                    response: MasterResponse::error(status),
                    notifications,
                };
            }
        };

        let rejected: HashMap<NodeId, Status> = negotiation
            .rejected
            .into_iter()
            .filter_map(|(idx, e)| pending.get(idx).map(|id| (*id, Status::from(e))))
            .collect();

        for sub_id in pending {
            if let Some(status) = rejected.get(&sub_id) {
                let reattaching = record
                    .subscribers
                    .get(&sub_id)
                    .is_some_and(|s| s.reattaching);
                if reattaching {
                    log::debug!("[master] {} keeps waiting on '{}': {}", sub_id, topic, status);
                    continue;
                }
                if let Some(sub) = record.subscribers.remove(&sub_id) {
                    notifications.push((
                        sub.client_id,
                        Notification::TopicFailed {
                            node_id: sub_id,
                            topic: topic.clone(),
                            status: status.clone(),
                        },
                    ));
                }
            } else if let Some(sub) = record.subscribers.get_mut(&sub_id) {
                sub.channel = Some(negotiation.channel.clone());
                sub.reattaching = false;
                notifications.push((
                    sub.client_id,
                    Notification::TopicNegotiated {
                        node_id: sub_id,
                        topic: topic.clone(),
                        channel: negotiation.channel.clone(),
                    },
                ));
            }
        }

        record.schema_id = schema_id;
        record.publisher = Some(PublisherRecord {
            node_id,
            client_id,
            channel: negotiation.channel.clone(),
        });
        log::info!(
            "[master] '{}' published by {} over {}",
            topic,
            node_id,
            negotiation.channel.endpoint
        );

        Outcome {
            response: MasterResponse::TopicPublished {
                channel: negotiation.channel,
            },
            notifications,
        }
    }

    fn unpublish_topic(&mut self, node_id: NodeId, topic: &str) -> Outcome {
        let Some(record) = self.topics.get_mut(topic) else {
            return Outcome::ack();
        };
        if record.publisher.as_ref().map(|p| p.node_id) != Some(node_id) {
            return Outcome::ack();
        }
        record.publisher = None;

        let mut notifications = Vec::new();
        for (sub_id, sub) in record.subscribers.iter_mut() {
            if sub.channel.take().is_some() {
                sub.reattaching = true;
                notifications.push((
                    sub.client_id,
                    Notification::TopicClosed {
                        node_id: *sub_id,
                        topic: topic.to_string(),
                    },
                ));
            }
        }
        if record.is_empty() {
            self.topics.remove(topic);
        }
        log::info!("[master] '{}' unpublished by {}", topic, node_id);
        Outcome {
            response: MasterResponse::Ack,
            notifications,
        }
    }

    fn subscribe_topic(
        &mut self,
        node_id: NodeId,
        topic: String,
        schema_id: String,
        descriptor: DescriptorWire,
    ) -> Outcome {
        let client_id = match self.node_client(node_id) {
            Ok(c) => c,
            Err(s) => return Outcome::error(s),
        };
        if descriptor.kinds.is_empty() {
            return Outcome::error(Status::invalid_argument("no channel kind requested"));
        }

        let record = self.topics.entry(topic.clone()).or_default();
        if record.subscribers.contains_key(&node_id) {
            return Outcome::error(Status::already_exists(format!(
                "{} already subscribes to '{}'",
                node_id, topic
            )));
        }

        let channel = match &record.publisher {
            Some(publisher) => {
                if record.schema_id != schema_id {
                    return Outcome::error(Status::schema_mismatch(format!(
                        "topic '{}' carries '{}', subscriber expects '{}'",
                        topic, record.schema_id, schema_id
                    )));
                }
                match ChannelNegotiator::admit(&publisher.channel, &descriptor) {
                    Ok(ch) => Some(ch),
                    Err(e) => {
                        log::debug!("[master] late joiner {} on '{}' rejected: {}", node_id, topic, e);
                        return Outcome::error(e.into());
                    }
                }
            }
            None => {
                if record.subscribers.is_empty() {
                    record.schema_id = schema_id.clone();
                }
                None
            }
        };

        record.subscribers.insert(
            node_id,
            SubscriberRecord {
                client_id,
                schema_id,
                descriptor,
                channel: channel.clone(),
                reattaching: false,
            },
        );
        log::debug!(
            "[master] {} subscribed to '{}' ({})",
            node_id,
            topic,
            if channel.is_some() { "negotiated" } else { "pending" }
        );
        Outcome::reply(MasterResponse::TopicSubscribed { channel })
    }

    fn unsubscribe_topic(&mut self, node_id: NodeId, topic: &str) -> Outcome {
        if let Some(record) = self.topics.get_mut(topic) {
            if record.subscribers.remove(&node_id).is_some() {
                log::debug!("[master] {} unsubscribed from '{}'", node_id, topic);
            }
            if record.is_empty() {
                self.topics.remove(topic);
            }
        }
        Outcome::ack()
    }

    pub fn list_topics(&self) -> Vec<TopicSummary> {
        self.topics
            .iter()
            .map(|(name, t)| TopicSummary {
                topic: name.clone(),
                schema_id: t.schema_id.clone(),
                publisher: t
                    .publisher
                    .as_ref()
                    .and_then(|p| self.nodes.get(&p.node_id))
                    .map(|n| n.name.clone()),
                kind: t.publisher.as_ref().map(|p| p.channel.kind),
                endpoint: t.publisher.as_ref().map(|p| p.channel.endpoint.clone()),
                subscribers: t.subscribers.values().filter(|s| s.channel.is_some()).count(),
                pending_subscribers: t.subscribers.values().filter(|s| s.channel.is_none()).count(),
                subscriber_nodes: t
                    .subscribers
                    .keys()
                    .filter_map(|id| self.nodes.get(id))
                    .map(|n| n.name.clone())
                    .collect(),
            })
            .collect()
    }

    /// Negotiated channel of a topic, if a publisher is registered.
    pub fn topic_channel(&self, topic: &str) -> Option<&NegotiatedChannel> {
        self.topics
            .get(topic)
            .and_then(|t| t.publisher.as_ref())
            .map(|p| &p.channel)
    }

    /// Client owning the topic's publisher.
    pub fn topic_publisher_client(&self, topic: &str) -> Option<ClientId> {
        self.topics
            .get(topic)
            .and_then(|t| t.publisher.as_ref())
            .map(|p| p.client_id)
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    fn register_service_server(
        &mut self,
        node_id: NodeId,
        service: String,
        schema_id: String,
        descriptor: DescriptorWire,
        endpoints: Vec<ChannelEndpoint>,
    ) -> Outcome {
        if let Err(s) = self.node_client(node_id) {
            return Outcome::error(s);
        }
        if descriptor.kinds.streams().is_empty() {
            return Outcome::error(Status::invalid_argument(format!(
                "service '{}' needs a stream kind (tcp or uds), got {}",
                service, descriptor.kinds
            )));
        }
        let record = self.services.entry(service.clone()).or_default();
        if let Some(existing) = &record.server {
            return Outcome::error(Status::already_exists(format!(
                "Service '{}' is already served by {}",
                service, existing.node_id
            )));
        }

        let server = ServerRecord {
            node_id,
            descriptor,
            endpoints,
        };
        let mut notifications = Vec::new();
        for (client_node, client) in record.clients.iter_mut() {
            if client.schema_id != schema_id {
                log::warn!(
                    "[master] client {} of '{}' expects '{}', server offers '{}'",
                    client_node,
                    service,
                    client.schema_id,
                    schema_id
                );
                continue;
            }
            match ChannelNegotiator::negotiate_service(
                &server.descriptor,
                &server.endpoints,
                &client.descriptor,
            ) {
                Ok(channel) => {
                    client.connected = true;
                    notifications.push((
                        client.client_id,
                        Notification::ServiceAvailable {
                            node_id: *client_node,
                            service: service.clone(),
                            channel,
                        },
                    ));
                }
                Err(e) => {
                    log::warn!("[master] client {} of '{}' cannot connect: {}", client_node, service, e);
                }
            }
        }

        record.schema_id = schema_id;
        record.server = Some(server);
        log::info!("[master] service '{}' served by {}", service, node_id);
        Outcome {
            response: MasterResponse::Ack,
            notifications,
        }
    }

    fn unregister_service_server(&mut self, node_id: NodeId, service: &str) -> Outcome {
        let Some(record) = self.services.get_mut(service) else {
            return Outcome::ack();
        };
        if record.server.as_ref().map(|s| s.node_id) != Some(node_id) {
            return Outcome::ack();
        }
        record.server = None;

        let mut notifications = Vec::new();
        for (client_node, client) in record.clients.iter_mut() {
            if std::mem::take(&mut client.connected) {
                notifications.push((
                    client.client_id,
                    Notification::ServiceUnavailable {
                        node_id: *client_node,
                        service: service.to_string(),
                    },
                ));
            }
        }
        if record.clients.is_empty() {
            self.services.remove(service);
        }
        log::info!("[master] service '{}' withdrawn by {}", service, node_id);
        Outcome {
            response: MasterResponse::Ack,
            notifications,
        }
    }

    fn register_service_client(
        &mut self,
        node_id: NodeId,
        service: String,
        schema_id: String,
        descriptor: DescriptorWire,
    ) -> Outcome {
        let client_id = match self.node_client(node_id) {
            Ok(c) => c,
            Err(s) => return Outcome::error(s),
        };
        if descriptor.kinds.streams().is_empty() {
            return Outcome::error(Status::invalid_argument(format!(
                "service '{}' needs a stream kind (tcp or uds), got {}",
                service, descriptor.kinds
            )));
        }
        let record = self.services.entry(service.clone()).or_default();
        if record.clients.contains_key(&node_id) {
            return Outcome::error(Status::already_exists(format!(
                "{} is already a client of '{}'",
                node_id, service
            )));
        }

        let channel = match &record.server {
            Some(server) => {
                if record.schema_id != schema_id {
                    return Outcome::error(Status::schema_mismatch(format!(
                        "service '{}' serves '{}', client expects '{}'",
                        service, record.schema_id, schema_id
                    )));
                }
                match ChannelNegotiator::negotiate_service(
                    &server.descriptor,
                    &server.endpoints,
                    &descriptor,
                ) {
                    Ok(ch) => Some(ch),
                    Err(e) => return Outcome::error(e.into()),
                }
            }
            None => {
                if record.clients.is_empty() {
                    record.schema_id = schema_id.clone();
                }
                None
            }
        };

        record.clients.insert(
            node_id,
            ServiceClientRecord {
                client_id,
                schema_id,
                descriptor,
                connected: channel.is_some(),
            },
        );
        Outcome::reply(MasterResponse::ServiceClientRegistered { channel })
    }

    fn unregister_service_client(&mut self, node_id: NodeId, service: &str) -> Outcome {
        if let Some(record) = self.services.get_mut(service) {
            record.clients.remove(&node_id);
            if record.server.is_none() && record.clients.is_empty() {
                self.services.remove(service);
            }
        }
        Outcome::ack()
    }

    pub fn list_services(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|(name, s)| ServiceSummary {
                service: name.clone(),
                schema_id: s.schema_id.clone(),
                server: s
                    .server
                    .as_ref()
                    .and_then(|srv| self.nodes.get(&srv.node_id))
                    .map(|n| n.name.clone()),
                clients: s.clients.len(),
            })
            .collect()
    }
}

impl Default for MasterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
