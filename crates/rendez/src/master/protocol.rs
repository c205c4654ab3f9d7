// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master wire protocol.
//!
//! Length-prefixed JSON, shared by nodes and the Master server.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```
//!
//! Nodes send [`ClientFrame`]s (a request plus a correlation id). The Master
//! answers with [`ServerFrame::Response`] carrying the same id, and pushes
//! unsolicited [`ServerFrame::Notification`]s when topic or service state
//! changes for one of the client's nodes.

use crate::channel::{ChannelEndpoint, ChannelKind, DescriptorWire, NegotiatedChannel};
use crate::node::{ClientId, NodeId, NodeIdentity, NodeInfo};
use crate::status::Status;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Correlation id of a request on one Master connection.
pub type RequestId = u64;

/// Requests a node process can send to the Master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterRequest {
    /// First message on a connection; allocates a [`ClientId`].
    RegisterClient,

    /// Keeps the client lease alive.
    Heartbeat { client_id: ClientId },

    /// Register a node. An empty name asks the Master to pick one.
    RegisterNode { client_id: ClientId, name: String },

    UnregisterNode { client_id: ClientId, node_id: NodeId },

    ListNodes,

    ListTopics,

    ListServices,

    PublishTopic {
        node_id: NodeId,
        topic: String,
        schema_id: String,
        descriptor: DescriptorWire,
        endpoints: Vec<ChannelEndpoint>,
    },

    UnpublishTopic { node_id: NodeId, topic: String },

    SubscribeTopic {
        node_id: NodeId,
        topic: String,
        schema_id: String,
        descriptor: DescriptorWire,
    },

    UnsubscribeTopic { node_id: NodeId, topic: String },

    RegisterServiceServer {
        node_id: NodeId,
        service: String,
        schema_id: String,
        descriptor: DescriptorWire,
        endpoints: Vec<ChannelEndpoint>,
    },

    UnregisterServiceServer { node_id: NodeId, service: String },

    RegisterServiceClient {
        node_id: NodeId,
        service: String,
        schema_id: String,
        descriptor: DescriptorWire,
    },

    UnregisterServiceClient { node_id: NodeId, service: String },
}

impl MasterRequest {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterClient => "register_client",
            Self::Heartbeat { .. } => "heartbeat",
            Self::RegisterNode { .. } => "register_node",
            Self::UnregisterNode { .. } => "unregister_node",
            Self::ListNodes => "list_nodes",
            Self::ListTopics => "list_topics",
            Self::ListServices => "list_services",
            Self::PublishTopic { .. } => "publish_topic",
            Self::UnpublishTopic { .. } => "unpublish_topic",
            Self::SubscribeTopic { .. } => "subscribe_topic",
            Self::UnsubscribeTopic { .. } => "unsubscribe_topic",
            Self::RegisterServiceServer { .. } => "register_service_server",
            Self::UnregisterServiceServer { .. } => "unregister_service_server",
            Self::RegisterServiceClient { .. } => "register_service_client",
            Self::UnregisterServiceClient { .. } => "unregister_service_client",
        }
    }
}

/// Replies from the Master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterResponse {
    /// Request succeeded and carries no payload.
    Ack,

    /// Request failed.
    Error { status: Status },

    ClientRegistered { client_id: ClientId },

    NodeRegistered { identity: NodeIdentity },

    TopicPublished { channel: NegotiatedChannel },

    /// `channel` is `None` while no publisher is negotiated yet.
    TopicSubscribed { channel: Option<NegotiatedChannel> },

    /// `channel` is `None` while no server is registered yet.
    ServiceClientRegistered { channel: Option<NegotiatedChannel> },

    Nodes { nodes: Vec<NodeInfo> },

    Topics { topics: Vec<TopicSummary> },

    Services { services: Vec<ServiceSummary> },
}

impl MasterResponse {
    pub fn error(status: Status) -> Self {
        Self::Error { status }
    }

    /// Status carried by this response (`Ok` unless it is an `Error`).
    pub fn status(&self) -> Status {
        match self {
            Self::Error { status } => status.clone(),
            _ => Status::ok_status(),
        }
    }
}

/// Unsolicited state changes pushed to the client owning `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A publisher negotiated a channel for a subscriber that was waiting.
    TopicNegotiated {
        node_id: NodeId,
        topic: String,
        channel: NegotiatedChannel,
    },

    /// Negotiation failed for a subscriber that was waiting.
    TopicFailed {
        node_id: NodeId,
        topic: String,
        status: Status,
    },

    /// The publisher went away; the subscriber is waiting again.
    TopicClosed { node_id: NodeId, topic: String },

    ServiceAvailable {
        node_id: NodeId,
        service: String,
        channel: NegotiatedChannel,
    },

    ServiceUnavailable { node_id: NodeId, service: String },
}

impl Notification {
    /// Node the notification is addressed to.
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::TopicNegotiated { node_id, .. }
            | Self::TopicFailed { node_id, .. }
            | Self::TopicClosed { node_id, .. }
            | Self::ServiceAvailable { node_id, .. }
            | Self::ServiceUnavailable { node_id, .. } => *node_id,
        }
    }
}

/// Topic snapshot for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic: String,
    pub schema_id: String,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub kind: Option<ChannelKind>,
    #[serde(default)]
    pub endpoint: Option<ChannelEndpoint>,
    pub subscribers: usize,
    pub pending_subscribers: usize,
    /// Names of every subscribing node, attached or pending.
    #[serde(default)]
    pub subscriber_nodes: Vec<String>,
}

/// Service snapshot for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service: String,
    pub schema_id: String,
    #[serde(default)]
    pub server: Option<String>,
    pub clients: usize,
}

/// Node to Master frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: RequestId,
    pub request: MasterRequest,
}

/// Master to node frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        id: RequestId,
        response: MasterResponse,
    },
    Notification {
        notification: Notification,
    },
}

/// Protocol error types.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    EmptyMessage,
    MessageTooLarge { len: usize, max: usize },
    InvalidMessage(String),
    IoError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "Empty message"),
            Self::MessageTooLarge { len, max } => {
                write!(f, "Message too large: {} > {}", len, max)
            }
            Self::InvalidMessage(s) => write!(f, "Invalid message: {}", s),
            Self::IoError(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<ProtocolError> for Status {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(_) => Status::unavailable(e.to_string()),
            _ => Status::internal(e.to_string()),
        }
    }
}

/// Serialize `msg` into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T, max_message_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)
        .map_err(|e| ProtocolError::InvalidMessage(format!("Serialize error: {}", e)))?;
    if json.len() > max_message_size {
        return Err(ProtocolError::MessageTooLarge {
            len: json.len(),
            max: max_message_size,
        });
    }
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Validate a length prefix.
pub fn check_frame_len(len: usize, max_message_size: usize) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    if len > max_message_size {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: max_message_size,
        });
    }
    Ok(())
}

/// Parse a JSON frame body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidMessage(format!("Invalid JSON: {}", e)))
}

/// Write one frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    msg: &T,
    max_message_size: usize,
) -> Result<(), ProtocolError> {
    let frame = encode_frame(msg, max_message_size)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking stream.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly.
pub fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<Option<T>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len, max_message_size)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_body(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKinds;
    use std::io::Cursor;

    #[test]
    fn test_request_serialize() {
        let frame = ClientFrame {
            id: 3,
            request: MasterRequest::SubscribeTopic {
                node_id: NodeId(4),
                topic: "chatter".into(),
                schema_id: "std.String".into(),
                descriptor: DescriptorWire::new(ChannelKinds::TCP | ChannelKinds::SHM, 1024, false),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("subscribe_topic"));
        assert!(json.contains("chatter"));

        let parsed: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(parsed.request.name(), "subscribe_topic");
    }

    #[test]
    fn test_unit_request_serialize() {
        let json = serde_json::to_string(&MasterRequest::RegisterClient).unwrap();
        assert_eq!(json, r#"{"type":"register_client"}"#);
    }

    #[test]
    fn test_frame_stream() {
        let frame = ServerFrame::Notification {
            notification: Notification::TopicClosed {
                node_id: NodeId(1),
                topic: "chatter".into(),
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame, 1024).unwrap();
        assert_eq!(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        let parsed: Option<ServerFrame> = read_frame(&mut cursor, 1024).unwrap();
        match parsed {
            Some(ServerFrame::Notification { notification }) => {
                assert_eq!(notification.node_id(), NodeId(1));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        let eof: Option<ServerFrame> = read_frame(&mut cursor, 1024).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = ServerFrame::Response {
            id: 1,
            response: MasterResponse::error(Status::internal("x".repeat(200))),
        };
        assert!(matches!(
            encode_frame(&frame, 64),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
        assert!(matches!(check_frame_len(0, 64), Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn test_response_status() {
        assert!(MasterResponse::Ack.status().ok());
        let r = MasterResponse::error(Status::already_exists("taken"));
        assert_eq!(r.status().error_message(), "taken");
    }
}
