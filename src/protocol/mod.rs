// GraphQL-over-WebSocket message layer for the two supported sub-protocols
pub mod legacy;
pub mod transport;
pub mod writer;

pub use writer::{JsonResultWriter, ResultWriter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;
use crate::models::{ExecutionResult, GraphQLError};

// WebSocket sub-protocol negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubProtocol {
    GraphqlTransportWs, // graphql-transport-ws
    GraphqlWs,          // graphql-ws, the legacy subscriptions-transport-ws protocol
}

impl SubProtocol {
    pub const ALL: [SubProtocol; 2] = [SubProtocol::GraphqlTransportWs, SubProtocol::GraphqlWs];

    pub fn name(&self) -> &'static str {
        match self {
            SubProtocol::GraphqlTransportWs => "graphql-transport-ws",
            SubProtocol::GraphqlWs => "graphql-ws",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SubProtocol::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
    }

    // Picks a protocol from a `Sec-WebSocket-Protocol` header value, preferring
    // graphql-transport-ws when the client offers both
    pub fn negotiate(header: &str) -> Option<Self> {
        let offered: Vec<SubProtocol> = header.split(',').filter_map(SubProtocol::from_name).collect();
        SubProtocol::ALL.into_iter().find(|p| offered.contains(p))
    }

    // Decodes one client text frame
    pub fn parse_client_message(&self, text: &str) -> ClientMessage {
        match self {
            SubProtocol::GraphqlTransportWs => transport::parse(text),
            SubProtocol::GraphqlWs => legacy::parse(text),
        }
    }

    // Encodes a server message, or returns None when the protocol has no equivalent
    pub fn render(&self, message: &ServerMessage, writer: &dyn ResultWriter) -> Result<Option<String>> {
        match self {
            SubProtocol::GraphqlTransportWs => transport::render(message, writer),
            SubProtocol::GraphqlWs => legacy::render(message, writer),
        }
    }
}

impl SubProtocol {
    // Connection-level error in the form this protocol can express
    pub fn connection_error(&self, error: GraphQLError) -> ServerMessage {
        match self {
            SubProtocol::GraphqlTransportWs => ServerMessage::Error {
                id: None,
                errors: vec![error],
            },
            SubProtocol::GraphqlWs => ServerMessage::ConnectionError { error },
        }
    }
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Payload of a subscribe (or legacy start) message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl SubscribePayload {
    pub fn new(query: impl Into<String>) -> Self {
        SubscribePayload {
            query: query.into(),
            ..Default::default()
        }
    }
}

// Client-to-server messages after protocol-specific decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ConnectionInit { payload: Option<Value> },
    Subscribe { id: String, payload: SubscribePayload },
    Complete { id: String },
    Ping { payload: Option<Value> },
    Pong { payload: Option<Value> },
    Terminate,
    Unknown { message_type: String },
    Malformed { reason: String },
}

// Server-to-client messages, rendered per protocol
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionAck,
    ConnectionError { error: GraphQLError },
    KeepAlive,
    Pong { payload: Option<Value> },
    Next { id: String, result: ExecutionResult },
    Error { id: Option<String>, errors: Vec<GraphQLError> },
    Complete { id: String },
}

impl ServerMessage {
    pub fn error(id: Option<&str>, error: GraphQLError) -> Self {
        ServerMessage::Error {
            id: id.map(str::to_string),
            errors: vec![error],
        }
    }
}

// Status sent with a WebSocket close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        CloseStatus {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        CloseStatus::new(1000, "Normal Closure")
    }

    pub fn going_away() -> Self {
        CloseStatus::new(1001, "Server shutting down")
    }

    pub fn try_again_later() -> Self {
        CloseStatus::new(1013, "Too many connected clients")
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        CloseStatus::new(4400, reason)
    }

    pub fn unauthorized() -> Self {
        CloseStatus::new(4401, "Unauthorized")
    }

    pub fn forbidden() -> Self {
        CloseStatus::new(4403, "Forbidden")
    }

    pub fn init_timeout() -> Self {
        CloseStatus::new(4408, "Connection initialisation timeout")
    }

    pub fn subscriber_exists(id: &str) -> Self {
        CloseStatus::new(4409, format!("Subscriber for {} already exists", id))
    }

    pub fn too_many_init_requests() -> Self {
        CloseStatus::new(4429, "Too many initialisation requests")
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        CloseStatus::new(4500, reason)
    }

    // True for the 44xx/45xx range used for protocol violations
    pub fn is_protocol_error(&self) -> bool {
        (4400..4600).contains(&self.code)
    }
}

// Envelope shared by both protocols; decoded first so the payload is only
// converted once the message type is known
#[derive(Debug, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl RawMessage {
    pub(crate) fn decode(text: &str) -> std::result::Result<(String, RawMessage), ClientMessage> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| ClientMessage::Malformed {
            reason: format!("Invalid message received: {}", e),
        })?;
        match raw.message_type.clone() {
            Some(message_type) => Ok((message_type, raw)),
            None => Err(ClientMessage::Malformed {
                reason: "Message is missing the 'type' property".into(),
            }),
        }
    }

    pub(crate) fn require_id(&self, message_type: &str) -> std::result::Result<String, ClientMessage> {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(ClientMessage::Malformed {
                reason: format!("'{}' message is missing the 'id' property", message_type),
            }),
        }
    }

    pub(crate) fn subscribe_payload(self, message_type: &str) -> std::result::Result<SubscribePayload, ClientMessage> {
        let payload = self.payload.ok_or_else(|| ClientMessage::Malformed {
            reason: format!("'{}' message is missing the 'payload' property", message_type),
        })?;
        serde_json::from_value(payload).map_err(|e| ClientMessage::Malformed {
            reason: format!("Invalid '{}' payload: {}", message_type, e),
        })
    }
}
