//! graphql-transport-ws message encoding.
//!
//! Client: `connection_init`, `subscribe`, `complete`, `ping`, `pong`.
//! Server: `connection_ack`, `next`, `error`, `complete`, `ping`, `pong`.

use serde_json::{json, Map, Value};

use super::{ClientMessage, RawMessage, ResultWriter, ServerMessage};
use crate::error::Result;

pub fn parse(text: &str) -> ClientMessage {
    let (message_type, raw) = match RawMessage::decode(text) {
        Ok(decoded) => decoded,
        Err(malformed) => return malformed,
    };

    let converted = match message_type.as_str() {
        "connection_init" => Ok(ClientMessage::ConnectionInit { payload: raw.payload }),
        "ping" => Ok(ClientMessage::Ping { payload: raw.payload }),
        "pong" => Ok(ClientMessage::Pong { payload: raw.payload }),
        "subscribe" => raw.require_id(&message_type).and_then(|id| {
            raw.subscribe_payload(&message_type)
                .map(|payload| ClientMessage::Subscribe { id, payload })
        }),
        "complete" => raw.require_id(&message_type).map(|id| ClientMessage::Complete { id }),
        _ => Ok(ClientMessage::Unknown { message_type }),
    };
    converted.unwrap_or_else(|malformed| malformed)
}

pub fn render(message: &ServerMessage, writer: &dyn ResultWriter) -> Result<Option<String>> {
    let value = match message {
        ServerMessage::ConnectionAck => envelope("connection_ack", None, None),
        // No connection-level error message exists; the close frame carries the reason
        ServerMessage::ConnectionError { .. } => return Ok(None),
        ServerMessage::KeepAlive => envelope("ping", None, None),
        ServerMessage::Pong { payload } => envelope("pong", None, payload.clone()),
        ServerMessage::Next { id, result } => envelope("next", Some(id), Some(writer.write_result(result)?)),
        ServerMessage::Error { id, errors } => {
            envelope("error", id.as_deref(), Some(serde_json::to_value(errors)?))
        }
        ServerMessage::Complete { id } => envelope("complete", Some(id), None),
    };
    Ok(Some(serde_json::to_string(&value)?))
}

fn envelope(message_type: &str, id: Option<&str>, payload: Option<Value>) -> Value {
    let mut map = Map::new();
    if let Some(id) = id {
        map.insert("id".into(), json!(id));
    }
    map.insert("type".into(), json!(message_type));
    if let Some(payload) = payload {
        map.insert("payload".into(), payload);
    }
    Value::Object(map)
}
