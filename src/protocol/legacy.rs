//! graphql-ws (subscriptions-transport-ws) message encoding, kept for older clients.
//!
//! Client: `connection_init`, `start`, `stop`, `connection_terminate`.
//! Server: `connection_ack`, `connection_error`, `ka`, `data`, `error`, `complete`.

use serde_json::{json, Map, Value};

use super::{ClientMessage, RawMessage, ResultWriter, ServerMessage};
use crate::error::Result;
use crate::models::GraphQLError;

pub fn parse(text: &str) -> ClientMessage {
    let (message_type, raw) = match RawMessage::decode(text) {
        Ok(decoded) => decoded,
        Err(malformed) => return malformed,
    };

    let converted = match message_type.as_str() {
        "connection_init" => Ok(ClientMessage::ConnectionInit { payload: raw.payload }),
        "connection_terminate" => Ok(ClientMessage::Terminate),
        "start" => raw.require_id(&message_type).and_then(|id| {
            raw.subscribe_payload(&message_type)
                .map(|payload| ClientMessage::Subscribe { id, payload })
        }),
        "stop" => raw.require_id(&message_type).map(|id| ClientMessage::Complete { id }),
        _ => Ok(ClientMessage::Unknown { message_type }),
    };
    converted.unwrap_or_else(|malformed| malformed)
}

pub fn render(message: &ServerMessage, writer: &dyn ResultWriter) -> Result<Option<String>> {
    let value = match message {
        ServerMessage::ConnectionAck => envelope("connection_ack", None, None),
        ServerMessage::ConnectionError { error } => {
            envelope("connection_error", None, Some(serde_json::to_value(error)?))
        }
        ServerMessage::KeepAlive => envelope("ka", None, None),
        // The legacy protocol has no ping/pong exchange
        ServerMessage::Pong { .. } => return Ok(None),
        ServerMessage::Next { id, result } => envelope("data", Some(id), Some(writer.write_result(result)?)),
        ServerMessage::Error { id: Some(id), errors } => envelope("error", Some(id), Some(error_payload(errors)?)),
        ServerMessage::Error { id: None, errors } => {
            envelope("connection_error", None, Some(error_payload(errors)?))
        }
        ServerMessage::Complete { id } => envelope("complete", Some(id), None),
    };
    Ok(Some(serde_json::to_string(&value)?))
}

fn error_payload(errors: &[GraphQLError]) -> Result<Value> {
    Ok(match errors {
        [single] => serde_json::to_value(single)?,
        many => serde_json::to_value(many)?,
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionResult;
    use crate::protocol::JsonResultWriter;

    #[test]
    fn maps_start_and_stop() {
        assert!(matches!(
            parse(r#"{"type":"start","id":"a","payload":{"query":"subscription { x }"}}"#),
            ClientMessage::Subscribe { ref id, .. } if id == "a"
        ));
        assert_eq!(
            parse(r#"{"type":"stop","id":"a"}"#),
            ClientMessage::Complete { id: "a".into() }
        );
        assert_eq!(parse(r#"{"type":"connection_terminate"}"#), ClientMessage::Terminate);
        assert_eq!(
            parse(r#"{"type":"subscribe","id":"a"}"#),
            ClientMessage::Unknown { message_type: "subscribe".into() }
        );
    }

    #[test]
    fn renders_data_and_keep_alive() {
        let writer = JsonResultWriter::default();
        let data = render(
            &ServerMessage::Next {
                id: "a".into(),
                result: ExecutionResult::data(json!({"x": 1})),
            },
            &writer,
        )
        .unwrap()
        .unwrap();
        let data: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(data, json!({"id": "a", "type": "data", "payload": {"data": {"x": 1}}}));

        let ka = render(&ServerMessage::KeepAlive, &writer).unwrap().unwrap();
        assert_eq!(ka, r#"{"type":"ka"}"#);
        assert!(render(&ServerMessage::Pong { payload: None }, &writer).unwrap().is_none());
    }
}
