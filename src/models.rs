use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

// Routing key used by the event router and every subscription server.
// Both parts compare without regard to ASCII case.
#[derive(Debug, Clone, Eq)]
pub struct SubscriptionEventName {
    schema_type: String, // Name of the schema type that owns the event
    event_name: String,  // Event name declared on a subscription field or raised by a publisher
}

impl SubscriptionEventName {
    pub fn new(schema_type: impl Into<String>, event_name: impl Into<String>) -> Self {
        SubscriptionEventName {
            schema_type: schema_type.into(),
            event_name: event_name.into(),
        }
    }

    pub fn schema_type(&self) -> &str {
        &self.schema_type
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

impl PartialEq for SubscriptionEventName {
    fn eq(&self, other: &Self) -> bool {
        self.schema_type.eq_ignore_ascii_case(&other.schema_type)
            && self.event_name.eq_ignore_ascii_case(&other.event_name)
    }
}

impl Hash for SubscriptionEventName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must agree with the case-insensitive equality above
        for b in self.schema_type.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
        for b in self.event_name.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for SubscriptionEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.schema_type, self.event_name)
    }
}

// A published occurrence, raised once through the event router and never mutated afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    #[serde(default = "new_event_id")]
    pub id: String, // Publisher-supplied or generated event id
    pub schema_type_name: String, // Schema the event belongs to
    pub event_name: String, // Event name matched against subscription fields
    #[serde(default)]
    pub data_type_name: Option<String>, // Optional type name of the payload
    #[serde(default)]
    pub data: Value, // Opaque payload handed to the resolver
    #[serde(default)]
    pub complete: bool, // Signals subscribers that this is the final event
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl SubscriptionEvent {
    pub fn new(schema_type_name: impl Into<String>, event_name: impl Into<String>, data: Value) -> Self {
        SubscriptionEvent {
            id: new_event_id(),
            schema_type_name: schema_type_name.into(),
            event_name: event_name.into(),
            data_type_name: None,
            data,
            complete: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_data_type(mut self, data_type_name: impl Into<String>) -> Self {
        self.data_type_name = Some(data_type_name.into());
        self
    }

    // Marks the event as the last one for every subscription it reaches
    pub fn completing(mut self) -> Self {
        self.complete = true;
        self
    }

    // Derives the routing key for this event
    pub fn to_event_name(&self) -> SubscriptionEventName {
        SubscriptionEventName::new(self.schema_type_name.clone(), self.event_name.clone())
    }
}

// A single GraphQL error as written to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            extensions: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.extensions = Some(serde_json::json!({ "code": code }));
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

// Result of executing a subscription field for one event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl ExecutionResult {
    pub fn data(data: Value) -> Self {
        ExecutionResult {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn error(error: GraphQLError) -> Self {
        ExecutionResult {
            data: None,
            errors: vec![error],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn event_names_compare_without_case() {
        let a = SubscriptionEventName::new("Schema", "shipUpdated");
        let b = SubscriptionEventName::new("schema", "SHIPUPDATED");
        assert_eq!(a, b);

        let mut names = HashSet::new();
        names.insert(a);
        assert!(names.contains(&b));
        assert!(!names.contains(&SubscriptionEventName::new("schema", "shipDeleted")));
    }

    #[test]
    fn schema_type_is_part_of_the_key() {
        let a = SubscriptionEventName::new("A", "updated");
        let b = SubscriptionEventName::new("B", "updated");
        assert_ne!(a, b);
    }

    #[test]
    fn event_deserializes_with_defaults() {
        let event: SubscriptionEvent = serde_json::from_str(
            r#"{"schemaTypeName":"S","eventName":"shipUpdated","data":{"name":"Rocinante"}}"#,
        )
        .unwrap();
        assert!(!event.id.is_empty());
        assert!(!event.complete);
        assert_eq!(event.to_event_name(), SubscriptionEventName::new("s", "shipupdated"));
    }
}
