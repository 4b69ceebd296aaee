use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, SubscriptionError};
use crate::models::{ExecutionResult, SubscriptionEvent, SubscriptionEventName};
use crate::protocol::SubscribePayload;

// A schema field designated as a subscription entry point
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRoute {
    field_name: String,
}

impl SubscriptionRoute {
    pub fn new(field_name: impl Into<String>) -> Self {
        SubscriptionRoute {
            field_name: field_name.into(),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn path(&self) -> String {
        format!("[subscription]/{}", self.field_name)
    }
}

impl fmt::Display for SubscriptionRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// One client subscription as the schema sees it when resolving an event
#[derive(Debug, Clone)]
pub struct BoundSubscription {
    pub id: String,           // Client-chosen subscription id
    pub route: SubscriptionRoute, // Root field the subscription listens on
    pub response_key: String, // Alias or field name used in the result
    pub request: SubscribePayload, // Query, variables and operation name sent by the client
}

// What to do with one event for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Next(ExecutionResult),             // Send the result
    Skip,                              // Nothing to send for this subscription
    Complete(Option<ExecutionResult>), // Optionally send a last result, then end the subscription
}

// Field routing and execution, supplied by whatever builds the GraphQL schema
#[async_trait]
pub trait SubscriptionSchema: Send + Sync {
    // Name events must carry to reach this schema
    fn schema_type_name(&self) -> &str;

    // Subscription root field with the given name
    fn find_route_for_field(&self, field_name: &str) -> Option<SubscriptionRoute>;

    // Event names a route listens to
    fn event_names_for_route(&self, route: &SubscriptionRoute) -> Vec<SubscriptionEventName>;

    // Every route that listens to events with the given name
    fn find_routes_for_event_name(&self, name: &SubscriptionEventName) -> Vec<SubscriptionRoute>;

    // Executes the subscription field for one event
    async fn resolve(&self, subscription: &BoundSubscription, event: &SubscriptionEvent) -> Result<ResolveOutcome>;
}

// Schema defined by a fixed table of subscription fields and the events they listen to.
//
// The resolver places the event payload under the subscription's response key.
// A `filter` object in the subscription variables restricts delivery to events whose
// payload carries the same values for the listed keys.
#[derive(Debug, Clone)]
pub struct StaticSchema {
    schema_type: String,
    routes: Vec<(String, Vec<String>)>,
}

impl StaticSchema {
    pub fn new(schema_type: impl Into<String>) -> Self {
        StaticSchema {
            schema_type: schema_type.into(),
            routes: Vec::new(),
        }
    }

    // Adds a subscription field. A field with no event names listens to its own name.
    pub fn with_route(mut self, field_name: &str, event_names: &[&str]) -> Self {
        let events = if event_names.is_empty() {
            vec![field_name.to_string()]
        } else {
            event_names.iter().map(|e| e.to_string()).collect()
        };
        self.routes.retain(|(f, _)| f != field_name);
        self.routes.push((field_name.to_string(), events));
        self
    }

    // Builds a schema from `field=event1|event2;field2` definitions
    pub fn from_definition(schema_type: &str, definition: &str) -> Result<Self> {
        let mut schema = StaticSchema::new(schema_type);
        for entry in definition.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (field, events) = match entry.split_once('=') {
                Some((field, events)) => (field.trim(), events.split('|').map(str::trim).collect::<Vec<_>>()),
                None => (entry, Vec::new()),
            };
            if field.is_empty() || events.iter().any(|e| e.is_empty()) {
                return Err(SubscriptionError::Schema(format!(
                    "invalid subscription field definition '{}'",
                    entry
                )));
            }
            schema = schema.with_route(field, &events);
        }
        Ok(schema)
    }

    pub fn routes(&self) -> impl Iterator<Item = SubscriptionRoute> + '_ {
        self.routes.iter().map(|(field, _)| SubscriptionRoute::new(field.clone()))
    }
}

#[async_trait]
impl SubscriptionSchema for StaticSchema {
    fn schema_type_name(&self) -> &str {
        &self.schema_type
    }

    fn find_route_for_field(&self, field_name: &str) -> Option<SubscriptionRoute> {
        self.routes
            .iter()
            .find(|(field, _)| field == field_name)
            .map(|(field, _)| SubscriptionRoute::new(field.clone()))
    }

    fn event_names_for_route(&self, route: &SubscriptionRoute) -> Vec<SubscriptionEventName> {
        self.routes
            .iter()
            .filter(|(field, _)| field == route.field_name())
            .flat_map(|(_, events)| events.iter())
            .map(|event| SubscriptionEventName::new(self.schema_type.clone(), event.clone()))
            .collect()
    }

    fn find_routes_for_event_name(&self, name: &SubscriptionEventName) -> Vec<SubscriptionRoute> {
        if !name.schema_type().eq_ignore_ascii_case(&self.schema_type) {
            return Vec::new();
        }
        self.routes
            .iter()
            .filter(|(_, events)| events.iter().any(|e| e.eq_ignore_ascii_case(name.event_name())))
            .map(|(field, _)| SubscriptionRoute::new(field.clone()))
            .collect()
    }

    async fn resolve(&self, subscription: &BoundSubscription, event: &SubscriptionEvent) -> Result<ResolveOutcome> {
        if !matches_filter(subscription.request.variables.as_ref(), &event.data) {
            return Ok(if event.complete {
                ResolveOutcome::Complete(None)
            } else {
                ResolveOutcome::Skip
            });
        }

        let mut data = Map::new();
        data.insert(subscription.response_key.clone(), event.data.clone());
        let result = ExecutionResult::data(Value::Object(data));
        Ok(if event.complete {
            ResolveOutcome::Complete(Some(result))
        } else {
            ResolveOutcome::Next(result)
        })
    }
}

// Shallow match of `variables.filter` against the event payload
fn matches_filter(variables: Option<&Value>, data: &Value) -> bool {
    let Some(Value::Object(filter)) = variables.and_then(|v| v.get("filter")) else {
        return true;
    };
    filter.iter().all(|(key, expected)| data.get(key) == Some(expected))
}
