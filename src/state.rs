use log::info;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::events::{DispatchQueue, EventRouter};
use crate::protocol::JsonResultWriter;
use crate::schema::StaticSchema;
use crate::server::{ServerOptions, SubscriptionServer};

// Application state shared across the WebSocket and REST handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<DispatchQueue>, // Background delivery queue
    pub router: Arc<EventRouter>, // Entry point for published events
    pub server: Arc<SubscriptionServer>, // Subscription server for the configured schema
}

impl AppState {
    // Wires the queue, router and subscription server together. Must run inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let schema = StaticSchema::from_definition(&config.schema_type, &config.subscription_fields)?;
        info!(
            "Schema {} exposes subscription fields: {}",
            config.schema_type,
            schema.routes().map(|r| r.field_name().to_string()).collect::<Vec<_>>().join(", ")
        );

        let queue = DispatchQueue::new(config.dispatch_queue.clone());
        let router = Arc::new(EventRouter::new(queue.clone()));
        let server = SubscriptionServer::new(
            Arc::new(schema),
            router.clone(),
            Arc::new(JsonResultWriter::default()),
            ServerOptions::from(config),
        );

        Ok(AppState { queue, router, server })
    }

    // Closes all clients, then lets the queue finish what it already accepted
    pub async fn shutdown(&self) {
        self.server.shutdown().await;
        self.queue.shutdown(true).await;
    }
}
