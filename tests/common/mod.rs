#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use subbus::events::{DispatchQueue, DispatchQueueConfig, EventReceiver, EventRouter};
use subbus::protocol::JsonResultWriter;
use subbus::server::{ClientConnection, ClientProxy, ServerOptions, SubscriptionServer};
use subbus::{CloseStatus, Result, SecurityContext, StaticSchema, SubProtocol, SubscriptionError, SubscriptionEvent};

// Counts sends in progress across any number of connections
#[derive(Default)]
pub struct SendTracker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SendTracker {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }
}

// In-memory connection that records what the server writes
pub struct FakeConnection {
    protocol: SubProtocol,
    security: SecurityContext,
    sent: Mutex<Vec<String>>,
    closes: Mutex<Vec<CloseStatus>>,
    fail_sends: AtomicBool,
    slow_sends: Option<(Arc<SendTracker>, Duration)>,
}

impl FakeConnection {
    pub fn new(protocol: SubProtocol, security: SecurityContext) -> Arc<Self> {
        Arc::new(FakeConnection {
            protocol,
            security,
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            slow_sends: None,
        })
    }

    // Connection whose sends take `delay` and are counted by `tracker`
    pub fn slow(tracker: Arc<SendTracker>, delay: Duration) -> Arc<Self> {
        Arc::new(FakeConnection {
            protocol: SubProtocol::GraphqlTransportWs,
            security: SecurityContext::anonymous(),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            slow_sends: Some((tracker, delay)),
        })
    }

    pub fn transport() -> Arc<Self> {
        FakeConnection::new(SubProtocol::GraphqlTransportWs, SecurityContext::anonymous())
    }

    pub fn legacy() -> Arc<Self> {
        FakeConnection::new(SubProtocol::GraphqlWs, SecurityContext::anonymous())
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).expect("server wrote invalid JSON"))
            .collect()
    }

    pub fn messages_of_type(&self, message_type: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == message_type)
            .collect()
    }

    pub fn closes(&self) -> Vec<CloseStatus> {
        self.closes.lock().clone()
    }
}

#[async_trait]
impl ClientConnection for FakeConnection {
    fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    fn security_context(&self) -> &SecurityContext {
        &self.security
    }

    async fn send_message(&self, text: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Send("socket reset".into()));
        }
        if let Some((tracker, delay)) = &self.slow_sends {
            let now = tracker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(*delay).await;
            tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        self.closes.lock().push(status);
        Ok(())
    }
}

// Receiver that records the ids of the events it is handed
#[derive(Default)]
pub struct RecordingReceiver {
    pub events: Mutex<Vec<String>>,
}

#[async_trait]
impl EventReceiver for RecordingReceiver {
    async fn receive_event(&self, event: Arc<SubscriptionEvent>) -> Result<usize> {
        self.events.lock().push(event.id.clone());
        Ok(1)
    }
}

pub struct Harness {
    pub queue: Arc<DispatchQueue>,
    pub router: Arc<EventRouter>,
    pub server: Arc<SubscriptionServer>,
}

impl Harness {
    pub fn new(options: ServerOptions) -> Self {
        let schema = StaticSchema::new("S")
            .with_route("shipUpdated", &["shipUpdated"])
            .with_route("fleetChanged", &["shipAdded", "shipRemoved"]);
        Harness::with_schema(schema, options)
    }

    pub fn with_schema(schema: StaticSchema, options: ServerOptions) -> Self {
        let queue = DispatchQueue::new(DispatchQueueConfig::default());
        let router = Arc::new(EventRouter::new(queue.clone()));
        let server = SubscriptionServer::new(
            Arc::new(schema),
            router.clone(),
            Arc::new(JsonResultWriter::default()),
            options,
        );
        Harness { queue, router, server }
    }

    pub fn standard() -> Self {
        Harness::new(ServerOptions::default())
    }

    // Registers a connection and completes connection_init
    pub async fn connect(&self, connection: &Arc<FakeConnection>) -> Arc<ClientProxy> {
        let client = self
            .server
            .register_new_client(connection.clone())
            .await
            .expect("client registration failed");
        client.handle_text(r#"{"type":"connection_init"}"#).await.unwrap();
        client
    }

    // Publishes an event and waits until the queue has delivered it
    pub async fn publish(&self, event: SubscriptionEvent) -> usize {
        let queued = self.router.raise_published_event(event).unwrap();
        self.queue.wait_idle().await;
        queued
    }
}

pub fn subscribe(id: &str, query: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "subscribe",
        "payload": { "query": query },
    })
    .to_string()
}

pub fn complete(id: &str) -> String {
    serde_json::json!({ "id": id, "type": "complete" }).to_string()
}
