use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;
use super::document::analyze_subscription;
use crate::error::Result;
use crate::metrics::ACTIVE_SUBS;
use crate::models::{GraphQLError, SubscriptionEvent};
use crate::protocol::{ClientMessage, CloseStatus, ResultWriter, ServerMessage, SubProtocol, SubscribePayload};
use crate::schema::{BoundSubscription, ResolveOutcome, SubscriptionRoute, SubscriptionSchema};
use crate::security::SecurityContext;

// Connection-level protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,   // Socket accepted, proxy not started
    AwaitingInit, // Waiting for connection_init
    Ready,        // Acknowledged, subscriptions allowed
    Closed,
}

// State of one subscription id on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed, // Receiving events
    Completing, // Final result being written, no further events
}

// Bookkeeping hooks the owning server provides to each client proxy.
// A client reports a route once when its first subscription on it appears and
// once when its last one goes away.
pub trait ClientLifecycle: Send + Sync {
    fn route_added(&self, client: &Arc<ClientProxy>, route: &SubscriptionRoute);
    fn route_removed(&self, client: &Arc<ClientProxy>, route: &SubscriptionRoute);
    fn client_closed(&self, client: &Arc<ClientProxy>);
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub require_authentication: bool,
    pub max_subscriptions: usize,
    pub keep_alive_interval: Option<Duration>,
    pub connection_init_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            require_authentication: false,
            max_subscriptions: 100,
            keep_alive_interval: Some(Duration::from_secs(30)),
            connection_init_timeout: Duration::from_secs(10),
        }
    }
}

struct ActiveSubscription {
    binding: Arc<BoundSubscription>,
    state: SubscriptionState,
}

// Server-side representative of one live connection. Runs the protocol state
// machine for incoming messages and writes results for delivered events.
//
// Writes to the connection go through `send_lock`, so frames are never
// interleaved even when many events are delivered at once.
pub struct ClientProxy {
    id: String,
    protocol: SubProtocol,
    connection: Arc<dyn ClientConnection>,
    schema: Arc<dyn SubscriptionSchema>,
    writer: Arc<dyn ResultWriter>,
    lifecycle: Weak<dyn ClientLifecycle>,
    options: ClientOptions,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    send_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    me: Weak<ClientProxy>,
}

impl ClientProxy {
    pub fn new(
        connection: Arc<dyn ClientConnection>,
        schema: Arc<dyn SubscriptionSchema>,
        writer: Arc<dyn ResultWriter>,
        lifecycle: Weak<dyn ClientLifecycle>,
        options: ClientOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ClientProxy {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: connection.protocol(),
            connection,
            schema,
            writer,
            lifecycle,
            options,
            state: Mutex::new(ConnectionState::Connecting),
            subscriptions: Mutex::new(HashMap::new()),
            send_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn security_context(&self) -> &SecurityContext {
        self.connection.security_context()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().contains_key(id)
    }

    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        self.subscriptions.lock().get(id).map(|s| s.state)
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // Moves the connection to AwaitingInit and arms the initialisation timeout
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                return;
            }
            *state = ConnectionState::AwaitingInit;
        }

        let client = self.me.clone();
        let cancel = self.cancel.clone();
        let timeout = self.options.connection_init_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(client) = client.upgrade() {
                        if client.state() == ConnectionState::AwaitingInit {
                            warn!("Client {} sent no connection_init within {:?}", client.id, timeout);
                            client.close(CloseStatus::init_timeout()).await;
                        }
                    }
                }
            }
        });
    }

    // Handles one text frame from the client. Frames must be fed in arrival order.
    pub async fn handle_text(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        match self.protocol.parse_client_message(text) {
            ClientMessage::ConnectionInit { .. } => self.handle_connection_init().await,
            ClientMessage::Subscribe { id, payload } => self.handle_subscribe(id, payload).await,
            ClientMessage::Complete { id } => self.handle_complete(&id).await,
            ClientMessage::Ping { payload } => self.send(&ServerMessage::Pong { payload }).await,
            ClientMessage::Pong { .. } => Ok(()),
            ClientMessage::Terminate => {
                self.close(CloseStatus::normal()).await;
                Ok(())
            }
            ClientMessage::Unknown { message_type } => {
                self.fail_connection(CloseStatus::bad_request(format!("Invalid message type '{}'", message_type)))
                    .await;
                Ok(())
            }
            ClientMessage::Malformed { reason } => {
                self.fail_connection(CloseStatus::bad_request(reason)).await;
                Ok(())
            }
        }
    }

    async fn handle_connection_init(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => {
                self.fail_connection(CloseStatus::too_many_init_requests()).await;
                return Ok(());
            }
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Connecting | ConnectionState::AwaitingInit => {}
        }

        if self.options.require_authentication && !self.security_context().is_authenticated() {
            self.fail_connection(CloseStatus::forbidden()).await;
            return Ok(());
        }

        *self.state.lock() = ConnectionState::Ready;
        self.send(&ServerMessage::ConnectionAck).await?;
        if self.protocol == SubProtocol::GraphqlWs {
            self.send(&ServerMessage::KeepAlive).await?;
        }
        self.start_keep_alive();
        info!("Client {} initialised over {}", self.id, self.protocol);
        Ok(())
    }

    async fn handle_subscribe(&self, id: String, payload: SubscribePayload) -> Result<()> {
        if self.state() != ConnectionState::Ready {
            self.fail_connection(CloseStatus::unauthorized()).await;
            return Ok(());
        }
        if self.has_subscription(&id) {
            self.fail_connection(CloseStatus::subscriber_exists(&id)).await;
            return Ok(());
        }
        if self.subscription_count() >= self.options.max_subscriptions {
            let error = GraphQLError::new(format!(
                "A connection may hold at most {} subscriptions",
                self.options.max_subscriptions
            ))
            .with_code("TOO_MANY_SUBSCRIPTIONS");
            return self.send(&ServerMessage::error(Some(&id), error)).await;
        }

        let target = match analyze_subscription(&payload) {
            Ok(target) => target,
            Err(error) => {
                debug!("Client {} sent an invalid subscription {}: {}", self.id, id, error.message);
                return self.send(&ServerMessage::error(Some(&id), error)).await;
            }
        };
        let Some(route) = self.schema.find_route_for_field(&target.field_name) else {
            let error = GraphQLError::new(format!(
                "No subscription field named '{}' exists on this schema",
                target.field_name
            ))
            .with_code("GRAPHQL_VALIDATION_FAILED");
            return self.send(&ServerMessage::error(Some(&id), error)).await;
        };

        let binding = Arc::new(BoundSubscription {
            id: id.clone(),
            route: route.clone(),
            response_key: target.response_key,
            request: payload,
        });
        {
            let mut subscriptions = self.subscriptions.lock();
            if self.is_closed() {
                return Ok(());
            }
            let first_on_route = !subscriptions.values().any(|s| s.binding.route == route);
            subscriptions.insert(
                id.clone(),
                ActiveSubscription {
                    binding,
                    state: SubscriptionState::Subscribed,
                },
            );
            ACTIVE_SUBS.inc();
            if first_on_route {
                self.notify_lifecycle(|lifecycle, me| lifecycle.route_added(me, &route));
            }
        }
        info!("Client {} subscription {} listening on {}", self.id, id, route);
        Ok(())
    }

    async fn handle_complete(&self, id: &str) -> Result<()> {
        if self.remove_subscription(id).is_none() {
            debug!("Client {} completed unknown subscription {}", self.id, id);
            return Ok(());
        }
        // The legacy protocol acknowledges stop with complete
        if self.protocol == SubProtocol::GraphqlWs {
            self.send(&ServerMessage::Complete { id: id.to_string() }).await?;
        }
        Ok(())
    }

    // Removes a subscription and tells the server when it was the last one on its route
    fn remove_subscription(&self, id: &str) -> Option<Arc<BoundSubscription>> {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            let removed = subscriptions.remove(id)?.binding;
            ACTIVE_SUBS.dec();
            if !subscriptions.values().any(|s| s.binding.route == removed.route) {
                self.notify_lifecycle(|lifecycle, me| lifecycle.route_removed(me, &removed.route));
            }
            removed
        };
        info!("Client {} subscription {} removed", self.id, id);
        Some(removed)
    }

    // Reports a bookkeeping change to the owning server. Callers hold the subscriptions
    // lock so the server sees route changes in the order they happen on this client.
    fn notify_lifecycle(&self, report: impl FnOnce(&dyn ClientLifecycle, &Arc<ClientProxy>)) {
        if let (Some(lifecycle), Some(me)) = (self.lifecycle.upgrade(), self.me.upgrade()) {
            report(lifecycle.as_ref(), &me);
        }
    }

    // Delivers one event to every subscription of this client on any of `routes`.
    // Returns the number of subscriptions that were sent something.
    pub async fn receive_event(&self, routes: &[SubscriptionRoute], event: Arc<SubscriptionEvent>) -> Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }

        let targets: Vec<Arc<BoundSubscription>> = self
            .subscriptions
            .lock()
            .values()
            .filter(|s| s.state == SubscriptionState::Subscribed && routes.contains(&s.binding.route))
            .map(|s| s.binding.clone())
            .collect();

        let mut sent = 0;
        for binding in targets {
            let delivered = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(sent),
                delivered = self.deliver(&binding, &event) => delivered?,
            };
            if delivered {
                sent += 1;
            }
        }
        Ok(sent)
    }

    async fn deliver(&self, binding: &BoundSubscription, event: &SubscriptionEvent) -> Result<bool> {
        match self.schema.resolve(binding, event).await? {
            ResolveOutcome::Next(result) => {
                self.send(&ServerMessage::Next {
                    id: binding.id.clone(),
                    result,
                })
                .await?;
                Ok(true)
            }
            ResolveOutcome::Skip => Ok(false),
            ResolveOutcome::Complete(last) => {
                if let Some(subscription) = self.subscriptions.lock().get_mut(&binding.id) {
                    subscription.state = SubscriptionState::Completing;
                }
                let written = match last {
                    Some(result) => {
                        self.send(&ServerMessage::Next {
                            id: binding.id.clone(),
                            result,
                        })
                        .await
                    }
                    None => Ok(()),
                };
                self.remove_subscription(&binding.id);
                written?;
                self.send(&ServerMessage::Complete { id: binding.id.clone() }).await?;
                Ok(true)
            }
        }
    }

    // Renders and writes one message; writes on a connection are serialized
    async fn send(&self, message: &ServerMessage) -> Result<()> {
        let Some(text) = self.protocol.render(message, self.writer.as_ref())? else {
            return Ok(());
        };
        let _writer = self.send_lock.lock().await;
        self.connection.send_message(text).await
    }

    // Reports a connection-level violation to the client, then closes the socket
    async fn fail_connection(&self, status: CloseStatus) {
        warn!("Closing client {}: {} {}", self.id, status.code, status.reason);
        let code = if status.code == 4403 { "FORBIDDEN" } else { "PROTOCOL_ERROR" };
        let error = GraphQLError::new(status.reason.clone()).with_code(code);
        if let Err(e) = self.send(&self.protocol.connection_error(error)).await {
            debug!("Client {} did not receive its error message: {}", self.id, e);
        }
        self.close(status).await;
    }

    fn start_keep_alive(&self) {
        let Some(period) = self.options.keep_alive_interval else {
            return;
        };
        let client = self.me.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(client) = client.upgrade() else { break };
                        if let Err(e) = client.send(&ServerMessage::KeepAlive).await {
                            debug!("Keep-alive to client {} failed: {}", client.id, e);
                            break;
                        }
                    }
                }
            }
        });
    }

    // Ends the session and closes the socket with `status`. Safe to call repeatedly.
    pub async fn close(&self, status: CloseStatus) {
        if !self.release() {
            return;
        }
        if let Err(e) = self.connection.close(status.clone()).await {
            debug!("Client {} close frame not sent: {}", self.id, e);
        }
        info!("Client {} closed ({} {})", self.id, status.code, status.reason);
    }

    // Ends the session after the socket is already gone. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.release() {
            info!("Client {} disconnected", self.id);
        }
    }

    // Cancels in-flight work and removes all bookkeeping. Only the first call does anything.
    fn release(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        *self.state.lock() = ConnectionState::Closed;

        let mut subscriptions = self.subscriptions.lock();
        ACTIVE_SUBS.sub(subscriptions.len() as f64);
        let routes: HashSet<SubscriptionRoute> = subscriptions.drain().map(|(_, s)| s.binding.route.clone()).collect();
        self.notify_lifecycle(|lifecycle, me| {
            for route in &routes {
                lifecycle.route_removed(me, route);
            }
            lifecycle.client_closed(me);
        });
        true
    }
}
