use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::client::{ClientLifecycle, ClientOptions, ClientProxy};
use super::connection::ClientConnection;
use crate::config::Config;
use crate::error::{Result, SubscriptionError};
use crate::events::{EventReceiver, EventRouter};
use crate::metrics::{CONNECTED_CLIENTS, EVENTS_DELIVERED, FANOUT_TIME};
use crate::models::{GraphQLError, SubscriptionEvent, SubscriptionEventName};
use crate::protocol::{CloseStatus, ResultWriter};
use crate::schema::{SubscriptionRoute, SubscriptionSchema};

// Options for one subscription server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub route: String, // Path clients connect to
    pub authenticated_requests_only: bool, // Refuse connections without an authenticated user
    pub max_concurrent_client_notifications: usize, // Simultaneous client deliveries for this server
    pub max_connected_clients: Option<usize>, // Connection limit, None for unlimited
    pub max_subscriptions_per_connection: usize, // Subscription ids per connection
    pub keep_alive_interval: Option<Duration>, // Keep-alive period, None disables it
    pub connection_init_timeout: Duration, // Deadline for connection_init
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions::from(&Config::default())
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        ServerOptions {
            route: config.route.clone(),
            authenticated_requests_only: config.authenticated_requests_only,
            max_concurrent_client_notifications: config.max_concurrent_client_notifications.max(1),
            max_connected_clients: config.max_connected_clients,
            max_subscriptions_per_connection: config.max_subscriptions_per_connection,
            keep_alive_interval: config.keep_alive_interval,
            connection_init_timeout: config.connection_init_timeout,
        }
    }
}

impl ServerOptions {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            require_authentication: self.authenticated_requests_only,
            max_subscriptions: self.max_subscriptions_per_connection,
            keep_alive_interval: self.keep_alive_interval,
            connection_init_timeout: self.connection_init_timeout,
        }
    }
}

// A client listening to one event name, with the routes it listens through
struct Listener {
    client: Arc<ClientProxy>,
    routes: HashSet<SubscriptionRoute>,
}

// Owns the connected clients of one schema and fans published events out to them.
//
// The server is registered with the event router for an event name exactly while
// at least one client has a subscription whose route listens to that name.
pub struct SubscriptionServer {
    schema: Arc<dyn SubscriptionSchema>,
    router: Arc<EventRouter>,
    writer: Arc<dyn ResultWriter>,
    options: ServerOptions,
    clients: DashMap<String, Arc<ClientProxy>>,
    clients_by_name: Mutex<HashMap<SubscriptionEventName, HashMap<String, Listener>>>,
    notifications: Arc<Semaphore>,
    disposed: AtomicBool,
    me: Weak<SubscriptionServer>,
}

impl SubscriptionServer {
    pub fn new(
        schema: Arc<dyn SubscriptionSchema>,
        router: Arc<EventRouter>,
        writer: Arc<dyn ResultWriter>,
        options: ServerOptions,
    ) -> Arc<Self> {
        let permits = options.max_concurrent_client_notifications.max(1);
        Arc::new_cyclic(|me| SubscriptionServer {
            schema,
            router,
            writer,
            options,
            clients: DashMap::new(),
            clients_by_name: Mutex::new(HashMap::new()),
            notifications: Arc::new(Semaphore::new(permits)),
            disposed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn schema(&self) -> &Arc<dyn SubscriptionSchema> {
        &self.schema
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, id: &str) -> Option<Arc<ClientProxy>> {
        self.clients.get(id).map(|c| c.value().clone())
    }

    // Clients currently registered under an event name
    pub fn subscribed_client_count(&self, name: &SubscriptionEventName) -> usize {
        self.clients_by_name.lock().get(name).map_or(0, HashMap::len)
    }

    // Event names this server is currently listening for
    pub fn listening_names(&self) -> Vec<SubscriptionEventName> {
        self.clients_by_name.lock().keys().cloned().collect()
    }

    // Accepts a new connection. When the connection is refused an error message and a
    // close frame are sent on it and no client is returned.
    pub async fn register_new_client(&self, connection: Arc<dyn ClientConnection>) -> Result<Arc<ClientProxy>> {
        if self.is_disposed() {
            self.reject(
                connection.as_ref(),
                GraphQLError::new("The subscription server is shutting down").with_code("SERVER_SHUTDOWN"),
                CloseStatus::going_away(),
            )
            .await;
            return Err(SubscriptionError::Connection("subscription server is disposed".into()));
        }

        if self.options.authenticated_requests_only && !connection.security_context().is_authenticated() {
            warn!("Refusing unauthenticated connection on {}", self.options.route);
            self.reject(
                connection.as_ref(),
                GraphQLError::new("Unauthorized. Subscriptions on this route require an authenticated user.")
                    .with_code("UNAUTHENTICATED"),
                CloseStatus::forbidden(),
            )
            .await;
            return Err(SubscriptionError::Unauthorized(
                "connection has no authenticated user".into(),
            ));
        }

        if let Some(max) = self.options.max_connected_clients {
            if self.clients.len() >= max {
                warn!("Refusing connection on {}: {} clients connected", self.options.route, max);
                self.reject(
                    connection.as_ref(),
                    GraphQLError::new("Too many connected clients, try again later").with_code("SERVER_BUSY"),
                    CloseStatus::try_again_later(),
                )
                .await;
                return Err(SubscriptionError::Connection("too many connected clients".into()));
            }
        }

        let lifecycle: Weak<dyn ClientLifecycle> = self.me.clone();
        let client = ClientProxy::new(
            connection,
            self.schema.clone(),
            self.writer.clone(),
            lifecycle,
            self.options.client_options(),
        );
        self.clients.insert(client.id().to_string(), client.clone());
        CONNECTED_CLIENTS.inc();
        client.start();

        info!(
            "Client {} connected to {} using {}",
            client.id(),
            self.options.route,
            client.protocol()
        );
        Ok(client)
    }

    async fn reject(&self, connection: &dyn ClientConnection, error: GraphQLError, status: CloseStatus) {
        let protocol = connection.protocol();
        match protocol.render(&protocol.connection_error(error), self.writer.as_ref()) {
            Ok(Some(text)) => {
                if let Err(e) = connection.send_message(text).await {
                    debug!("Refused connection did not receive its error message: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not render connection error: {}", e),
        }
        if let Err(e) = connection.close(status).await {
            debug!("Refused connection could not be closed cleanly: {}", e);
        }
    }

    fn as_receiver(&self) -> Option<Arc<dyn EventReceiver>> {
        self.me.upgrade().map(|server| server as Arc<dyn EventReceiver>)
    }

    // Closes every connected client, then disposes the server
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ClientProxy>> = self.clients.iter().map(|c| c.value().clone()).collect();
        for client in clients {
            client.close(CloseStatus::going_away()).await;
        }
        self.dispose();
    }

    // Stops listening for events and releases the notification semaphore. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let names: Vec<SubscriptionEventName> = self.clients_by_name.lock().drain().map(|(name, _)| name).collect();
        if let Some(me) = self.as_receiver() {
            self.router.remove_receiver(&me, None);
        }
        self.notifications.close();
        info!(
            "Subscription server for {} disposed ({} event names released)",
            self.options.route,
            names.len()
        );
    }
}

impl Drop for SubscriptionServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ClientLifecycle for SubscriptionServer {
    fn route_added(&self, client: &Arc<ClientProxy>, route: &SubscriptionRoute) {
        if self.is_disposed() {
            return;
        }
        let Some(me) = self.as_receiver() else {
            return;
        };

        let mut buckets = self.clients_by_name.lock();
        for name in self.schema.event_names_for_route(route) {
            let bucket = buckets.entry(name.clone()).or_default();
            let first = bucket.is_empty();
            bucket
                .entry(client.id().to_string())
                .or_insert_with(|| Listener {
                    client: client.clone(),
                    routes: HashSet::new(),
                })
                .routes
                .insert(route.clone());
            if first {
                self.router.add_receiver(&me, name.clone());
                debug!("Listening for {} on {}", name, self.options.route);
            }
        }
    }

    fn route_removed(&self, client: &Arc<ClientProxy>, route: &SubscriptionRoute) {
        let me = self.as_receiver();

        let mut buckets = self.clients_by_name.lock();
        for name in self.schema.event_names_for_route(route) {
            let Some(bucket) = buckets.get_mut(&name) else {
                continue;
            };
            // The client stays in the bucket while another of its routes listens to the name
            let left = match bucket.get_mut(client.id()) {
                Some(listener) => {
                    listener.routes.remove(route);
                    listener.routes.is_empty()
                }
                None => false,
            };
            if left {
                bucket.remove(client.id());
            }
            if bucket.is_empty() {
                buckets.remove(&name);
                if let Some(me) = &me {
                    self.router.remove_receiver(me, Some(&name));
                }
                debug!("Stopped listening for {} on {}", name, self.options.route);
            }
        }
    }

    fn client_closed(&self, client: &Arc<ClientProxy>) {
        let me = self.as_receiver();
        {
            let mut buckets = self.clients_by_name.lock();
            let mut emptied = Vec::new();
            buckets.retain(|name, bucket| {
                bucket.remove(client.id());
                if bucket.is_empty() {
                    emptied.push(name.clone());
                    false
                } else {
                    true
                }
            });
            if let Some(me) = &me {
                for name in &emptied {
                    self.router.remove_receiver(me, Some(name));
                }
            }
        }

        if self.clients.remove(client.id()).is_some() {
            CONNECTED_CLIENTS.dec();
            info!("Client {} left {}", client.id(), self.options.route);
        }
    }
}

#[async_trait]
impl EventReceiver for SubscriptionServer {
    // Delivers the event to every client listening for its name through any of the
    // routes the name feeds, at most `max_concurrent_client_notifications` at a time.
    // A failed delivery does not stop the others; the first failure is returned once
    // all of them have finished.
    async fn receive_event(&self, event: Arc<SubscriptionEvent>) -> Result<usize> {
        if self.is_disposed() {
            return Ok(0);
        }

        let name = event.to_event_name();
        let routes = self.schema.find_routes_for_event_name(&name);
        if routes.is_empty() {
            debug!("No subscription route for event {}", name);
            return Ok(0);
        }

        let targets: Vec<(Arc<ClientProxy>, Vec<SubscriptionRoute>)> = self
            .clients_by_name
            .lock()
            .get(&name)
            .map(|bucket| {
                bucket
                    .values()
                    .map(|listener| {
                        let matched: Vec<SubscriptionRoute> =
                            listener.routes.iter().filter(|r| routes.contains(r)).cloned().collect();
                        (listener.client.clone(), matched)
                    })
                    .filter(|(_, matched)| !matched.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if targets.is_empty() {
            return Ok(0);
        }

        let timer = FANOUT_TIME.start_timer();
        let deliveries: Vec<_> = targets
            .into_iter()
            .map(|(client, routes)| {
                let permits = self.notifications.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| SubscriptionError::Delivery("subscription server is disposed".into()))?;
                    client.receive_event(&routes, event).await.map_err(|e| {
                        error!("Delivery to client {} failed: {}", client.id(), e);
                        e
                    })
                })
            })
            .collect();

        let mut notified = 0;
        let mut failure = None;
        for outcome in futures::future::join_all(deliveries).await {
            match outcome {
                Ok(Ok(sent)) if sent > 0 => notified += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!("Delivery task for event {} ended abnormally: {}", event.id, e);
                    failure.get_or_insert(SubscriptionError::Delivery(e.to_string()));
                }
            }
        }
        timer.observe_duration();
        EVENTS_DELIVERED.inc_by(notified as f64);

        match failure {
            Some(e) => Err(e),
            None => {
                debug!("Event {} ({}) notified {} client(s)", event.id, name, notified);
                Ok(notified)
            }
        }
    }
}
