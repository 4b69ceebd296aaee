use std::env;
use std::time::Duration;

use crate::error::{Result, SubscriptionError};
use crate::events::{DispatchQueueConfig, QueueAlertThreshold};

// Configuration for the subscription service
#[derive(Debug, Clone)]
pub struct Config {
    pub route: String, // Path the WebSocket endpoint listens on
    pub bind_addr: String, // Address for the HTTP server
    pub authenticated_requests_only: bool, // Reject connections without an authenticated user
    pub max_concurrent_client_notifications: usize, // Simultaneous outbound sends per subscription server
    pub max_connected_clients: Option<usize>, // Connection limit, None for unlimited
    pub max_subscriptions_per_connection: usize, // Active subscription ids allowed on one connection
    pub keep_alive_interval: Option<Duration>, // Server keep-alive period, None disables it
    pub connection_init_timeout: Duration, // Time a client has to send connection_init
    pub schema_type: String, // Schema type name events must carry
    pub subscription_fields: String, // Static routes as `field=event1|event2;field2=event3`
    pub dispatch_queue: DispatchQueueConfig, // Dispatch queue sizing and alerting
}

impl Default for Config {
    fn default() -> Self {
        Config {
            route: "/graphql".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            authenticated_requests_only: false,
            max_concurrent_client_notifications: 50,
            max_connected_clients: None,
            max_subscriptions_per_connection: 100,
            keep_alive_interval: Some(Duration::from_secs(30)),
            connection_init_timeout: Duration::from_secs(10),
            schema_type: "Schema".to_string(),
            subscription_fields: String::new(),
            dispatch_queue: DispatchQueueConfig::default(),
        }
    }
}

impl Config {
    // Loads configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let route = env::var("SUBSCRIPTION_ROUTE").unwrap_or(defaults.route);
        if !route.starts_with('/') {
            return Err(SubscriptionError::Config(format!(
                "SUBSCRIPTION_ROUTE must start with '/': {}",
                route
            )));
        }

        let keep_alive_secs: u64 = parse_var("KEEP_ALIVE_INTERVAL_SECS", 30)?;
        let max_connected: usize = parse_var("MAX_CONNECTED_CLIENTS", 0)?;

        let mut dispatch_queue = defaults.dispatch_queue;
        dispatch_queue.capacity = parse_var("DISPATCH_QUEUE_CAPACITY", dispatch_queue.capacity)?;
        dispatch_queue.workers = parse_var("DISPATCH_QUEUE_WORKERS", dispatch_queue.workers)?;
        if let Ok(alerts) = env::var("DISPATCH_QUEUE_ALERTS") {
            dispatch_queue.alert_thresholds = parse_alert_thresholds(&alerts)?;
        }

        let config = Config {
            route,
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            authenticated_requests_only: parse_var("AUTHENTICATED_REQUESTS_ONLY", false)?,
            max_concurrent_client_notifications: parse_var(
                "MAX_CONCURRENT_CLIENT_NOTIFICATIONS",
                defaults.max_concurrent_client_notifications,
            )?,
            max_connected_clients: (max_connected > 0).then_some(max_connected),
            max_subscriptions_per_connection: parse_var(
                "MAX_SUBSCRIPTIONS_PER_CONNECTION",
                defaults.max_subscriptions_per_connection,
            )?,
            keep_alive_interval: (keep_alive_secs > 0).then(|| Duration::from_secs(keep_alive_secs)),
            connection_init_timeout: Duration::from_secs(parse_var("CONNECTION_INIT_TIMEOUT_SECS", 10)?),
            schema_type: env::var("SCHEMA_TYPE").unwrap_or(defaults.schema_type),
            subscription_fields: env::var("SUBSCRIPTION_FIELDS").unwrap_or_default(),
            dispatch_queue,
        };

        if config.max_concurrent_client_notifications == 0 {
            return Err(SubscriptionError::Config(
                "MAX_CONCURRENT_CLIENT_NOTIFICATIONS must be at least 1".into(),
            ));
        }

        Ok(config)
    }
}

// Reads and parses an optional environment variable
fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SubscriptionError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

// Parses `count:severity` pairs such as `1000:warn,5000:error`
pub fn parse_alert_thresholds(raw: &str) -> Result<Vec<QueueAlertThreshold>> {
    let mut thresholds = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (count, level) = pair
            .split_once(':')
            .ok_or_else(|| SubscriptionError::Config(format!("alert threshold '{}' is not count:severity", pair)))?;
        let count = count
            .trim()
            .parse()
            .map_err(|_| SubscriptionError::Config(format!("alert threshold count '{}' is not a number", count)))?;
        let level = level
            .trim()
            .parse::<log::Level>()
            .map_err(|_| SubscriptionError::Config(format!("unknown alert severity '{}'", level)))?;
        thresholds.push(QueueAlertThreshold { count, level });
    }
    thresholds.sort_by_key(|t| t.count);
    Ok(thresholds)
}
