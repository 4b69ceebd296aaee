use actix_web::HttpResponse;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

// Defines Prometheus metrics for monitoring event routing and delivery
lazy_static::lazy_static! {
    // Counter for events raised through the event router
    pub static ref EVENTS_PUBLISHED: Counter = register_counter!(
        "subbus_events_published_total",
        "Total events raised through the event router"
    ).unwrap();

    // Counter for client notifications that completed successfully
    pub static ref EVENTS_DELIVERED: Counter = register_counter!(
        "subbus_events_delivered_total",
        "Total client notifications delivered"
    ).unwrap();

    // Counter for failed deliveries, either in the queue or during client fan-out
    pub static ref DELIVERY_FAILURES: Counter = register_counter!(
        "subbus_delivery_failures_total",
        "Total failed event deliveries"
    ).unwrap();

    // Gauge for items waiting in the dispatch queue
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "subbus_dispatch_queue_depth",
        "Number of deliveries waiting in the dispatch queue"
    ).unwrap();

    // Counter for items the dispatch queue refused or discarded
    pub static ref QUEUE_DROPPED: Counter = register_counter!(
        "subbus_dispatch_queue_dropped_total",
        "Total deliveries dropped by the dispatch queue"
    ).unwrap();

    // Gauge for connected WebSocket clients
    pub static ref CONNECTED_CLIENTS: Gauge = register_gauge!(
        "subbus_connected_clients",
        "Number of connected subscription clients"
    ).unwrap();

    // Gauge for active subscription ids across all clients
    pub static ref ACTIVE_SUBS: Gauge = register_gauge!(
        "subbus_active_subscriptions",
        "Number of active client subscriptions"
    ).unwrap();

    // Histogram for the time a subscription server spends fanning out one event
    pub static ref FANOUT_TIME: Histogram = register_histogram!(
        "subbus_fanout_seconds",
        "Time spent delivering one event to all subscribed clients"
    ).unwrap();
}

// Handles GET /metrics requests to expose Prometheus metrics
pub async fn metrics() -> HttpResponse {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let encoded = encoder.encode_to_string(&metric_families).unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(encoded)
}
