use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::SubscriptionError;
use crate::models::SubscriptionEvent;
use crate::state::AppState;

// Raises an event for subscribers. Delivery happens in the background.
#[actix_web::post("/events")]
pub async fn publish_event(
    event: web::Json<SubscriptionEvent>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let event = event.into_inner();
    let id = event.id.clone();
    let queued = state.router.raise_published_event(event).map_err(|e| match e {
        SubscriptionError::InvalidEvent(_) => actix_web::error::ErrorBadRequest(e),
        other => actix_web::error::ErrorServiceUnavailable(other),
    })?;

    Ok(HttpResponse::Accepted().json(json!({ "id": id, "receivers": queued })))
}

// Reports connection and dispatch queue counters
#[actix_web::get("/stats")]
pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let queue = state.queue.stats();
    let listening: Vec<String> = state
        .server
        .listening_names()
        .iter()
        .map(ToString::to_string)
        .collect();

    HttpResponse::Ok().json(json!({
        "connectedClients": state.server.client_count(),
        "listening": listening,
        "queue": {
            "depth": queue.depth,
            "enqueued": queue.enqueued,
            "delivered": queue.delivered,
            "failed": queue.failed,
            "dropped": queue.dropped,
            "alert": state.queue.current_alert().map(|a| a.count),
        },
    }))
}
