use actix_web::http::header::{HeaderMap, SEC_WEBSOCKET_PROTOCOL};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::debug;
use std::sync::Arc;

use super::actor::{ActorConnection, Subscriber};
use crate::protocol::SubProtocol;
use crate::security::SecurityContext;
use crate::state::AppState;

// Header set by the authenticating reverse proxy in front of this service
const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

// Handles GET on the subscription route: negotiates the sub-protocol, registers the
// client with the subscription server and starts the socket actor
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(protocol) = SubProtocol::negotiate(offered) else {
        return Ok(HttpResponse::BadRequest().body(format!(
            "Unsupported WebSocket sub-protocol '{}', expected one of: {}, {}",
            offered,
            SubProtocol::GraphqlTransportWs,
            SubProtocol::GraphqlWs
        )));
    };

    let (connection, outbound) = ActorConnection::new(protocol, security_context(req.headers()));
    // A refused connection still gets its error and close frame through the actor
    let client = match state.server.register_new_client(Arc::new(connection)).await {
        Ok(client) => Some(client),
        Err(e) => {
            debug!("Connection refused: {}", e);
            None
        }
    };

    ws::WsResponseBuilder::new(Subscriber::new(client, outbound), &req, stream)
        .protocols(&[protocol.name()])
        .start()
}

pub fn security_context(headers: &HeaderMap) -> SecurityContext {
    headers
        .get(FORWARDED_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(SecurityContext::authenticated)
        .unwrap_or_default()
}
