use actix_web::{web, App, HttpServer};
use log::info;
use std::io;

use subbus::metrics::metrics;
use subbus::rest::{publish_event, stats};
use subbus::websocket::ws_route;
use subbus::{AppState, Config};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let state = AppState::new(&config).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    info!(
        "Subscription endpoint at ws://{}{} (authenticated only: {})",
        config.bind_addr, config.route, config.authenticated_requests_only
    );

    let data = web::Data::new(state.clone());
    let route = config.route.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route(&route, web::get().to(ws_route))
            .service(publish_event)
            .service(stats)
            .route("/metrics", web::get().to(metrics))
    })
    .bind(&config.bind_addr)?
    .run()
    .await;

    info!("HTTP server stopped, closing subscription clients");
    state.shutdown().await;
    result
}
