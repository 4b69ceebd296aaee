// actix-web binding: accepts WebSocket upgrades and bridges sockets to client proxies
pub mod actor;
pub mod route;

pub use actor::{ActorConnection, Outbound, Subscriber};
pub use route::ws_route;
