// Per-schema subscription server and the per-connection client proxies it owns
pub mod client;
pub mod connection;
pub mod document;
pub mod subscription_server;

pub use client::{ClientLifecycle, ClientOptions, ClientProxy, ConnectionState, SubscriptionState};
pub use connection::ClientConnection;
pub use document::{analyze_subscription, SubscriptionTarget};
pub use subscription_server::{ServerOptions, SubscriptionServer};
