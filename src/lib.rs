pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod rest;
pub mod schema;
pub mod security;
pub mod server;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{Result, SubscriptionError};
pub use events::{DispatchQueue, DispatchQueueConfig, EventReceiver, EventRouter};
pub use models::{ExecutionResult, GraphQLError, SubscriptionEvent, SubscriptionEventName};
pub use protocol::{CloseStatus, SubProtocol};
pub use schema::{StaticSchema, SubscriptionRoute, SubscriptionSchema};
pub use security::SecurityContext;
pub use server::{ClientConnection, ClientProxy, ServerOptions, SubscriptionServer};
pub use state::AppState;
