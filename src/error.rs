use thiserror::Error;

// Errors raised by the event router, dispatch queue, subscription server and client proxies
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Dispatch queue is full ({0} items pending)")]
    QueueFull(usize),
    #[error("Dispatch queue is closed")]
    QueueClosed,
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Schema error: {0}")]
    Schema(String),
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;
