// Event routing: the process-wide router and the queue that decouples publishing from delivery
pub mod queue;
pub mod receiver;
pub mod router;

pub use queue::{DispatchQueue, DispatchQueueConfig, QueueAlertThreshold, QueueStats};
pub use receiver::EventReceiver;
pub use router::EventRouter;
