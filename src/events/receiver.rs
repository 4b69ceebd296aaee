use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::SubscriptionEvent;

// Anything that can accept a published event. Returns how many targets were notified.
#[async_trait]
pub trait EventReceiver: Send + Sync {
    async fn receive_event(&self, event: Arc<SubscriptionEvent>) -> Result<usize>;
}

// Identity of a receiver, taken from the address of its shared allocation
pub(crate) fn receiver_key(receiver: &Arc<dyn EventReceiver>) -> usize {
    Arc::as_ptr(receiver) as *const () as usize
}

