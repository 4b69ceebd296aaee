use dashmap::DashMap;
use log::{debug, warn};
use std::sync::{Arc, Weak};

use super::queue::DispatchQueue;
use super::receiver::{receiver_key, EventReceiver};
use crate::error::{Result, SubscriptionError};
use crate::metrics::EVENTS_PUBLISHED;
use crate::models::{SubscriptionEvent, SubscriptionEventName};

// Registration held by the router. The router never keeps a receiver alive.
struct Registration {
    key: usize,
    receiver: Weak<dyn EventReceiver>,
}

// Process-wide registry of which receivers care about which event names.
// Raised events are handed to the dispatch queue, never delivered inline.
pub struct EventRouter {
    receivers: DashMap<SubscriptionEventName, Vec<Registration>>,
    queue: Arc<DispatchQueue>,
}

impl EventRouter {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        EventRouter {
            receivers: DashMap::new(),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    // Registers `receiver` for `name`; registering the same pair again has no effect
    pub fn add_receiver(&self, receiver: &Arc<dyn EventReceiver>, name: SubscriptionEventName) {
        let key = receiver_key(receiver);
        let mut bucket = self.receivers.entry(name).or_default();
        bucket.retain(|r| r.receiver.strong_count() > 0);
        if bucket.iter().any(|r| r.key == key) {
            return;
        }
        debug!("Receiver registered for event {}", bucket.key());
        bucket.push(Registration {
            key,
            receiver: Arc::downgrade(receiver),
        });
    }

    // Removes one registration, or every registration of `receiver` when no name is given.
    // Unknown receivers and names are ignored.
    pub fn remove_receiver(&self, receiver: &Arc<dyn EventReceiver>, name: Option<&SubscriptionEventName>) {
        let key = receiver_key(receiver);
        match name {
            Some(name) => {
                if let Some(mut bucket) = self.receivers.get_mut(name) {
                    bucket.retain(|r| r.key != key && r.receiver.strong_count() > 0);
                }
                self.receivers.remove_if(name, |_, bucket| bucket.is_empty());
            }
            None => {
                self.receivers.retain(|_, bucket| {
                    bucket.retain(|r| r.key != key && r.receiver.strong_count() > 0);
                    !bucket.is_empty()
                });
            }
        }
    }

    // Enqueues one delivery per receiver registered for the event's name and
    // returns how many were enqueued. A name nobody listens to is not an error.
    pub fn raise_published_event(&self, event: SubscriptionEvent) -> Result<usize> {
        if event.schema_type_name.trim().is_empty() || event.event_name.trim().is_empty() {
            return Err(SubscriptionError::InvalidEvent(
                "events must carry a schema type name and an event name".into(),
            ));
        }

        EVENTS_PUBLISHED.inc();
        let name = event.to_event_name();
        let targets: Vec<Arc<dyn EventReceiver>> = match self.receivers.get(&name) {
            Some(bucket) => bucket.iter().filter_map(|r| r.receiver.upgrade()).collect(),
            None => Vec::new(),
        };
        if targets.is_empty() {
            debug!("No receivers for event {}", name);
            return Ok(0);
        }

        let event = Arc::new(event);
        let mut enqueued = 0;
        for receiver in targets {
            match self.queue.enqueue_event(receiver, event.clone(), false) {
                Ok(()) => enqueued += 1,
                Err(SubscriptionError::QueueFull(depth)) => {
                    warn!("Event {} not queued for one receiver: {} deliveries pending", name, depth);
                }
                Err(e) => return Err(e),
            }
        }
        debug!("Event {} ({}) queued for {} receiver(s)", event.id, name, enqueued);
        Ok(enqueued)
    }

    // Live receivers registered for `name`
    pub fn receiver_count(&self, name: &SubscriptionEventName) -> usize {
        self.receivers
            .get(name)
            .map(|bucket| bucket.iter().filter(|r| r.receiver.strong_count() > 0).count())
            .unwrap_or(0)
    }

    // Names with at least one registration
    pub fn registered_names(&self) -> Vec<SubscriptionEventName> {
        self.receivers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }
}
