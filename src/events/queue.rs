use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::receiver::{receiver_key, EventReceiver};
use crate::error::{Result, SubscriptionError};
use crate::metrics::{DELIVERY_FAILURES, QUEUE_DEPTH, QUEUE_DROPPED};
use crate::models::SubscriptionEvent;

// Queue depth at which an alert is logged with the given severity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAlertThreshold {
    pub count: usize,
    pub level: log::Level,
}

// Sizing and alerting for the dispatch queue
#[derive(Debug, Clone)]
pub struct DispatchQueueConfig {
    pub capacity: usize, // Pending deliveries accepted before non-exclusive items are refused
    pub workers: usize, // Delivery lanes processed concurrently
    pub alert_thresholds: Vec<QueueAlertThreshold>, // Depth alerts, lowest first
}

impl Default for DispatchQueueConfig {
    fn default() -> Self {
        DispatchQueueConfig {
            capacity: 10_000,
            workers: 4,
            alert_thresholds: vec![
                QueueAlertThreshold { count: 1_000, level: log::Level::Warn },
                QueueAlertThreshold { count: 5_000, level: log::Level::Error },
            ],
        }
    }
}

// Point-in-time counters for the dispatch queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

struct WorkItem {
    key: usize,
    receiver: Arc<dyn EventReceiver>,
    event: Arc<SubscriptionEvent>,
}

// Lane a receiver is pinned to while it has undelivered items
struct LanePin {
    lane: usize,
    pending: usize,
}

// Which receivers are pinned where, and how many items each lane holds
struct LaneAssignments {
    pins: HashMap<usize, LanePin>,
    load: Vec<usize>,
}

impl LaneAssignments {
    fn new(lanes: usize) -> Self {
        LaneAssignments {
            pins: HashMap::new(),
            load: vec![0; lanes],
        }
    }

    // Keeps a receiver on its current lane while it has pending items, otherwise
    // pins it to the least loaded lane
    fn acquire(&mut self, key: usize) -> usize {
        let load = &self.load;
        let pin = self.pins.entry(key).or_insert_with(|| LanePin {
            lane: load
                .iter()
                .enumerate()
                .min_by_key(|(_, pending)| **pending)
                .map_or(0, |(lane, _)| lane),
            pending: 0,
        });
        pin.pending += 1;
        self.load[pin.lane] += 1;
        pin.lane
    }

    fn release(&mut self, key: usize) {
        let Some(pin) = self.pins.get_mut(&key) else {
            return;
        };
        pin.pending -= 1;
        self.load[pin.lane] -= 1;
        if pin.pending == 0 {
            self.pins.remove(&key);
        }
    }
}

struct QueueState {
    depth: AtomicUsize,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    discard: AtomicBool, // Set when shutting down without draining
    thresholds: Vec<QueueAlertThreshold>,
    alert: Mutex<Option<usize>>, // Index of the highest threshold currently exceeded
    assignments: Mutex<LaneAssignments>,
    idle: Notify,
}

// Bounded asynchronous buffer between the event router and the receivers.
//
// A receiver with pending items stays pinned to one lane, and each lane delivers its
// items one at a time, so events enqueued for the same receiver arrive in the order
// they were enqueued. An idle receiver is pinned to the least loaded lane on its next
// item. Different lanes run concurrently.
pub struct DispatchQueue {
    config: DispatchQueueConfig,
    lanes: RwLock<Option<Vec<mpsc::UnboundedSender<WorkItem>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<QueueState>,
}

impl DispatchQueue {
    // Creates the queue and spawns its lanes on the current tokio runtime
    pub fn new(config: DispatchQueueConfig) -> Arc<Self> {
        let worker_count = config.workers.max(1);
        let mut thresholds = config.alert_thresholds.clone();
        thresholds.sort_by_key(|t| t.count);

        let state = Arc::new(QueueState {
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            discard: AtomicBool::new(false),
            thresholds,
            alert: Mutex::new(None),
            assignments: Mutex::new(LaneAssignments::new(worker_count)),
            idle: Notify::new(),
        });

        let mut lanes = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for lane in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes.push(tx);
            workers.push(tokio::spawn(run_lane(lane, rx, state.clone())));
        }

        info!(
            "Dispatch queue started with {} lanes (capacity {})",
            worker_count, config.capacity
        );

        Arc::new(DispatchQueue {
            config,
            lanes: RwLock::new(Some(lanes)),
            workers: Mutex::new(workers),
            state,
        })
    }

    // Accepts one delivery without waiting for it. Exclusive items are admitted even
    // when the queue is at capacity; others are refused with `QueueFull`.
    pub fn enqueue_event(
        &self,
        receiver: Arc<dyn EventReceiver>,
        event: Arc<SubscriptionEvent>,
        exclusive: bool,
    ) -> Result<()> {
        let lanes = self.lanes.read();
        let lanes = lanes.as_ref().ok_or(SubscriptionError::QueueClosed)?;

        let capacity = self.config.capacity;
        let reserved = self
            .state
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (exclusive || depth < capacity).then_some(depth + 1)
            });
        let depth = match reserved {
            Ok(previous) => previous + 1,
            Err(depth) => {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                QUEUE_DROPPED.inc();
                warn!(
                    "Dispatch queue full ({} pending), dropping event {} ({})",
                    depth, event.id, event.event_name
                );
                return Err(SubscriptionError::QueueFull(depth));
            }
        };

        let key = receiver_key(&receiver);
        let lane = self.state.assignments.lock().acquire(key);
        if lanes[lane].send(WorkItem { key, receiver, event }).is_err() {
            self.state.finish_item(key);
            return Err(SubscriptionError::QueueClosed);
        }

        self.state.enqueued.fetch_add(1, Ordering::Relaxed);
        QUEUE_DEPTH.set(depth as f64);
        self.state.raise_alert(depth);
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn alert_thresholds(&self) -> &[QueueAlertThreshold] {
        &self.state.thresholds
    }

    // The highest alert threshold the current depth is at or above
    pub fn current_alert(&self) -> Option<QueueAlertThreshold> {
        let current = *self.state.alert.lock();
        current.map(|idx| self.state.thresholds[idx].clone())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            enqueued: self.state.enqueued.load(Ordering::Relaxed),
            delivered: self.state.delivered.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            dropped: self.state.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.read().is_none()
    }

    // Resolves once every accepted item has been delivered or discarded
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.depth() == 0 {
                return;
            }
            notified.await;
        }
    }

    // Stops accepting items and waits for the lanes to finish. With `drain` the
    // remaining items are still delivered, otherwise they are discarded.
    pub async fn shutdown(&self, drain: bool) {
        self.state.discard.store(!drain, Ordering::Release);
        let Some(lanes) = self.lanes.write().take() else {
            return;
        };
        drop(lanes);

        let workers = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("Dispatch lane ended abnormally: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "Dispatch queue stopped: {} delivered, {} failed, {} dropped",
            stats.delivered, stats.failed, stats.dropped
        );
    }
}

impl QueueState {
    async fn deliver(&self, receiver: Arc<dyn EventReceiver>, event: Arc<SubscriptionEvent>) {
        match AssertUnwindSafe(receiver.receive_event(event.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(notified)) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Event {} ({}) delivered to {} target(s)",
                    event.id, event.event_name, notified
                );
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                DELIVERY_FAILURES.inc();
                error!("Delivery of event {} ({}) failed: {}", event.id, event.event_name, e);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                DELIVERY_FAILURES.inc();
                error!("Receiver panicked while handling event {} ({})", event.id, event.event_name);
            }
        }
    }

    fn finish_item(&self, key: usize) {
        self.assignments.lock().release(key);
        let remaining = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        QUEUE_DEPTH.set(remaining as f64);
        self.clear_alert(remaining);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }

    fn raise_alert(&self, depth: usize) {
        let Some(idx) = self.thresholds.iter().rposition(|t| depth >= t.count) else {
            return;
        };
        let mut current = self.alert.lock();
        if current.map_or(true, |c| idx > c) {
            *current = Some(idx);
            let threshold = &self.thresholds[idx];
            log::log!(
                threshold.level,
                "Dispatch queue depth {} reached alert threshold {}",
                depth,
                threshold.count
            );
        }
    }

    fn clear_alert(&self, depth: usize) {
        if self.thresholds.is_empty() {
            return;
        }
        let mut current = self.alert.lock();
        if let Some(idx) = *current {
            if depth < self.thresholds[idx].count {
                *current = self.thresholds.iter().rposition(|t| depth >= t.count);
                if current.is_none() {
                    info!("Dispatch queue depth {} is back below alert thresholds", depth);
                }
            }
        }
    }
}

async fn run_lane(lane: usize, mut rx: mpsc::UnboundedReceiver<WorkItem>, state: Arc<QueueState>) {
    while let Some(WorkItem { key, receiver, event }) = rx.recv().await {
        if state.discard.load(Ordering::Acquire) {
            state.dropped.fetch_add(1, Ordering::Relaxed);
            QUEUE_DROPPED.inc();
        } else {
            state.deliver(receiver, event).await;
        }
        state.finish_item(key);
    }
    debug!("Dispatch lane {} stopped", lane);
}
