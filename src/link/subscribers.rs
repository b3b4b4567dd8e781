//! Fan-out set of connected subscribers
//!
//! Each subscriber owns a bounded outbound queue drained by its connection
//! task. A publish that finds a queue closed or full drops that subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Subscriber identifier, unique within one set
pub type SubscriberId = u64;

pub struct SubscriberSet<T> {
    members: Mutex<HashMap<SubscriberId, mpsc::Sender<T>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl<T: Clone> SubscriberSet<T> {
    /// Create an empty set whose members buffer up to `queue_depth` messages
    pub fn new(queue_depth: usize) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a subscriber and return its outbound queue
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.members.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    /// Deliver to every member. Returns the number of successful deliveries.
    pub fn publish(&self, msg: &T) -> usize {
        let mut members = self.members.lock();
        let mut failed = Vec::new();

        for (id, tx) in members.iter() {
            if let Err(e) = tx.try_send(msg.clone()) {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                debug!("Dropping subscriber {}: {}", id, reason);
                failed.push(*id);
            }
        }

        for id in &failed {
            members.remove(id);
        }
        members.len()
    }

    /// Send to one member only
    pub fn send_to(&self, id: SubscriberId, msg: T) -> bool {
        let mut members = self.members.lock();
        let delivered = match members.get(&id) {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => return false,
        };
        if !delivered {
            members.remove(&id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Drop every member, closing their queues
    pub fn clear(&self) {
        self.members.lock().clear();
    }
}
