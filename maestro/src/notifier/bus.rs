//! Bounded fan-out of status events to side-channel consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::notifier::protocol::StatusEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast buffer of status events
///
/// Each subscriber sees events published after it subscribed. A subscriber
/// that falls more than `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to current subscribers, if any
    pub fn publish(&self, event: StatusEvent) {
        if self.sender.send(event).is_err() {
            debug!("No side-channel subscribers, event discarded");
        }
    }

    pub fn subscribe(&self, consumer: impl Into<String>) -> EventReceiver {
        EventReceiver {
            consumer: consumer.into(),
            receiver: self.sender.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events lost by lagging subscribers since start
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct EventReceiver {
    consumer: String,
    receiver: broadcast::Receiver<StatusEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let total = self.dropped.fetch_add(skipped, Ordering::Relaxed) + skipped;
                    warn!(
                        consumer = %self.consumer,
                        skipped,
                        total,
                        "Side-channel consumer lagged, oldest events dropped"
                    );
                }
            }
        }
    }
}
