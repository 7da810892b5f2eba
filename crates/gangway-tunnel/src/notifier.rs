//! Fan-out of store changes to subscribers.
//!
//! Each subscriber owns a bounded queue. Delivery never blocks the producer:
//! a subscriber whose queue is full is dropped on the spot, so one stalled
//! client cannot hold back the rest.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::store::StateSnapshot;

pub struct Notifier {
    queue: usize,
    subscribers: Mutex<Vec<mpsc::Sender<StateSnapshot>>>,
}

/// Receiving side of one subscription. The channel closes when the
/// subscriber falls behind or the notifier shuts down.
pub struct Subscription {
    rx: mpsc::Receiver<StateSnapshot>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StateSnapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateSnapshot> {
        self.rx.try_recv().ok()
    }
}

impl Notifier {
    pub fn new(queue: usize) -> Self {
        Self {
            queue: queue.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber and deliver the current snapshot as its first
    /// message.
    pub fn subscribe(&self, initial: StateSnapshot) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        // Queue length is >= 1, so the initial snapshot always fits.
        let _ = tx.try_send(initial);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Subscription { rx }
    }

    /// Enqueue a snapshot for every subscriber without blocking. Full or
    /// closed subscribers are removed; dropping the sender closes their
    /// channel.
    pub fn publish(&self, snapshot: &StateSnapshot) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("dropping slow tunnel-state subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TunnelStatus, TunnelState};

    fn snapshot_with(id: &str, status: TunnelStatus) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(id.to_string(), TunnelState::with_status(status));
        snapshot
    }

    #[tokio::test]
    async fn subscriber_receives_initial_snapshot_first() {
        let notifier = Notifier::new(4);
        let mut sub = notifier.subscribe(snapshot_with("abc", TunnelStatus::Starting));
        notifier.publish(&snapshot_with("abc", TunnelStatus::Ready));

        let first = sub.recv().await.unwrap();
        assert_eq!(first["abc"].status, TunnelStatus::Starting);
        let second = sub.recv().await.unwrap();
        assert_eq!(second["abc"].status, TunnelStatus::Ready);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_and_others_keep_up() {
        let notifier = Notifier::new(2);
        let mut fast = notifier.subscribe(StateSnapshot::new());
        let _slow = notifier.subscribe(StateSnapshot::new());
        assert_eq!(notifier.subscriber_count(), 2);

        // Fast drains every message; slow never reads. Its queue holds the
        // initial snapshot plus one change, so the second change evicts it.
        assert!(fast.recv().await.is_some());
        notifier.publish(&snapshot_with("abc", TunnelStatus::Starting));
        assert!(fast.recv().await.is_some());
        notifier.publish(&snapshot_with("abc", TunnelStatus::Blocked));
        assert!(fast.recv().await.is_some());
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish(&snapshot_with("abc", TunnelStatus::Ready));
        let last = fast.recv().await.unwrap();
        assert_eq!(last["abc"].status, TunnelStatus::Ready);
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned_on_publish() {
        let notifier = Notifier::new(4);
        let sub = notifier.subscribe(StateSnapshot::new());
        drop(sub);
        notifier.publish(&StateSnapshot::new());
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
