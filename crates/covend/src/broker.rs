//! Event broker: in-memory pub/sub fan-out.
//!
//! Each subscriber holds a bounded channel. Publishing never blocks:
//! when a subscriber's channel is full the event is dropped for that
//! subscriber only. A heartbeat task periodically broadcasts a full
//! `state.snapshot` so late joiners and stalled clients recover without
//! a reconnect handshake.

use coven_core::{Envelope, EventName, EventPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default per-subscriber channel depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

/// Handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug)]
pub struct Broker {
    buffer: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Envelope>>>,
}

impl Broker {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, tx);
        debug!(subscriber = id, "broker subscriber added");
        (SubscriberId(id), rx)
    }

    /// Remove a subscriber. Dropping the receiver also works; this frees
    /// the sender side eagerly.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().remove(&id.0);
        debug!(subscriber = id.0, "broker subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Fan an event out to every subscriber. Never blocks; lagging
    /// subscribers lose this event, closed subscribers are pruned.
    pub fn publish(&self, name: EventName, payload: EventPayload) {
        let envelope = Envelope::new(name, payload);
        let mut closed = Vec::new();
        {
            let subs = self.lock();
            for (id, tx) in subs.iter() {
                match tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(subscriber = id, event = name.as_str(), "subscriber lagging, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.lock();
            for id in closed {
                subs.remove(&id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Envelope>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Broadcast `state.snapshot` on a fixed interval until cancelled.
///
/// `snapshot` is polled at each tick; it should be cheap (a deep copy of
/// the state store).
pub fn spawn_heartbeat<F>(
    broker: std::sync::Arc<Broker>,
    interval: Duration,
    cancel: CancellationToken,
    snapshot: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> serde_json::Value + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broker.publish(EventName::StateSnapshot, EventPayload::Snapshot(snapshot()));
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::events::QuestionsChangedPayload;
    use std::sync::Arc;

    fn payload(open: usize) -> EventPayload {
        EventPayload::QuestionsChanged(QuestionsChangedPayload { open })
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let broker = Broker::with_defaults();
        let (_a, mut rx_a) = broker.subscribe();
        let (_b, mut rx_b) = broker.subscribe();

        broker.publish(EventName::QuestionsChanged, payload(1));

        assert_eq!(rx_a.recv().await.unwrap().name, EventName::QuestionsChanged);
        assert_eq!(rx_b.recv().await.unwrap().name, EventName::QuestionsChanged);
    }

    #[tokio::test]
    async fn overflow_drops_for_lagging_subscriber_only() {
        let broker = Broker::new(2);
        let (_slow, mut rx_slow) = broker.subscribe();
        let (_fast, mut rx_fast) = broker.subscribe();

        // Fill the slow channel without draining it.
        broker.publish(EventName::QuestionsChanged, payload(1));
        broker.publish(EventName::QuestionsChanged, payload(2));
        // Drain fast so it has room again.
        rx_fast.recv().await.unwrap();
        rx_fast.recv().await.unwrap();
        // This one is dropped for slow, delivered to fast.
        broker.publish(EventName::QuestionsChanged, payload(3));

        assert!(rx_fast.recv().await.is_some());
        // Slow sees only the first two.
        let mut seen = 0;
        while let Ok(env) = rx_slow.try_recv() {
            seen += 1;
            drop(env);
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let broker = Broker::with_defaults();
        let (_id, rx) = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);
        drop(rx);
        broker.publish(EventName::QuestionsChanged, payload(0));
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_channel() {
        let broker = Broker::with_defaults();
        let (id, _rx) = broker.subscribe();
        broker.unsubscribe(id);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_broadcasts_snapshots() {
        let broker = Arc::new(Broker::with_defaults());
        let (_id, mut rx) = broker.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(
            Arc::clone(&broker),
            Duration::from_secs(30),
            cancel.clone(),
            || serde_json::json!({"ok": true}),
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        let env = rx.recv().await.unwrap();
        assert_eq!(env.name, EventName::StateSnapshot);

        cancel.cancel();
        handle.await.unwrap();
    }
}
