//! In-process publish/subscribe bus for dashboard clients.
//!
//! Internally a `tokio::sync::broadcast` channel: every subscriber sees every
//! event in publication order. A subscriber that falls more than the channel
//! capacity behind loses the oldest events (at-most-once delivery) and keeps
//! going from the newest. Subscribing starts at "now"; there is no replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Thought,
    TaskCompleted,
    TaskFailed,
    Evolution,
    ObjectivesUpdated,
    /// Non-fatal error surfaced to the dashboard.
    Warning,
    /// End-of-tick provider health / degraded-mode indicator.
    Status,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Thought => "thought",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Evolution => "evolution",
            Self::ObjectivesUpdated => "objectives_updated",
            Self::Warning => "warning",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// Outbound subscriber event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Publisher side; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

impl EventBus {
    pub fn new(queue: usize) -> Self {
        let (tx, _) = broadcast::channel(queue.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event, returning its sequence number.
    ///
    /// Publishing with no subscribers is not an error; the event is dropped.
    pub fn publish<T: Serialize>(&self, kind: EventType, payload: &T) -> u64 {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Dropping {} event: payload not serialisable: {}", kind, e);
                return self.seq.load(Ordering::SeqCst);
            }
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        let delivered = self.tx.send(event).unwrap_or(0);
        debug!("Published {} #{} to {} subscribers", kind, seq, delivered);
        seq
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the last published event.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl Subscription {
    /// Next event, skipping over anything lost while lagging.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!("Subscriber lagged; dropped {} events", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to lag.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_events_in_order_with_increasing_seq() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.publish(EventType::Thought, &json!({"id": 1}));
        bus.publish(EventType::TaskCompleted, &json!({"id": 1}));

        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        assert_eq!((a.seq, a.kind), (1, EventType::Thought));
        assert_eq!((b.seq, b.kind), (2, EventType::TaskCompleted));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_past_bound() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        for i in 0..10 {
            bus.publish(EventType::Thought, &json!({ "id": i }));
        }
        let first = slow.recv().await.unwrap();
        assert_eq!(first.seq, 7);
        assert_eq!(slow.dropped(), 6);
        let rest: Vec<u64> = std::iter::from_fn(|| slow.try_recv()).map(|e| e.seq).collect();
        assert_eq!(rest, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn late_subscriber_starts_from_now() {
        let bus = EventBus::default();
        bus.publish(EventType::Thought, &json!({}));
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
        bus.publish(EventType::Evolution, &json!({}));
        assert_eq!(late.recv().await.unwrap().seq, 2);
    }

    #[test]
    fn event_wire_shape_uses_type_key() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.publish(EventType::ObjectivesUpdated, &json!(["a"]));
        let event = sub.try_recv().unwrap();
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "objectives_updated");
        assert_eq!(wire["seq"], 1);
        assert_eq!(wire["payload"], json!(["a"]));
        assert!(wire["timestamp"].is_string());
    }
}
