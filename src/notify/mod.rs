//! Real-time notification bus (§4.9).
//!
//! Per §9's redesign flag, fan-out is one bounded `tokio::sync::mpsc` channel
//! per subscriber rather than a shared lossy `broadcast` channel: `publish`
//! serializes the event once (wrapping it in an `Arc` so every subscriber's
//! queue holds a cheap clone) and offers it to each subscriber in turn. A
//! subscriber whose queue is full — a slow consumer — is dropped and its
//! connection closed, instead of silently skipping missed messages the way a
//! `broadcast` receiver would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Per-subscriber queue depth. A subscriber lagging behind by this many
/// events is considered slow and is disconnected.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: String,
}

impl Event {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Builds the standard session-transition event shape published by the
/// Session Manager on every state-machine edge.
pub fn session_event(session_id: &str, status: &str) -> Event {
    Event::new(
        "session_transition",
        serde_json::json!({ "sessionId": session_id, "status": status }),
    )
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Arc<Event>>,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Arc<Event>>,
}

/// Process-global fan-out point. Cheaply cloneable.
#[derive(Clone)]
pub struct NotificationBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.write().await.push(Subscriber { id, sender });
        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Delivers `event` to every currently-alive subscriber in publication
    /// order (per-subscriber FIFO; no cross-subscriber ordering guarantee).
    pub async fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let mut dead = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for sub in subs.iter() {
                if sub.sender.try_send(Arc::clone(&event)).is_err() {
                    dead.push(sub.id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            subs.retain(|s| !dead.contains(&s.id));
            for id in dead {
                warn!(subscriber_id = id, "dropped slow or disconnected notification subscriber");
            }
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the periodic heartbeat. A subscriber whose connection already
/// closed is reaped the next time `publish` fails to enqueue to it — there
/// is no explicit ack, so "missed heartbeat" and "channel closed" collapse
/// into the same detection path.
pub fn spawn_heartbeat(bus: NotificationBus, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            bus.publish(Event::new("heartbeat", serde_json::json!({}))).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe().await;
        bus.publish(session_event("s1", "planning")).await;
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind, "session_transition");
        assert_eq!(event.payload["sessionId"], "s1");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocked() {
        let bus = NotificationBus::new();
        let sub = bus.subscribe().await;
        for _ in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(Event::new("tick", serde_json::json!({}))).await;
        }
        assert_eq!(bus.subscriber_count().await, 0);
        drop(sub);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscriber() {
        let bus = NotificationBus::new();
        let sub = bus.subscribe().await;
        assert_eq!(bus.subscriber_count().await, 1);
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
