use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Closed set of event names crossing the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventName {
    #[serde(rename = "server.created")]
    ServerCreated,
    #[serde(rename = "server.deleted")]
    ServerDeleted,
    #[serde(rename = "server.start_install")]
    ServerInstallStarted,
    #[serde(rename = "server.finish_install")]
    ServerInstallFinished,
    #[serde(rename = "server.power_action")]
    ServerPowerAction,
    #[serde(rename = "server.log")]
    ServerLog,
    #[serde(rename = "server.stats")]
    ServerStats,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ServerCreated => "server.created",
            EventName::ServerDeleted => "server.deleted",
            EventName::ServerInstallStarted => "server.start_install",
            EventName::ServerInstallFinished => "server.finish_install",
            EventName::ServerPowerAction => "server.power_action",
            EventName::ServerLog => "server.log",
            EventName::ServerStats => "server.stats",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published to subscribers. The payload is an opaque structured
/// value; the transport adapter serializes it as-is.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: EventName,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: EventName, payload: serde_json::Value) -> Self {
        Self { name, payload }
    }

    /// The uuid of the server this event concerns, when the payload carries
    /// one. Transports use it to filter per-server subscriptions.
    pub fn server(&self) -> Option<&str> {
        self.payload.get("server").and_then(|v| v.as_str())
    }
}

const SUBSCRIBER_CAPACITY: usize = 256;

struct BusInner {
    subscribers: RwLock<HashMap<String, mpsc::Sender<Event>>>,
    dropped: AtomicU64,
}

/// Process-wide publish/subscribe bus with keyed subscriptions.
///
/// Delivery is best-effort fan-out: a slow subscriber never stalls the
/// publisher. Events a full subscriber misses are counted, not redelivered.
/// Within a single subscriber, events arrive in publish order.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe under a caller-chosen key. A later subscribe with the same
    /// key replaces the previous channel.
    pub fn subscribe(&self, key: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.inner.subscribers.write().insert(key.to_string(), tx);
        rx
    }

    /// Remove a subscriber. Idempotent; safe after the bus is torn down.
    pub fn unsubscribe(&self, key: &str) {
        self.inner.subscribers.write().remove(key);
    }

    /// Deliver an event to every live subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let mut stale = Vec::new();

        {
            let subscribers = self.inner.subscribers.read();
            for (key, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(subscriber = %key, event = %event.name, "subscriber full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(key.clone());
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for key in stale {
                subscribers.remove(&key);
            }
        }
    }

    /// Total events dropped on full subscriber channels.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Drop all subscribers, closing their channels.
    pub fn close(&self) {
        self.inner.subscribers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe("a");
        let mut rx2 = bus.subscribe("b");

        bus.publish(Event::power("u", "start", "starting"));

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name, EventName::ServerPowerAction);
            assert_eq!(event.payload["status"], "starting");
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("a");

        for i in 0..10 {
            bus.publish(Event::new(EventName::ServerLog, json!({ "seq": i })));
        }

        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn full_subscriber_drops_and_counts() {
        let bus = EventBus::new();
        let _rx = bus.subscribe("slow");

        for _ in 0..(SUBSCRIBER_CAPACITY + 5) {
            bus.publish(Event::log("u", false, "line"));
        }

        assert_eq!(bus.dropped(), 5);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let _rx = bus.subscribe("a");

        bus.unsubscribe("a");
        bus.unsubscribe("a");
        assert_eq!(bus.subscriber_count(), 0);

        bus.close();
        bus.unsubscribe("a");
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("gone");
        drop(rx);

        bus.publish(Event::log("u", true, "x"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn payload_carries_server_uuid() {
        let event = Event::log("abcd1234", false, "hello");
        assert_eq!(event.server(), Some("abcd1234"));
    }
}
