/// Broadcast hub - fans rate updates out to live subscribers
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::notifier::UpdateNotifier;
use crate::types::{RateUpdateMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound channel to one subscriber.
///
/// Frames go into a bounded queue drained by the subscriber's connection
/// task. A full or closed queue counts as a failed delivery.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    sender: mpsc::Sender<String>,
}

impl SubscriberHandle {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            SubscriberHandle {
                id: SubscriberId::new(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Tracks the live subscriber set
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberHandle>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        BroadcastHub {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a handle with its own queue and register it
    pub async fn subscribe(&self, buffer: usize) -> (SubscriberId, mpsc::Receiver<String>) {
        let (handle, receiver) = SubscriberHandle::new(buffer);
        let id = handle.id();
        self.register(handle).await;
        (id, receiver)
    }

    pub async fn register(&self, handle: SubscriberHandle) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(handle.id(), handle);
        info!("Subscriber connected. Total: {}", subscribers.len());
    }

    /// Remove a subscriber; absent ids are a no-op
    pub async fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id).is_some();
        if removed {
            info!("Subscriber disconnected. Total: {}", subscribers.len());
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    /// Deliver a raw text frame to every subscriber.
    ///
    /// Returns the number of successful deliveries. Failed subscribers are
    /// pruned after the pass.
    pub async fn broadcast_text(&self, text: &str) -> usize {
        let targets: Vec<SubscriberHandle> = {
            let subscribers = self.subscribers.read().await;
            if subscribers.is_empty() {
                return 0;
            }
            subscribers.values().cloned().collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();

        for handle in &targets {
            match handle.sender.try_send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", handle.id);
                    dead.push(handle.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} channel closed", handle.id);
                    dead.push(handle.id);
                }
            }
        }

        for id in dead {
            self.unregister(id).await;
        }

        delivered
    }

    pub async fn broadcast_rate_update(&self, update: RateUpdateMessage) {
        if self.subscribers.read().await.is_empty() {
            return;
        }

        match serde_json::to_string(&ServerMessage::RateUpdate(update)) {
            Ok(text) => {
                self.broadcast_text(&text).await;
            }
            Err(e) => error!("Failed to serialize rate update: {}", e),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateNotifier for BroadcastHub {
    async fn notify(&self, update: RateUpdateMessage) {
        self.broadcast_rate_update(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn update() -> RateUpdateMessage {
        RateUpdateMessage {
            pair: "ETH/USDC".to_string(),
            price: 2000.0,
            hourly_avg: 2000.0,
            last_update: Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let hub = BroadcastHub::new();

        assert_eq!(hub.broadcast_text("hello").await, 0);
        hub.notify(update()).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_pruned() {
        let hub = BroadcastHub::new();

        let (a, mut rx_a) = hub.subscribe(8).await;
        let (b, rx_b) = hub.subscribe(8).await;
        let (c, mut rx_c) = hub.subscribe(8).await;

        // b's connection is gone
        drop(rx_b);

        let delivered = hub.broadcast_text("tick").await;
        assert_eq!(delivered, 2);

        assert_eq!(rx_a.recv().await.as_deref(), Some("tick"));
        assert_eq!(rx_c.recv().await.as_deref(), Some("tick"));

        assert!(hub.contains(a).await);
        assert!(!hub.contains(b).await);
        assert!(hub.contains(c).await);
        assert_eq!(hub.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block() {
        let hub = BroadcastHub::new();

        let (slow, _rx_slow) = hub.subscribe(1).await;
        let (fast, mut rx_fast) = hub.subscribe(8).await;

        assert_eq!(hub.broadcast_text("one").await, 2);
        // slow never drains its queue, so the second frame does not fit
        assert_eq!(hub.broadcast_text("two").await, 1);

        assert!(!hub.contains(slow).await);
        assert!(hub.contains(fast).await);
        assert_eq!(rx_fast.recv().await.as_deref(), Some("one"));
        assert_eq!(rx_fast.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = BroadcastHub::new();
        let (id, _rx) = hub.subscribe(4).await;

        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert!(!hub.unregister(SubscriberId::new()).await);
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_notify_sends_rate_update_frame() {
        let hub = BroadcastHub::new();
        let (_id, mut rx) = hub.subscribe(4).await;

        hub.notify(update()).await;

        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "rate_update");
        assert_eq!(json["pair"], "ETH/USDC");
        assert_eq!(json["price"], 2000.0);
    }
}
