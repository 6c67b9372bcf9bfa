//! In-process pub/sub hub for ride state-transition events.
//!
//! Two independent sides, keyed by user id and chair id, feed the two
//! notification streams. Subscribers get a bounded broadcast channel; a slow
//! subscriber whose buffer fills simply misses messages (at-most-once
//! delivery — the stream's next snapshot covers the gap).
//!
//! Producers (handlers, dispatcher):
//!   hub.publish_to_user(user_id, event).await;
//!
//! Consumers (SSE endpoints):
//!   let rx = hub.subscribe_user(user_id).await;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::common::{ChairId, RideId, UserId};
use crate::domains::ride::RidePhase;

/// A ride state transition as published on the hub.
#[derive(Debug, Clone)]
pub struct RideEvent {
    pub ride_id: RideId,
    pub phase: RidePhase,
    pub chair_id: Option<ChairId>,
    pub evaluation: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// One side of the hub: a keyed map of broadcast channels.
///
/// Thread-safe, cloneable. Subscribe takes the write lock (it may create the
/// channel), publish takes the read lock, so publishes to one key drain
/// subscribers in registration order.
#[derive(Clone)]
struct TopicMap<K> {
    channels: Arc<RwLock<HashMap<K, broadcast::Sender<RideEvent>>>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> TopicMap<K> {
    fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    async fn publish(&self, key: &K, event: RideEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(key) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(event);
        }
    }

    async fn subscribe(&self, key: K) -> broadcast::Receiver<RideEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    async fn reset(&self) {
        self.channels.write().await.clear();
    }

    async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

/// The two-sided event bus feeding user and chair notification streams.
#[derive(Clone)]
pub struct RideHub {
    users: TopicMap<UserId>,
    chairs: TopicMap<ChairId>,
}

impl RideHub {
    /// Create a hub with the default per-channel capacity (256 events).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            users: TopicMap::new(capacity),
            chairs: TopicMap::new(capacity),
        }
    }

    pub async fn publish_to_user(&self, user_id: UserId, event: RideEvent) {
        self.users.publish(&user_id, event).await;
    }

    pub async fn publish_to_chair(&self, chair_id: ChairId, event: RideEvent) {
        self.chairs.publish(&chair_id, event).await;
    }

    pub async fn subscribe_user(&self, user_id: UserId) -> broadcast::Receiver<RideEvent> {
        self.users.subscribe(user_id).await
    }

    pub async fn subscribe_chair(&self, chair_id: ChairId) -> broadcast::Receiver<RideEvent> {
        self.chairs.subscribe(chair_id).await
    }

    /// Drop every channel. Used by the initializer.
    pub async fn reset(&self) {
        self.users.reset().await;
        self.chairs.reset().await;
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        self.users.cleanup().await;
        self.chairs.cleanup().await;
    }
}

impl Default for RideHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RideId;

    fn event(phase: RidePhase) -> RideEvent {
        RideEvent {
            ride_id: RideId::new(),
            phase,
            chair_id: None,
            evaluation: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let hub = RideHub::new();
        let user_id = UserId::new();
        let mut rx = hub.subscribe_user(user_id).await;

        hub.publish_to_user(user_id, event(RidePhase::Matching)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.phase, RidePhase::Matching);
    }

    #[tokio::test]
    async fn test_publish_no_subscribers_is_noop() {
        let hub = RideHub::new();
        // Should not panic or block
        hub.publish_to_chair(ChairId::new(), event(RidePhase::Matched))
            .await;
    }

    #[tokio::test]
    async fn test_sides_are_independent() {
        let hub = RideHub::new();
        let user_id = UserId::new();
        let chair_id = ChairId::new();
        let mut user_rx = hub.subscribe_user(user_id).await;
        let mut chair_rx = hub.subscribe_chair(chair_id).await;

        hub.publish_to_user(user_id, event(RidePhase::Matching)).await;
        hub.publish_to_chair(chair_id, event(RidePhase::Matched)).await;

        assert_eq!(user_rx.recv().await.unwrap().phase, RidePhase::Matching);
        assert_eq!(chair_rx.recv().await.unwrap().phase, RidePhase::Matched);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let hub = RideHub::new();
        let user_id = UserId::new();
        let mut rx1 = hub.subscribe_user(user_id).await;
        let mut rx2 = hub.subscribe_user(user_id).await;

        hub.publish_to_user(user_id, event(RidePhase::Arrived)).await;

        assert_eq!(rx1.recv().await.unwrap().phase, RidePhase::Arrived);
        assert_eq!(rx2.recv().await.unwrap().phase, RidePhase::Arrived);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_publisher() {
        let hub = RideHub::new();
        let user_id = UserId::new();
        let rx = hub.subscribe_user(user_id).await;
        drop(rx);

        hub.publish_to_user(user_id, event(RidePhase::Enroute)).await;
        hub.cleanup().await;

        // A fresh subscriber only sees events published after it joined
        let mut rx = hub.subscribe_user(user_id).await;
        hub.publish_to_user(user_id, event(RidePhase::Pickup)).await;
        assert_eq!(rx.recv().await.unwrap().phase, RidePhase::Pickup);
    }

    #[tokio::test]
    async fn test_reset_drops_channels() {
        let hub = RideHub::new();
        let user_id = UserId::new();
        let mut rx = hub.subscribe_user(user_id).await;

        hub.reset().await;
        hub.publish_to_user(user_id, event(RidePhase::Matching)).await;

        // The pre-reset receiver's sender is gone
        assert!(rx.recv().await.is_err());
    }
}
