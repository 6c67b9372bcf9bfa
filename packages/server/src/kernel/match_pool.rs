//! Pending-ride queue and idle-chair pool.
//!
//! Both are guarded vectors: the dispatcher snapshots and clears each under
//! its write lock, runs the matcher in isolation, then returns the leftovers.

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::common::ChairId;
use crate::domains::chair::Chair;
use crate::domains::ride::Ride;

pub struct MatchPools {
    /// Rides in phase MATCHING, FIFO by creation.
    pending_rides: RwLock<Vec<Ride>>,
    /// Chairs eligible for assignment: active, no unfinished ride.
    idle_chairs: RwLock<Vec<Chair>>,
}

impl MatchPools {
    pub fn new() -> Self {
        Self {
            pending_rides: RwLock::new(Vec::new()),
            idle_chairs: RwLock::new(Vec::new()),
        }
    }

    pub async fn enqueue_ride(&self, ride: Ride) {
        self.pending_rides.write().await.push(ride);
    }

    /// Return unmatched rides for the next tick.
    pub async fn requeue_rides(&self, rides: Vec<Ride>) {
        if rides.is_empty() {
            return;
        }
        self.pending_rides.write().await.extend(rides);
    }

    /// Snapshot and clear the queue.
    pub async fn drain_pending(&self) -> Vec<Ride> {
        std::mem::take(&mut *self.pending_rides.write().await)
    }

    pub async fn add_idle_chair(&self, chair: Chair) {
        let mut chairs = self.idle_chairs.write().await;
        if chairs.iter().any(|c| c.id == chair.id) {
            return;
        }
        chairs.push(chair);
    }

    pub async fn remove_idle_chair(&self, chair_id: ChairId) {
        self.idle_chairs.write().await.retain(|c| c.id != chair_id);
    }

    /// Snapshot and clear the pool.
    pub async fn drain_idle(&self) -> Vec<Chair> {
        std::mem::take(&mut *self.idle_chairs.write().await)
    }

    /// Return unmatched chairs for the next tick.
    pub async fn return_idle(&self, chairs: Vec<Chair>) {
        if chairs.is_empty() {
            return;
        }
        let mut pool = self.idle_chairs.write().await;
        for chair in chairs {
            if pool.iter().any(|c| c.id == chair.id) {
                continue;
            }
            pool.push(chair);
        }
    }

    pub async fn reset(&self) {
        self.pending_rides.write().await.clear();
        self.idle_chairs.write().await.clear();
    }

    /// Reload both pools from the relational store.
    pub async fn rebuild(&self, pool: &PgPool) -> Result<()> {
        let pending = Ride::pending_matching(pool).await?;
        let idle = Chair::idle(pool).await?;
        *self.pending_rides.write().await = pending;
        *self.idle_chairs.write().await = idle;
        Ok(())
    }
}

impl Default for MatchPools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChairId, OwnerId, RideId, UserId};
    use chrono::Utc;

    fn test_ride() -> Ride {
        Ride {
            id: RideId::new(),
            user_id: UserId::new(),
            chair_id: None,
            pickup_latitude: 0,
            pickup_longitude: 0,
            destination_latitude: 10,
            destination_longitude: 10,
            evaluation: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_chair() -> Chair {
        Chair {
            id: ChairId::new(),
            owner_id: OwnerId::new(),
            name: "test".to_string(),
            model: "AeroSeat".to_string(),
            is_active: true,
            access_token: "token".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_drain_empties_the_queue() {
        let pools = MatchPools::new();
        pools.enqueue_ride(test_ride()).await;
        pools.enqueue_ride(test_ride()).await;

        assert_eq!(pools.drain_pending().await.len(), 2);
        assert!(pools.drain_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let pools = MatchPools::new();
        let first = test_ride();
        let second = test_ride();
        pools.enqueue_ride(first.clone()).await;
        pools.enqueue_ride(second.clone()).await;

        let drained = pools.drain_pending().await;
        assert_eq!(drained[0].id, first.id);
        assert_eq!(drained[1].id, second.id);
    }

    #[tokio::test]
    async fn test_requeue_appends_leftovers() {
        let pools = MatchPools::new();
        let leftover = test_ride();
        pools.requeue_rides(vec![leftover.clone()]).await;
        pools.enqueue_ride(test_ride()).await;

        let drained = pools.drain_pending().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, leftover.id);
    }

    #[tokio::test]
    async fn test_idle_pool_deduplicates() {
        let pools = MatchPools::new();
        let chair = test_chair();
        pools.add_idle_chair(chair.clone()).await;
        pools.add_idle_chair(chair.clone()).await;

        assert_eq!(pools.drain_idle().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_idle_chair() {
        let pools = MatchPools::new();
        let keep = test_chair();
        let remove = test_chair();
        pools.add_idle_chair(keep.clone()).await;
        pools.add_idle_chair(remove.clone()).await;

        pools.remove_idle_chair(remove.id).await;
        let drained = pools.drain_idle().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, keep.id);
    }

    #[tokio::test]
    async fn test_return_idle_skips_duplicates() {
        let pools = MatchPools::new();
        let chair = test_chair();
        pools.add_idle_chair(chair.clone()).await;
        pools.return_idle(vec![chair.clone(), test_chair()]).await;

        assert_eq!(pools.drain_idle().await.len(), 2);
    }
}
