//! Steady-state in-memory caches over the relational store.
//!
//! The ride, phase and latest-ride-by-chair maps are the state machine's
//! working set; the token maps keep session auth off the database. Everything
//! here is reconstructible: `rebuild` reloads from SQL on startup and on
//! initialize.

use anyhow::Result;
use dashmap::DashMap;
use sqlx::{PgExecutor, PgPool};

use crate::common::{ChairId, RideId, UserId};
use crate::domains::chair::Chair;
use crate::domains::ride::{Ride, RidePhase, RideStatus};
use crate::domains::user::User;

pub struct Caches {
    /// Latest ride record by ride id.
    pub rides: DashMap<RideId, Ride>,
    /// Latest phase by ride id.
    pub ride_phases: DashMap<RideId, RidePhase>,
    /// Most recent ride assigned to each chair.
    pub latest_ride_by_chair: DashMap<ChairId, Ride>,
    /// Every registered chair, by id.
    pub chairs: DashMap<ChairId, Chair>,
    /// Session access token -> user.
    pub user_tokens: DashMap<String, User>,
    /// Session access token -> chair.
    pub chair_tokens: DashMap<String, Chair>,
    /// Registered payment token per user.
    pub payment_tokens: DashMap<UserId, String>,
}

impl Caches {
    pub fn new() -> Self {
        Self {
            rides: DashMap::new(),
            ride_phases: DashMap::new(),
            latest_ride_by_chair: DashMap::new(),
            chairs: DashMap::new(),
            user_tokens: DashMap::new(),
            chair_tokens: DashMap::new(),
            payment_tokens: DashMap::new(),
        }
    }

    /// Store a ride and index it as its chair's latest.
    pub fn store_ride(&self, ride: Ride) {
        if let Some(chair_id) = ride.chair_id {
            self.latest_ride_by_chair.insert(chair_id, ride.clone());
        }
        self.rides.insert(ride.id, ride);
    }

    pub fn set_phase(&self, ride_id: RideId, phase: RidePhase) {
        self.ride_phases.insert(ride_id, phase);
    }

    /// Latest phase of a ride, cache first, relational store as fallback.
    pub async fn ride_phase(
        &self,
        executor: impl PgExecutor<'_>,
        ride_id: RideId,
    ) -> Result<Option<RidePhase>> {
        if let Some(hit) = self.ride_phases.get(&ride_id) {
            return Ok(Some(*hit));
        }
        let Some(status) = RideStatus::latest(executor, ride_id).await? else {
            return Ok(None);
        };
        self.ride_phases.insert(ride_id, status.status);
        Ok(Some(status.status))
    }

    /// Latest ride of a chair, cache first, relational store as fallback.
    pub async fn latest_ride_for_chair(
        &self,
        executor: impl PgExecutor<'_>,
        chair_id: ChairId,
    ) -> Result<Option<Ride>> {
        if let Some(hit) = self.latest_ride_by_chair.get(&chair_id) {
            return Ok(Some(hit.value().clone()));
        }
        let Some(ride) = Ride::latest_for_chair(executor, chair_id).await? else {
            return Ok(None);
        };
        self.latest_ride_by_chair.insert(chair_id, ride.clone());
        Ok(Some(ride))
    }

    pub fn reset(&self) {
        self.rides.clear();
        self.ride_phases.clear();
        self.latest_ride_by_chair.clear();
        self.chairs.clear();
        self.user_tokens.clear();
        self.chair_tokens.clear();
        self.payment_tokens.clear();
    }

    /// Reload every map from the relational store.
    pub async fn rebuild(&self, pool: &PgPool) -> Result<()> {
        self.reset();

        for chair in Chair::all(pool).await? {
            self.chairs.insert(chair.id, chair);
        }

        for (ride_id, phase) in RideStatus::latest_per_ride(pool).await? {
            self.ride_phases.insert(ride_id, phase);
        }

        for ride in Ride::latest_per_chair(pool).await? {
            self.store_ride(ride);
        }

        let payment_tokens: Vec<(UserId, String)> =
            sqlx::query_as("SELECT user_id, token FROM payment_tokens")
                .fetch_all(pool)
                .await?;
        for (user_id, token) in payment_tokens {
            self.payment_tokens.insert(user_id, token);
        }

        Ok(())
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}
