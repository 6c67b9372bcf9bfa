//! Periodic matcher pairing waiting rides with idle chairs.
//!
//! Each tick snapshots and clears the pending-ride queue and the idle-chair
//! pool, scores every (ride, chair) pair, assigns greedily in descending
//! score, and returns the leftovers. Scoring balances pickup travel time,
//! trip length and ride age:
//!
//! ```text
//! pd    = manhattan(pickup, chair) / speed
//! dd    = manhattan(pickup, destination)
//! loss  = (age_ms / 5000)^4, +100000 once age_ms > 22000
//! score = dd - 100*pd + 100000*loss
//! ```
//!
//! The planner is pure and deterministic: candidates are ordered by
//! (score desc, ride id, chair id), so equal scores break ties on the
//! sortable ids rather than on input order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::common::{ChairId, Coordinate, RideId};
use crate::domains::ride::{Ride, RidePhase, RideStatus};
use crate::kernel::{AppKernel, RideEvent};

/// A MATCHING ride as seen by the planner.
#[derive(Debug, Clone)]
pub struct RideCandidate {
    pub ride_id: RideId,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub created_at: DateTime<Utc>,
}

impl RideCandidate {
    pub fn from_ride(ride: &Ride) -> Self {
        Self {
            ride_id: ride.id,
            pickup: ride.pickup_coordinate(),
            destination: ride.destination_coordinate(),
            created_at: ride.created_at,
        }
    }
}

/// An idle chair with a known location.
#[derive(Debug, Clone)]
pub struct ChairCandidate {
    pub chair_id: ChairId,
    pub speed: i64,
    pub location: Coordinate,
}

/// Weighted score of one (ride, chair) pairing. Higher is matched first.
pub fn pair_score(ride: &RideCandidate, chair: &ChairCandidate, now: DateTime<Utc>) -> f64 {
    let pd = ride.pickup.manhattan_distance(&chair.location) as f64 / chair.speed as f64;
    let dd = ride.pickup.manhattan_distance(&ride.destination) as f64;
    let age_ms = (now - ride.created_at).num_milliseconds().max(0);
    let mut loss = (age_ms as f64 / 5000.0).powi(4);
    if age_ms > 22_000 {
        loss += 100_000.0;
    }
    dd - 100.0 * pd + 100_000.0 * loss
}

/// Greedy assignment over all scored pairs, best score first. Every returned
/// pair references a distinct ride and a distinct chair.
pub fn plan_matches(
    rides: &[RideCandidate],
    chairs: &[ChairCandidate],
    now: DateTime<Utc>,
) -> Vec<(RideId, ChairId)> {
    struct ScoredPair {
        score: f64,
        ride_id: RideId,
        chair_id: ChairId,
    }

    let mut pairs = Vec::with_capacity(rides.len() * chairs.len());
    for ride in rides {
        for chair in chairs {
            pairs.push(ScoredPair {
                score: pair_score(ride, chair, now),
                ride_id: ride.ride_id,
                chair_id: chair.chair_id,
            });
        }
    }

    pairs.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.ride_id.cmp(&b.ride_id))
            .then_with(|| a.chair_id.cmp(&b.chair_id))
    });

    let mut matched_rides: HashSet<RideId> = HashSet::new();
    let mut matched_chairs: HashSet<ChairId> = HashSet::new();
    let mut assignments = Vec::new();
    for pair in pairs {
        if matched_rides.contains(&pair.ride_id) || matched_chairs.contains(&pair.chair_id) {
            continue;
        }
        matched_rides.insert(pair.ride_id);
        matched_chairs.insert(pair.chair_id);
        assignments.push((pair.ride_id, pair.chair_id));
    }
    assignments
}

/// Run one matching pass. Unmatched rides and chairs go back to their pools;
/// a database failure aborts the pass (already-written assignments stand) and
/// the next tick retries.
pub async fn run_matching_tick(kernel: &AppKernel) -> Result<()> {
    let rides = kernel.pools.drain_pending().await;
    if rides.is_empty() {
        return Ok(());
    }

    let chairs = kernel.pools.drain_idle().await;
    if chairs.is_empty() {
        kernel.pools.requeue_rides(rides).await;
        return Ok(());
    }

    tracing::debug!(rides = rides.len(), chairs = chairs.len(), "matching start");

    let now = Utc::now();

    let ride_by_id: HashMap<RideId, &Ride> = rides.iter().map(|r| (r.id, r)).collect();
    let ride_candidates: Vec<RideCandidate> = rides.iter().map(RideCandidate::from_ride).collect();

    // Chairs without a known location sit this tick out but stay pooled.
    let mut chair_candidates = Vec::with_capacity(chairs.len());
    for chair in &chairs {
        if let Some(location) = kernel.locations.get(chair.id)? {
            chair_candidates.push(ChairCandidate {
                chair_id: chair.id,
                speed: chair.speed(),
                location: location.last_coordinate(),
            });
        }
    }

    let plan = plan_matches(&ride_candidates, &chair_candidates, now);

    let mut matched_rides: HashSet<RideId> = HashSet::new();
    let mut matched_chairs: HashSet<ChairId> = HashSet::new();
    let mut failure: Option<anyhow::Error> = None;

    for (ride_id, chair_id) in plan {
        match assign(kernel, ride_by_id[&ride_id], chair_id, now).await {
            Ok(()) => {
                matched_rides.insert(ride_id);
                matched_chairs.insert(chair_id);
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let leftover_rides: Vec<Ride> = rides
        .into_iter()
        .filter(|r| !matched_rides.contains(&r.id))
        .collect();
    let leftover_chairs: Vec<_> = chairs
        .into_iter()
        .filter(|c| !matched_chairs.contains(&c.id))
        .collect();

    tracing::debug!(
        matched = matched_rides.len(),
        remaining_rides = leftover_rides.len(),
        remaining_chairs = leftover_chairs.len(),
        "matching end"
    );

    kernel.pools.requeue_rides(leftover_rides).await;
    kernel.pools.return_idle(leftover_chairs).await;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Persist one assignment, refresh the caches, and publish MATCHED.
async fn assign(
    kernel: &AppKernel,
    ride: &Ride,
    chair_id: ChairId,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = kernel
        .pool
        .begin()
        .await
        .context("failed to begin assignment transaction")?;
    Ride::assign_chair(&mut *tx, ride.id, chair_id, now).await?;
    RideStatus::insert(&mut *tx, ride.id, RidePhase::Matched).await?;
    tx.commit()
        .await
        .context("failed to commit assignment transaction")?;

    let mut assigned = ride.clone();
    assigned.chair_id = Some(chair_id);
    assigned.updated_at = now;

    kernel.caches.store_ride(assigned.clone());
    kernel.caches.set_phase(ride.id, RidePhase::Matched);
    kernel
        .statuses
        .set_chair_phase(chair_id, RidePhase::Matched, ride.id)?;

    let event = RideEvent {
        ride_id: ride.id,
        phase: RidePhase::Matched,
        chair_id: Some(chair_id),
        evaluation: None,
        updated_at: now,
    };
    kernel.hub.publish_to_chair(chair_id, event.clone()).await;
    kernel.hub.publish_to_user(assigned.user_id, event).await;
    Ok(())
}

/// Spawn the background dispatcher. Its lifetime is the process's; per-tick
/// errors are logged and swallowed.
pub fn spawn_dispatcher(kernel: Arc<AppKernel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(kernel.config.matching_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_matching_tick(&kernel).await {
                tracing::error!(error = %format!("{e:#}"), "matching tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ride(pickup: (i64, i64), dest: (i64, i64), age_ms: i64, now: DateTime<Utc>) -> RideCandidate {
        RideCandidate {
            ride_id: RideId::new(),
            pickup: Coordinate::new(pickup.0, pickup.1),
            destination: Coordinate::new(dest.0, dest.1),
            created_at: now - Duration::milliseconds(age_ms),
        }
    }

    fn chair(speed: i64, at: (i64, i64)) -> ChairCandidate {
        ChairCandidate {
            chair_id: ChairId::new(),
            speed,
            location: Coordinate::new(at.0, at.1),
        }
    }

    #[test]
    fn test_score_prefers_closer_chair() {
        let now = Utc::now();
        let r = ride((0, 0), (10, 10), 0, now);
        let near = chair(3, (1, 1));
        let far = chair(3, (30, 30));
        assert!(pair_score(&r, &near, now) > pair_score(&r, &far, now));
    }

    #[test]
    fn test_score_prefers_faster_chair_at_equal_distance() {
        let now = Utc::now();
        let r = ride((0, 0), (10, 10), 0, now);
        let slow = chair(2, (10, 0));
        let fast = chair(7, (10, 0));
        assert!(pair_score(&r, &fast, now) > pair_score(&r, &slow, now));
    }

    #[test]
    fn test_aged_ride_dominates() {
        let now = Utc::now();
        let fresh = ride((0, 0), (100, 100), 0, now);
        let stale = ride((0, 0), (1, 1), 23_000, now);
        let c = chair(3, (0, 0));
        assert!(pair_score(&stale, &c, now) > pair_score(&fresh, &c, now));
    }

    #[test]
    fn test_plan_assigns_each_ride_and_chair_once() {
        let now = Utc::now();
        let rides = vec![
            ride((0, 0), (5, 5), 0, now),
            ride((10, 10), (20, 20), 0, now),
        ];
        let chairs = vec![chair(3, (0, 0)), chair(3, (10, 10)), chair(5, (50, 50))];

        let plan = plan_matches(&rides, &chairs, now);
        assert_eq!(plan.len(), 2);

        let ride_ids: HashSet<_> = plan.iter().map(|(r, _)| *r).collect();
        let chair_ids: HashSet<_> = plan.iter().map(|(_, c)| *c).collect();
        assert_eq!(ride_ids.len(), 2);
        assert_eq!(chair_ids.len(), 2);
    }

    #[test]
    fn test_plan_is_deterministic_across_runs() {
        let now = Utc::now();
        let rides: Vec<_> = (0..5)
            .map(|i| ride((i, i), (i + 10, i + 10), (i * 100) as i64, now))
            .collect();
        let chairs: Vec<_> = (0..4).map(|i| chair(3, (i * 2, 0))).collect();

        let first = plan_matches(&rides, &chairs, now);
        for _ in 0..10 {
            assert_eq!(plan_matches(&rides, &chairs, now), first);
        }
    }

    #[test]
    fn test_plan_is_independent_of_input_order() {
        let now = Utc::now();
        let rides: Vec<_> = (0..4)
            .map(|i| ride((i * 3, 0), (i * 3, 15), 50, now))
            .collect();
        // Two chairs with identical speed and symmetric distances force a tie
        let chairs = vec![chair(3, (0, 5)), chair(3, (0, 5)), chair(5, (9, 9))];

        let mut forward = plan_matches(&rides, &chairs, now);
        let reversed_rides: Vec<_> = rides.iter().rev().cloned().collect();
        let reversed_chairs: Vec<_> = chairs.iter().rev().cloned().collect();
        let mut backward = plan_matches(&reversed_rides, &reversed_chairs, now);

        forward.sort();
        backward.sort();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_plan_with_more_rides_than_chairs_leaves_rides_waiting() {
        let now = Utc::now();
        let rides: Vec<_> = (0..6).map(|i| ride((i, 0), (i, 9), 0, now)).collect();
        let chairs = vec![chair(3, (0, 0)), chair(7, (5, 5))];

        let plan = plan_matches(&rides, &chairs, now);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_empty_inputs() {
        let now = Utc::now();
        assert!(plan_matches(&[], &[], now).is_empty());
        assert!(plan_matches(&[ride((0, 0), (1, 1), 0, now)], &[], now).is_empty());
        assert!(plan_matches(&[], &[chair(3, (0, 0))], now).is_empty());
    }
}
