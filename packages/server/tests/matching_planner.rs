//! Scenario tests for the matching planner.

use chairway_server::common::{ChairId, Coordinate, RideId};
use chairway_server::kernel::{pair_score, plan_matches, ChairCandidate, RideCandidate};
use chrono::{DateTime, Duration, Utc};

fn ride_at(
    pickup: (i64, i64),
    dest: (i64, i64),
    age_ms: i64,
    now: DateTime<Utc>,
) -> RideCandidate {
    RideCandidate {
        ride_id: RideId::new(),
        pickup: Coordinate::new(pickup.0, pickup.1),
        destination: Coordinate::new(dest.0, dest.1),
        created_at: now - Duration::milliseconds(age_ms),
    }
}

fn chair_at(speed: i64, at: (i64, i64)) -> ChairCandidate {
    ChairCandidate {
        chair_id: ChairId::new(),
        speed,
        location: Coordinate::new(at.0, at.1),
    }
}

#[test]
fn single_ride_single_chair_matches() {
    let now = Utc::now();
    let ride = ride_at((0, 0), (10, 10), 0, now);
    let chair = chair_at(3, (0, 0));

    let plan = plan_matches(&[ride.clone()], &[chair.clone()], now);
    assert_eq!(plan, vec![(ride.ride_id, chair.chair_id)]);
}

#[test]
fn nearest_chair_wins_when_all_else_is_equal() {
    let now = Utc::now();
    let ride = ride_at((0, 0), (10, 10), 0, now);
    let near = chair_at(3, (2, 0));
    let far = chair_at(3, (40, 40));

    let plan = plan_matches(&[ride.clone()], &[near.clone(), far], now);
    assert_eq!(plan[0], (ride.ride_id, near.chair_id));
}

#[test]
fn starving_ride_outranks_long_profitable_trip() {
    let now = Utc::now();
    // One chair, two rides: a fresh long trip and a ride past the 22s
    // starvation threshold. The aged ride must win the only chair.
    let fresh = ride_at((0, 0), (200, 200), 100, now);
    let starving = ride_at((0, 0), (1, 1), 23_000, now);
    let chair = chair_at(3, (0, 0));

    let plan = plan_matches(&[fresh, starving.clone()], &[chair.clone()], now);
    assert_eq!(plan[0], (starving.ride_id, chair.chair_id));
}

#[test]
fn aging_loss_grows_steeply_before_the_cliff() {
    let now = Utc::now();
    let chair = chair_at(3, (0, 0));
    let young = ride_at((0, 0), (5, 5), 1_000, now);
    let older = ride_at((0, 0), (5, 5), 15_000, now);

    assert!(pair_score(&older, &chair, now) > pair_score(&young, &chair, now));
}

#[test]
fn equal_score_tie_resolves_the_same_regardless_of_order() {
    let now = Utc::now();
    // Two chairs of equal speed at identical distance from the pickup: the
    // scores tie exactly and the sortable ids decide, not input order.
    let ride = ride_at((0, 0), (6, 6), 500, now);
    let left = chair_at(5, (-3, 0));
    let right = chair_at(5, (3, 0));

    let forward = plan_matches(&[ride.clone()], &[left.clone(), right.clone()], now);
    let backward = plan_matches(&[ride.clone()], &[right.clone(), left.clone()], now);
    assert_eq!(forward, backward);

    let expected_chair = left.chair_id.min(right.chair_id);
    assert_eq!(forward[0], (ride.ride_id, expected_chair));
}

#[test]
fn full_snapshot_replay_is_deterministic() {
    let now = Utc::now();
    let rides: Vec<_> = (0..8)
        .map(|i| ride_at((i % 4, i), (i, 12 - i), i * 700, now))
        .collect();
    let chairs: Vec<_> = (0..6)
        .map(|i| chair_at([2, 3, 5, 7][i as usize % 4], (i * 3, -i)))
        .collect();

    let first = plan_matches(&rides, &chairs, now);
    for _ in 0..20 {
        assert_eq!(plan_matches(&rides, &chairs, now), first);
    }
    // Everyone on the short side of the market got matched
    assert_eq!(first.len(), 6);
}

#[test]
fn surplus_chairs_stay_unassigned() {
    let now = Utc::now();
    let rides = vec![ride_at((0, 0), (5, 5), 0, now)];
    let chairs: Vec<_> = (0..5).map(|i| chair_at(3, (i, i))).collect();

    let plan = plan_matches(&rides, &chairs, now);
    assert_eq!(plan.len(), 1);
}
