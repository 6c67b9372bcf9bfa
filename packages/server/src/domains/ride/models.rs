//! Ride and ride-status persistence, and the ride lifecycle state machine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use sqlx::{Decode, Encode, PgExecutor, Type};
use std::fmt;
use std::str::FromStr;

use crate::common::{ChairId, Coordinate, RideId, RideStatusId, UserId};

/// Phase of a ride in the one-way lifecycle.
///
/// ```text
/// MATCHING -> MATCHED -> ENROUTE -> PICKUP -> CARRYING -> ARRIVED -> COMPLETED
/// ```
///
/// MATCHED is written by the dispatcher; ENROUTE and CARRYING by the chair
/// status endpoint; PICKUP and ARRIVED by the coordinate-ping handler;
/// COMPLETED by the user evaluation handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RidePhase {
    Matching,
    Matched,
    Enroute,
    Pickup,
    Carrying,
    Arrived,
    Completed,
}

impl RidePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RidePhase::Matching => "MATCHING",
            RidePhase::Matched => "MATCHED",
            RidePhase::Enroute => "ENROUTE",
            RidePhase::Pickup => "PICKUP",
            RidePhase::Carrying => "CARRYING",
            RidePhase::Arrived => "ARRIVED",
            RidePhase::Completed => "COMPLETED",
        }
    }

    /// Whether `next` is the legal successor of `self`. Transitions are
    /// one-way; anything else is a state-machine violation.
    pub fn can_transition_to(&self, next: RidePhase) -> bool {
        matches!(
            (self, next),
            (RidePhase::Matching, RidePhase::Matched)
                | (RidePhase::Matched, RidePhase::Enroute)
                | (RidePhase::Enroute, RidePhase::Pickup)
                | (RidePhase::Pickup, RidePhase::Carrying)
                | (RidePhase::Carrying, RidePhase::Arrived)
                | (RidePhase::Arrived, RidePhase::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == RidePhase::Completed
    }

    /// Single-byte encoding used by the status store records.
    pub fn as_byte(&self) -> u8 {
        match self {
            RidePhase::Matching => 1,
            RidePhase::Matched => 2,
            RidePhase::Enroute => 3,
            RidePhase::Pickup => 4,
            RidePhase::Carrying => 5,
            RidePhase::Arrived => 6,
            RidePhase::Completed => 7,
        }
    }

    pub fn from_byte(b: u8) -> Option<RidePhase> {
        Some(match b {
            1 => RidePhase::Matching,
            2 => RidePhase::Matched,
            3 => RidePhase::Enroute,
            4 => RidePhase::Pickup,
            5 => RidePhase::Carrying,
            6 => RidePhase::Arrived,
            7 => RidePhase::Completed,
            _ => return None,
        })
    }
}

impl fmt::Display for RidePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RidePhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "MATCHING" => RidePhase::Matching,
            "MATCHED" => RidePhase::Matched,
            "ENROUTE" => RidePhase::Enroute,
            "PICKUP" => RidePhase::Pickup,
            "CARRYING" => RidePhase::Carrying,
            "ARRIVED" => RidePhase::Arrived,
            "COMPLETED" => RidePhase::Completed,
            other => anyhow::bail!("unknown ride phase: {other}"),
        })
    }
}

// Stored as TEXT; delegate the sqlx codec to &str/String.

impl Type<Postgres> for RidePhase {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl Encode<'_, Postgres> for RidePhase {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl Decode<'_, Postgres> for RidePhase {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Ride row. `chair_id` is null exactly while the ride is still MATCHING;
/// `evaluation` is non-null exactly once the ride is COMPLETED.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Ride {
    pub id: RideId,
    pub user_id: UserId,
    pub chair_id: Option<ChairId>,
    pub pickup_latitude: i64,
    pub pickup_longitude: i64,
    pub destination_latitude: i64,
    pub destination_longitude: i64,
    pub evaluation: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn pickup_coordinate(&self) -> Coordinate {
        Coordinate::new(self.pickup_latitude, self.pickup_longitude)
    }

    pub fn destination_coordinate(&self) -> Coordinate {
        Coordinate::new(self.destination_latitude, self.destination_longitude)
    }

    pub async fn find(executor: impl PgExecutor<'_>, id: RideId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM rides WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Like `find`, but row-locked so concurrent status posts serialize.
    pub async fn find_for_update(
        executor: impl PgExecutor<'_>,
        id: RideId,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM rides WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Insert a new ride. The caller records the initial MATCHING transition.
    pub async fn insert(
        executor: impl PgExecutor<'_>,
        id: RideId,
        user_id: UserId,
        pickup: Coordinate,
        destination: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO rides (id, user_id, pickup_latitude, pickup_longitude,
                                destination_latitude, destination_longitude,
                                created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(id)
        .bind(user_id)
        .bind(pickup.latitude)
        .bind(pickup.longitude)
        .bind(destination.latitude)
        .bind(destination.longitude)
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Assign a chair to this ride (dispatcher).
    pub async fn assign_chair(
        executor: impl PgExecutor<'_>,
        id: RideId,
        chair_id: ChairId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE rides SET chair_id = $1, updated_at = $2 WHERE id = $3")
            .bind(chair_id)
            .bind(now)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Record the evaluation left by the user. Returns false when the ride
    /// row no longer exists.
    pub async fn set_evaluation(
        executor: impl PgExecutor<'_>,
        id: RideId,
        evaluation: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE rides SET evaluation = $1, updated_at = $2 WHERE id = $3")
            .bind(evaluation)
            .bind(now)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_for_user(executor: impl PgExecutor<'_>, user_id: UserId) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM rides WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn latest_for_user(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM rides WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn latest_for_chair(
        executor: impl PgExecutor<'_>,
        chair_id: ChairId,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM rides WHERE chair_id = $1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(chair_id)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// Latest ride per chair across the fleet, for cache rebuilds.
    pub async fn latest_per_chair(executor: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT DISTINCT ON (chair_id) *
             FROM rides
             WHERE chair_id IS NOT NULL
             ORDER BY chair_id, updated_at DESC",
        )
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    /// Count of the user's rides whose latest status is not COMPLETED.
    pub async fn ongoing_count_for_user(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*)
             FROM rides r
             JOIN ride_statuses rs ON r.id = rs.ride_id
             WHERE r.user_id = $1
               AND rs.created_at = (
                     SELECT MAX(rs2.created_at)
                     FROM ride_statuses rs2
                     WHERE rs2.ride_id = r.id
               )
               AND rs.status <> 'COMPLETED'",
        )
        .bind(user_id)
        .fetch_one(executor)
        .await?;
        Ok(count)
    }

    pub async fn count_for_user(executor: impl PgExecutor<'_>, user_id: UserId) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rides WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(executor)
            .await?;
        Ok(count)
    }

    /// Rides still waiting for a chair, FIFO by creation, for pool rebuilds.
    pub async fn pending_matching(executor: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT r.*
             FROM rides r
             JOIN ride_statuses rs ON r.id = rs.ride_id
             WHERE r.chair_id IS NULL
               AND rs.created_at = (
                     SELECT MAX(rs2.created_at)
                     FROM ride_statuses rs2
                     WHERE rs2.ride_id = r.id
               )
               AND rs.status = 'MATCHING'
             ORDER BY r.created_at",
        )
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }
}

/// One row per state transition, in insertion (= creation-time) order.
/// `app_sent_at` / `chair_sent_at` record delivery on the respective
/// notification stream.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct RideStatus {
    pub id: RideStatusId,
    pub ride_id: RideId,
    pub status: RidePhase,
    pub created_at: DateTime<Utc>,
    pub app_sent_at: Option<DateTime<Utc>>,
    pub chair_sent_at: Option<DateTime<Utc>>,
}

impl RideStatus {
    pub async fn insert(
        executor: impl PgExecutor<'_>,
        ride_id: RideId,
        status: RidePhase,
    ) -> Result<RideStatusId> {
        let id = RideStatusId::new();
        sqlx::query("INSERT INTO ride_statuses (id, ride_id, status) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(ride_id)
            .bind(status)
            .execute(executor)
            .await?;
        Ok(id)
    }

    pub async fn latest(executor: impl PgExecutor<'_>, ride_id: RideId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM ride_statuses WHERE ride_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(ride_id)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// Latest phase per ride, for cache rebuilds.
    pub async fn latest_per_ride(executor: impl PgExecutor<'_>) -> Result<Vec<(RideId, RidePhase)>> {
        let rows: Vec<(RideId, RidePhase)> = sqlx::query_as(
            "SELECT DISTINCT ON (ride_id) ride_id, status
             FROM ride_statuses
             ORDER BY ride_id, created_at DESC",
        )
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Mark the oldest transition not yet delivered on the user stream.
    pub async fn mark_app_sent(executor: impl PgExecutor<'_>, ride_id: RideId) -> Result<()> {
        sqlx::query(
            "UPDATE ride_statuses SET app_sent_at = NOW()
             WHERE id = (
                 SELECT id FROM ride_statuses
                 WHERE ride_id = $1 AND app_sent_at IS NULL
                 ORDER BY created_at
                 LIMIT 1
             )",
        )
        .bind(ride_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Mark the oldest transition not yet delivered on the chair stream.
    pub async fn mark_chair_sent(executor: impl PgExecutor<'_>, ride_id: RideId) -> Result<()> {
        sqlx::query(
            "UPDATE ride_statuses SET chair_sent_at = NOW()
             WHERE id = (
                 SELECT id FROM ride_statuses
                 WHERE ride_id = $1 AND chair_sent_at IS NULL
                 ORDER BY created_at
                 LIMIT 1
             )",
        )
        .bind(ride_id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

/// Aggregate evaluation stats of a chair over its completed rides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChairStats {
    pub total_rides_count: i64,
    pub total_evaluation: i64,
}

impl ChairStats {
    pub async fn for_chair(executor: impl PgExecutor<'_>, chair_id: ChairId) -> Result<Self> {
        let (total_rides_count, total_evaluation): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(r.evaluation), COALESCE(SUM(r.evaluation), 0)
             FROM rides r
             WHERE r.chair_id = $1
               AND r.evaluation IS NOT NULL
               AND EXISTS (
                     SELECT 1 FROM ride_statuses rs
                     WHERE rs.ride_id = r.id AND rs.status = 'COMPLETED'
               )",
        )
        .bind(chair_id)
        .fetch_one(executor)
        .await?;
        Ok(Self {
            total_rides_count,
            total_evaluation,
        })
    }

    pub fn evaluation_average(&self) -> f64 {
        if self.total_rides_count == 0 {
            0.0
        } else {
            self.total_evaluation as f64 / self.total_rides_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions_are_one_way() {
        use RidePhase::*;
        let order = [Matching, Matched, Enroute, Pickup, Carrying, Arrived, Completed];
        for (i, from) in order.iter().enumerate() {
            for (j, to) in order.iter().enumerate() {
                let allowed = from.can_transition_to(*to);
                assert_eq!(allowed, j == i + 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_phase_string_roundtrip() {
        use RidePhase::*;
        for phase in [Matching, Matched, Enroute, Pickup, Carrying, Arrived, Completed] {
            assert_eq!(phase.as_str().parse::<RidePhase>().unwrap(), phase);
        }
        assert!("CANCELED".parse::<RidePhase>().is_err());
    }

    #[test]
    fn test_phase_byte_roundtrip() {
        use RidePhase::*;
        for phase in [Matching, Matched, Enroute, Pickup, Carrying, Arrived, Completed] {
            assert_eq!(RidePhase::from_byte(phase.as_byte()), Some(phase));
        }
        assert_eq!(RidePhase::from_byte(0), None);
        assert_eq!(RidePhase::from_byte(8), None);
    }

    #[test]
    fn test_phase_serde_uses_wire_names() {
        let json = serde_json::to_string(&RidePhase::Enroute).unwrap();
        assert_eq!(json, "\"ENROUTE\"");
        let parsed: RidePhase = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(parsed, RidePhase::Completed);
    }
}
