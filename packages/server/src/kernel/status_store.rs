//! Per-chair phase and per-user active-ride flags, same dual-tier layout as
//! the location store.
//!
//! On-disk records: per chair `[phase_byte][ride_id 16 bytes]`, per user a
//! single flag byte.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{ChairId, RideId, UserId};
use crate::domains::ride::{Ride, RidePhase, RideStatus};

const CHAIR_STATUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("chair_statuses");
const USER_FLAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("user_active_flags");

const CHAIR_RECORD_LEN: usize = 17;

fn encode_chair_record(phase: RidePhase, ride_id: RideId) -> [u8; CHAIR_RECORD_LEN] {
    let mut buf = [0u8; CHAIR_RECORD_LEN];
    buf[0] = phase.as_byte();
    buf[1..].copy_from_slice(ride_id.as_bytes());
    buf
}

fn decode_chair_record(raw: &[u8]) -> Result<(RidePhase, RideId)> {
    anyhow::ensure!(
        raw.len() == CHAIR_RECORD_LEN,
        "chair status record has length {}, expected {CHAIR_RECORD_LEN}",
        raw.len()
    );
    let phase = RidePhase::from_byte(raw[0])
        .with_context(|| format!("invalid phase byte {}", raw[0]))?;
    let uuid = Uuid::from_slice(&raw[1..])?;
    Ok((phase, RideId::from_uuid(uuid)))
}

/// Dual-tier status store.
#[derive(Clone)]
pub struct StatusStore {
    db: Arc<Database>,
    chair_cache: Arc<DashMap<ChairId, (RidePhase, RideId)>>,
    user_cache: Arc<DashMap<UserId, bool>>,
}

impl StatusStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let txn = db.begin_write().context("failed to begin kv transaction")?;
        txn.open_table(CHAIR_STATUSES)
            .context("failed to open chair status table")?;
        txn.open_table(USER_FLAGS)
            .context("failed to open user flag table")?;
        txn.commit().context("failed to commit kv transaction")?;
        Ok(Self {
            db,
            chair_cache: Arc::new(DashMap::new()),
            user_cache: Arc::new(DashMap::new()),
        })
    }

    /// Record the phase of the chair's current ride.
    pub fn set_chair_phase(
        &self,
        chair_id: ChairId,
        phase: RidePhase,
        ride_id: RideId,
    ) -> Result<()> {
        let key = chair_id.to_string();
        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        {
            let mut table = txn
                .open_table(CHAIR_STATUSES)
                .context("failed to open chair status table")?;
            table.insert(key.as_str(), encode_chair_record(phase, ride_id).as_slice())?;
        }
        txn.commit().context("failed to commit kv transaction")?;
        self.chair_cache.insert(chair_id, (phase, ride_id));
        Ok(())
    }

    /// Phase and ride id of the chair's current ride, if any was recorded.
    pub fn chair_phase(&self, chair_id: ChairId) -> Result<Option<(RidePhase, RideId)>> {
        if let Some(hit) = self.chair_cache.get(&chair_id) {
            return Ok(Some(*hit));
        }

        let key = chair_id.to_string();
        let txn = self
            .db
            .begin_read()
            .context("failed to begin kv read transaction")?;
        let table = txn
            .open_table(CHAIR_STATUSES)
            .context("failed to open chair status table")?;
        let record = match table.get(key.as_str())? {
            Some(guard) => decode_chair_record(guard.value())?,
            None => return Ok(None),
        };
        self.chair_cache.insert(chair_id, record);
        Ok(Some(record))
    }

    pub fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()> {
        let key = user_id.to_string();
        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        {
            let mut table = txn
                .open_table(USER_FLAGS)
                .context("failed to open user flag table")?;
            table.insert(key.as_str(), [active as u8].as_slice())?;
        }
        txn.commit().context("failed to commit kv transaction")?;
        self.user_cache.insert(user_id, active);
        Ok(())
    }

    /// Whether the user currently has a non-completed ride. Absent means no.
    pub fn user_has_active_ride(&self, user_id: UserId) -> Result<bool> {
        if let Some(hit) = self.user_cache.get(&user_id) {
            return Ok(*hit);
        }

        let key = user_id.to_string();
        let txn = self
            .db
            .begin_read()
            .context("failed to begin kv read transaction")?;
        let table = txn
            .open_table(USER_FLAGS)
            .context("failed to open user flag table")?;
        let active = match table.get(key.as_str())? {
            Some(guard) => guard.value().first().copied().unwrap_or(0) != 0,
            None => false,
        };
        self.user_cache.insert(user_id, active);
        Ok(active)
    }

    /// Drop every record, on-disk and in-memory.
    pub fn reset(&self) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        txn.delete_table(CHAIR_STATUSES)
            .context("failed to clear chair status table")?;
        txn.delete_table(USER_FLAGS)
            .context("failed to clear user flag table")?;
        txn.open_table(CHAIR_STATUSES)
            .context("failed to recreate chair status table")?;
        txn.open_table(USER_FLAGS)
            .context("failed to recreate user flag table")?;
        txn.commit().context("failed to commit kv transaction")?;
        self.chair_cache.clear();
        self.user_cache.clear();
        Ok(())
    }

    /// Rebuild chair phases and user flags from the relational store.
    pub async fn rebuild(&self, pool: &PgPool) -> Result<()> {
        self.reset()?;

        let latest_statuses = RideStatus::latest_per_ride(pool).await?;
        let phase_by_ride: std::collections::HashMap<RideId, RidePhase> =
            latest_statuses.into_iter().collect();

        for ride in Ride::latest_per_chair(pool).await? {
            let (Some(chair_id), Some(phase)) = (ride.chair_id, phase_by_ride.get(&ride.id))
            else {
                continue;
            };
            self.set_chair_phase(chair_id, *phase, ride.id)?;
        }

        let active_users: Vec<(UserId,)> = sqlx::query_as(
            "SELECT DISTINCT r.user_id
             FROM rides r
             JOIN ride_statuses rs ON r.id = rs.ride_id
             WHERE rs.created_at = (
                     SELECT MAX(rs2.created_at)
                     FROM ride_statuses rs2
                     WHERE rs2.ride_id = r.id
               )
               AND rs.status <> 'COMPLETED'",
        )
        .fetch_all(pool)
        .await
        .context("failed to load users with active rides")?;
        for (user_id,) in active_users {
            self.set_user_active(user_id, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (StatusStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        (StatusStore::new(Arc::new(db)).unwrap(), dir)
    }

    #[test]
    fn test_chair_phase_roundtrip() {
        let (store, _dir) = store();
        let chair = ChairId::new();
        let ride = RideId::new();

        assert_eq!(store.chair_phase(chair).unwrap(), None);
        store
            .set_chair_phase(chair, RidePhase::Enroute, ride)
            .unwrap();
        assert_eq!(
            store.chair_phase(chair).unwrap(),
            Some((RidePhase::Enroute, ride))
        );
    }

    #[test]
    fn test_chair_phase_survives_cache_clear() {
        let (store, _dir) = store();
        let chair = ChairId::new();
        let ride = RideId::new();
        store
            .set_chair_phase(chair, RidePhase::Carrying, ride)
            .unwrap();

        store.chair_cache.clear();
        assert_eq!(
            store.chair_phase(chair).unwrap(),
            Some((RidePhase::Carrying, ride))
        );
    }

    #[test]
    fn test_user_flag_defaults_to_inactive() {
        let (store, _dir) = store();
        assert!(!store.user_has_active_ride(UserId::new()).unwrap());
    }

    #[test]
    fn test_user_flag_roundtrip() {
        let (store, _dir) = store();
        let user = UserId::new();

        store.set_user_active(user, true).unwrap();
        assert!(store.user_has_active_ride(user).unwrap());

        store.set_user_active(user, false).unwrap();
        store.user_cache.clear();
        assert!(!store.user_has_active_ride(user).unwrap());
    }

    #[test]
    fn test_reset_clears_everything() {
        let (store, _dir) = store();
        let chair = ChairId::new();
        let user = UserId::new();
        store
            .set_chair_phase(chair, RidePhase::Matched, RideId::new())
            .unwrap();
        store.set_user_active(user, true).unwrap();

        store.reset().unwrap();
        assert_eq!(store.chair_phase(chair).unwrap(), None);
        assert!(!store.user_has_active_ride(user).unwrap());
    }

    #[test]
    fn test_record_rejects_garbage() {
        assert!(decode_chair_record(&[0u8; 16]).is_err());
        assert!(decode_chair_record(&[99u8; 17]).is_err());
    }
}
