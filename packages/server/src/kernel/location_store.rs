//! Per-chair location aggregate: in-memory map over an embedded KV store.
//!
//! The running aggregate `{total_distance, last_lat, last_lon, updated_at_ms}`
//! is the source for matching and owner reporting. Mutations are serialized
//! per chair through the KV store's single-writer transaction; reads hit the
//! in-memory map first and fall back to disk, so a reader may see a
//! stale-but-consistent snapshot.
//!
//! On-disk record: 32 bytes little-endian,
//! `[total_distance i64][last_lat i64][last_lon i64][updated_at_ms i64]`,
//! keyed by the chair id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use sqlx::PgPool;

use crate::common::{ChairId, Coordinate};

const LOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("chair_locations");

const RECORD_LEN: usize = 32;

/// Snapshot of a chair's location aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChairLocation {
    pub total_distance: i64,
    pub last_latitude: i64,
    pub last_longitude: i64,
    pub updated_at_ms: i64,
}

impl ChairLocation {
    pub fn last_coordinate(&self) -> Coordinate {
        Coordinate::new(self.last_latitude, self.last_longitude)
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&self.total_distance.to_le_bytes());
        buf[8..16].copy_from_slice(&self.last_latitude.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_longitude.to_le_bytes());
        buf[24..32].copy_from_slice(&self.updated_at_ms.to_le_bytes());
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        anyhow::ensure!(
            raw.len() == RECORD_LEN,
            "chair location record has length {}, expected {RECORD_LEN}",
            raw.len()
        );
        let int = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[range]);
            i64::from_le_bytes(bytes)
        };
        Ok(Self {
            total_distance: int(0..8),
            last_latitude: int(8..16),
            last_longitude: int(16..24),
            updated_at_ms: int(24..32),
        })
    }
}

/// Dual-tier location store: DashMap cache over a redb table.
#[derive(Clone)]
pub struct LocationStore {
    db: Arc<Database>,
    cache: Arc<DashMap<ChairId, ChairLocation>>,
}

impl LocationStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let txn = db.begin_write().context("failed to begin kv transaction")?;
        txn.open_table(LOCATIONS)
            .context("failed to open location table")?;
        txn.commit().context("failed to commit kv transaction")?;
        Ok(Self {
            db,
            cache: Arc::new(DashMap::new()),
        })
    }

    /// Fold a new coordinate ping into the chair's aggregate.
    ///
    /// Creates a zero-distance aggregate on the first ping; afterwards the
    /// Manhattan distance from the previous point accrues into
    /// `total_distance`. The KV write commits before the cache is refreshed.
    pub fn update(
        &self,
        chair_id: ChairId,
        coordinate: Coordinate,
        now_ms: i64,
    ) -> Result<ChairLocation> {
        let key = chair_id.to_string();
        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        let location = {
            let mut table = txn
                .open_table(LOCATIONS)
                .context("failed to open location table")?;
            let prior = match table.get(key.as_str())? {
                Some(guard) => Some(ChairLocation::decode(guard.value())?),
                None => None,
            };
            let next = match prior {
                None => ChairLocation {
                    total_distance: 0,
                    last_latitude: coordinate.latitude,
                    last_longitude: coordinate.longitude,
                    updated_at_ms: now_ms,
                },
                Some(prior) => ChairLocation {
                    total_distance: prior.total_distance
                        + prior.last_coordinate().manhattan_distance(&coordinate),
                    last_latitude: coordinate.latitude,
                    last_longitude: coordinate.longitude,
                    updated_at_ms: now_ms,
                },
            };
            table.insert(key.as_str(), next.encode().as_slice())?;
            next
        };
        txn.commit().context("failed to commit kv transaction")?;

        self.cache.insert(chair_id, location);
        Ok(location)
    }

    /// Latest aggregate for a chair, or `None` if it never pinged.
    pub fn get(&self, chair_id: ChairId) -> Result<Option<ChairLocation>> {
        if let Some(hit) = self.cache.get(&chair_id) {
            return Ok(Some(*hit));
        }

        let key = chair_id.to_string();
        let txn = self
            .db
            .begin_read()
            .context("failed to begin kv read transaction")?;
        let table = txn
            .open_table(LOCATIONS)
            .context("failed to open location table")?;
        let location = match table.get(key.as_str())? {
            Some(guard) => ChairLocation::decode(guard.value())?,
            None => return Ok(None),
        };
        self.cache.insert(chair_id, location);
        Ok(Some(location))
    }

    /// Aggregates for many chairs; absent chairs are omitted.
    pub fn get_many(&self, chair_ids: &[ChairId]) -> Result<HashMap<ChairId, ChairLocation>> {
        let mut out = HashMap::with_capacity(chair_ids.len());
        for &chair_id in chair_ids {
            if let Some(location) = self.get(chair_id)? {
                out.insert(chair_id, location);
            }
        }
        Ok(out)
    }

    /// Drop every record, on-disk and in-memory.
    pub fn reset(&self) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        txn.delete_table(LOCATIONS)
            .context("failed to clear location table")?;
        txn.open_table(LOCATIONS)
            .context("failed to recreate location table")?;
        txn.commit().context("failed to commit kv transaction")?;
        self.cache.clear();
        Ok(())
    }

    /// Rebuild every aggregate from the relational location journal.
    pub async fn rebuild(&self, pool: &PgPool) -> Result<()> {
        let totals: Vec<(ChairId, i64, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            "SELECT chair_id,
                    COALESCE(SUM(distance), 0)::BIGINT AS total_distance,
                    MAX(created_at) AS updated_at
             FROM (
                 SELECT chair_id,
                        created_at,
                        ABS(latitude - LAG(latitude) OVER w)
                          + ABS(longitude - LAG(longitude) OVER w) AS distance
                 FROM chair_locations
                 WINDOW w AS (PARTITION BY chair_id ORDER BY created_at)
             ) per_ping
             GROUP BY chair_id",
        )
        .fetch_all(pool)
        .await
        .context("failed to aggregate chair location journal")?;

        let latest: Vec<(ChairId, i64, i64)> = sqlx::query_as(
            "SELECT DISTINCT ON (chair_id) chair_id, latitude, longitude
             FROM chair_locations
             ORDER BY chair_id, created_at DESC",
        )
        .fetch_all(pool)
        .await
        .context("failed to load latest chair coordinates")?;

        let latest_by_chair: HashMap<ChairId, Coordinate> = latest
            .into_iter()
            .map(|(chair_id, lat, lon)| (chair_id, Coordinate::new(lat, lon)))
            .collect();

        self.reset()?;

        let txn = self
            .db
            .begin_write()
            .context("failed to begin kv transaction")?;
        {
            let mut table = txn
                .open_table(LOCATIONS)
                .context("failed to open location table")?;
            for (chair_id, total_distance, updated_at) in &totals {
                let Some(last) = latest_by_chair.get(chair_id) else {
                    continue;
                };
                let location = ChairLocation {
                    total_distance: *total_distance,
                    last_latitude: last.latitude,
                    last_longitude: last.longitude,
                    updated_at_ms: updated_at.timestamp_millis(),
                };
                table.insert(chair_id.to_string().as_str(), location.encode().as_slice())?;
                self.cache.insert(*chair_id, location);
            }
        }
        txn.commit().context("failed to commit kv transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (LocationStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        (LocationStore::new(Arc::new(db)).unwrap(), dir)
    }

    #[test]
    fn test_first_ping_starts_at_zero_distance() {
        let (store, _dir) = store();
        let chair = ChairId::new();

        let loc = store.update(chair, Coordinate::new(3, 4), 1_000).unwrap();
        assert_eq!(loc.total_distance, 0);
        assert_eq!(loc.last_coordinate(), Coordinate::new(3, 4));
        assert_eq!(loc.updated_at_ms, 1_000);
    }

    #[test]
    fn test_total_distance_accumulates_manhattan_steps() {
        let (store, _dir) = store();
        let chair = ChairId::new();

        store.update(chair, Coordinate::new(0, 0), 1).unwrap();
        store.update(chair, Coordinate::new(3, 4), 2).unwrap();
        let loc = store.update(chair, Coordinate::new(3, 10), 3).unwrap();

        assert_eq!(loc.total_distance, 7 + 6);
        assert_eq!(loc.last_coordinate(), Coordinate::new(3, 10));
    }

    #[test]
    fn test_total_distance_never_decreases() {
        let (store, _dir) = store();
        let chair = ChairId::new();

        let mut prev = 0;
        let pings = [(0, 0), (5, 5), (5, 5), (0, 0), (-3, 2)];
        for (i, (lat, lon)) in pings.iter().enumerate() {
            let loc = store
                .update(chair, Coordinate::new(*lat, *lon), i as i64)
                .unwrap();
            assert!(loc.total_distance >= prev);
            prev = loc.total_distance;
        }
    }

    #[test]
    fn test_get_unknown_chair_is_absent() {
        let (store, _dir) = store();
        assert_eq!(store.get(ChairId::new()).unwrap(), None);
    }

    #[test]
    fn test_get_survives_cache_clear() {
        let (store, _dir) = store();
        let chair = ChairId::new();
        store.update(chair, Coordinate::new(7, 7), 42).unwrap();

        // Simulate a cold cache: the disk tier must serve the read
        store.cache.clear();
        let loc = store.get(chair).unwrap().unwrap();
        assert_eq!(loc.last_coordinate(), Coordinate::new(7, 7));
    }

    #[test]
    fn test_get_many_omits_absent() {
        let (store, _dir) = store();
        let known = ChairId::new();
        let unknown = ChairId::new();
        store.update(known, Coordinate::new(1, 2), 9).unwrap();

        let out = store.get_many(&[known, unknown]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(&known));
    }

    #[test]
    fn test_reset_clears_both_tiers() {
        let (store, _dir) = store();
        let chair = ChairId::new();
        store.update(chair, Coordinate::new(1, 1), 5).unwrap();

        store.reset().unwrap();
        assert_eq!(store.get(chair).unwrap(), None);
    }

    #[test]
    fn test_record_roundtrip() {
        let loc = ChairLocation {
            total_distance: i64::MAX,
            last_latitude: -42,
            last_longitude: 17,
            updated_at_ms: 1_700_000_000_000,
        };
        assert_eq!(ChairLocation::decode(&loc.encode()).unwrap(), loc);
        assert!(ChairLocation::decode(&[0u8; 31]).is_err());
    }
}
