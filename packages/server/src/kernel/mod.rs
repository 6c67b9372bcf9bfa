//! Process singletons: stores, caches, pools, event hub, dispatcher, payment
//! client. One `AppKernel` owns all of them for the life of the process;
//! `POST /api/initialize` rebuilds the lot from the relational store.

pub mod caches;
pub mod dispatcher;
pub mod hub;
pub mod location_store;
pub mod match_pool;
pub mod payment;
pub mod status_store;

pub use caches::Caches;
pub use dispatcher::{
    pair_score, plan_matches, run_matching_tick, spawn_dispatcher, ChairCandidate, RideCandidate,
};
pub use hub::{RideEvent, RideHub};
pub use location_store::{ChairLocation, LocationStore};
pub use match_pool::MatchPools;
pub use payment::{PaymentError, PaymentGatewayClient};
pub use status_store::StatusStore;

use std::sync::Arc;

use anyhow::{Context, Result};
use redb::Database;
use sqlx::PgPool;

use crate::config::Config;

pub struct AppKernel {
    pub config: Config,
    pub pool: PgPool,
    pub locations: LocationStore,
    pub statuses: StatusStore,
    pub caches: Caches,
    pub pools: MatchPools,
    pub hub: RideHub,
    pub payment: PaymentGatewayClient,
}

impl AppKernel {
    pub fn new(config: Config, pool: PgPool) -> Result<Self> {
        let db = Arc::new(
            Database::create(&config.kv_path)
                .with_context(|| format!("failed to open kv store at {}", config.kv_path))?,
        );
        Ok(Self {
            locations: LocationStore::new(db.clone())?,
            statuses: StatusStore::new(db)?,
            caches: Caches::new(),
            pools: MatchPools::new(),
            hub: RideHub::new(),
            payment: PaymentGatewayClient::new(),
            config,
            pool,
        })
    }

    /// Rebuild every in-process structure from the relational store. Run at
    /// startup and by the initializer.
    pub async fn rebuild(&self) -> Result<()> {
        self.locations
            .rebuild(&self.pool)
            .await
            .context("failed to rebuild location store")?;
        self.statuses
            .rebuild(&self.pool)
            .await
            .context("failed to rebuild status store")?;
        self.caches
            .rebuild(&self.pool)
            .await
            .context("failed to rebuild caches")?;
        self.pools
            .rebuild(&self.pool)
            .await
            .context("failed to rebuild matching pools")?;
        self.hub.reset().await;
        Ok(())
    }

    /// Payment gateway base URL, as set by the initializer.
    pub async fn payment_gateway_url(&self) -> Result<String> {
        let (url,): (String,) =
            sqlx::query_as("SELECT value FROM settings WHERE name = 'payment_gateway_url'")
                .fetch_one(&self.pool)
                .await
                .context("payment gateway url is not configured")?;
        Ok(url)
    }
}
