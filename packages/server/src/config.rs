use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Path of the embedded key-value store backing the location and status
    /// stores across restarts.
    pub kv_path: String,
    /// Dispatcher tick period. Kept in the 10-100ms band.
    pub matching_interval: Duration,
    /// Optional external reset script run by POST /api/initialize.
    pub init_script: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let matching_interval_ms = env::var("MATCHING_INTERVAL_MS")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<u64>()
            .context("MATCHING_INTERVAL_MS must be a valid number")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            kv_path: env::var("KV_PATH").unwrap_or_else(|_| "./chairway.redb".to_string()),
            matching_interval: Duration::from_millis(matching_interval_ms.clamp(10, 100)),
            init_script: env::var("INIT_SCRIPT").ok().filter(|s| !s.is_empty()),
        })
    }
}
