//! Postgres connection settings and migrations

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

use crate::error::{StoreError, StoreResult};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Pool settings for the record store
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Off when connecting through a transaction-mode pooler, which cannot
    /// hold prepared statements across transactions
    pub statement_cache: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            statement_cache: true,
        }
    }

    /// `DATABASE_URL` is required. `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_STATEMENT_CACHE` are optional.
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| StoreError::Config("DATABASE_URL not set".to_string()))?;

        let mut config = Self::new(url);
        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| StoreError::Config(format!("DATABASE_MAX_CONNECTIONS must be a positive integer, got {raw:?}")))?;
        }
        if let Ok(raw) = std::env::var("DATABASE_STATEMENT_CACHE") {
            config.statement_cache = !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off");
        }
        Ok(config)
    }

    fn connect_options(&self) -> StoreResult<PgConnectOptions> {
        let options = PgConnectOptions::from_str(&self.url).map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(if self.statement_cache {
            options
        } else {
            options.statement_cache_capacity(0)
        })
    }

    pub async fn connect(&self) -> StoreResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .min_connections(0)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Duration::from_secs(60))
            .connect_with(self.connect_options()?)
            .await?;
        tracing::debug!(max_connections = self.max_connections, "Database pool ready");
        Ok(pool)
    }
}

/// Apply pending schema migrations
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
}
