//! The engine handle: a database pool plus the immutable configuration,
//! shared by every component (producer, claim engine, lease manager,
//! reaper, finalizer, workflow coordinator, scheduler).

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Holds the sole database connection pool and the engine's configuration.
///
/// Cheap to clone (an `Arc<Config>` and a `PgPool`, which is itself a
/// handle around a connection pool).
#[derive(Clone)]
pub struct Engine {
    pub db: PgPool,
    pub config: Arc<Config>,
}

impl Engine {
    /// Connect to Postgres and run pending migrations.
    pub async fn connect(config: Config) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("failed to run migrations")?;

        Ok(Self {
            db,
            config: Arc::new(config),
        })
    }

    /// Wrap an already-open pool without running migrations (used by tests
    /// that run migrations once against a shared container).
    pub fn from_pool(db: PgPool, config: Config) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }
}
