//! Test harness with testcontainers for integration testing.
//!
//! Uses a shared Postgres container across all tests for fast test runs.
//! The container and migrations are started once on the first test, then
//! reused; each test gets its own connection pool and its own `Config`.

use anyhow::{Context, Result};
use reproq::{Config, Engine};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use testcontainers::ContainerAsync;
use tokio::sync::OnceCell;

struct SharedTestInfra {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect to Postgres for migrations")?;
        sqlx::migrate!("./migrations").run(&pool).await.context("failed to run migrations")?;
        pool.close().await;

        Ok(Self { db_url, _postgres: postgres })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA.get_or_init(|| async { Self::init().await.expect("shared test infra init") }).await
    }
}

/// Per-test harness: a fresh pool against the shared container, with a
/// `Config` allowing the `default` and `other` queues and no wait between
/// polls, tuned for fast test iteration rather than production defaults.
pub struct TestHarness {
    pub engine: Engine,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let db_pool = PgPool::connect(&infra.db_url).await.context("failed to connect to test database")?;

        let mut queue_aliases = HashMap::new();
        queue_aliases.insert("*".to_string(), "default".to_string());

        let config = Config {
            database_url: infra.db_url.clone(),
            allowed_queues: vec!["default".to_string(), "other".to_string()],
            queue_aliases,
            lease_seconds: 60,
            heartbeat_seconds: 1,
            shutdown_timeout: Duration::from_secs(1),
            reclaim_interval_seconds: 1,
            reclaim_grace_seconds: 0,
            reclaim_include_null_lease: true,
            reclaim_limit: 500,
            poll_min_backoff: Duration::from_millis(10),
            poll_max_backoff: Duration::from_millis(100),
            scheduler_tick: Duration::from_secs(1),
            max_payload_bytes: 1_048_576,
            priority_aging_factor_seconds: 0,
            executor_path: "reproq-executor".to_string(),
        };

        Ok(Self { engine: Engine::from_pool(db_pool, config) })
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("failed to create test harness")
    }

    async fn teardown(self) {
        self.engine.db.close().await;
    }
}
