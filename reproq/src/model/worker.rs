//! `Worker` — heartbeat record for a running worker process (§3, §4.4).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::kernel::Engine;
use crate::model::record::Record;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub hostname: String,
    pub concurrency: i32,
    pub queues: Vec<String>,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, hostname: impl Into<String>, concurrency: i32, queues: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            concurrency,
            queues,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: now,
            last_seen_at: now,
        }
    }

    /// Create-or-update this worker's heartbeat row.
    pub async fn upsert(&self, engine: &Engine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reproq_workers (worker_id, hostname, concurrency, queues, version, started_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(&self.worker_id)
        .bind(&self.hostname)
        .bind(self.concurrency)
        .bind(&self.queues)
        .bind(&self.version)
        .bind(self.started_at)
        .bind(self.last_seen_at)
        .execute(&engine.db)
        .await?;
        Ok(())
    }

    /// Heartbeat tick: bump `last_seen_at` for this worker.
    pub async fn touch(worker_id: &str, engine: &Engine) -> Result<()> {
        sqlx::query("UPDATE reproq_workers SET last_seen_at = NOW() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&engine.db)
            .await?;
        Ok(())
    }

    /// Remove workers that have not heartbeat within `inactive_for`.
    pub async fn prune_inactive(inactive_for_seconds: i64, engine: &Engine) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM reproq_workers WHERE last_seen_at < NOW() - make_interval(secs => $1)",
        )
        .bind(inactive_for_seconds as f64)
        .execute(&engine.db)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl Record for Worker {
    const TABLE: &'static str = "reproq_workers";
    type Id = String;

    async fn find_by_id(id: String, engine: &Engine) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT worker_id, hostname, concurrency, queues, version, started_at, last_seen_at \
             FROM reproq_workers WHERE worker_id = $1",
        )
        .bind(id)
        .fetch_optional(&engine.db)
        .await?;
        Ok(row)
    }

    async fn insert(&self, engine: &Engine) -> Result<Self> {
        self.upsert(engine).await?;
        Ok(self.clone())
    }

    async fn update(&self, engine: &Engine) -> Result<Self> {
        self.upsert(engine).await?;
        Ok(self.clone())
    }

    async fn delete(&self, engine: &Engine) -> Result<()> {
        sqlx::query("DELETE FROM reproq_workers WHERE worker_id = $1")
            .bind(&self.worker_id)
            .execute(&engine.db)
            .await?;
        Ok(())
    }
}
