//! `PeriodicTask` — cron schedule registry (§3, §4.8).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::kernel::Engine;
use crate::model::record::Record;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub name: String,
    pub cron_expr: String,
    pub task_path: String,
    pub payload: serde_json::Value,
    pub queue_name: String,
    pub priority: i16,
    pub max_attempts: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ALL_COLUMNS: &str = "name, cron_expr, task_path, payload, queue_name, priority, max_attempts, \
    last_run_at, next_run_at, enabled, created_at, updated_at";

impl PeriodicTask {
    /// Upsert from the declarative registry; disabled rather than deleted
    /// when an entry drops out of the registry (§3 lifecycle note).
    pub async fn register(
        name: &str,
        cron_expr: &str,
        task_path: &str,
        payload: serde_json::Value,
        queue_name: &str,
        priority: i16,
        max_attempts: i32,
        next_run_at: DateTime<Utc>,
        engine: &Engine,
    ) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO periodic_tasks (name, cron_expr, task_path, payload, queue_name, priority, max_attempts, next_run_at, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
            ON CONFLICT (name) DO UPDATE SET
                cron_expr = EXCLUDED.cron_expr,
                task_path = EXCLUDED.task_path,
                payload = EXCLUDED.payload,
                queue_name = EXCLUDED.queue_name,
                priority = EXCLUDED.priority,
                max_attempts = EXCLUDED.max_attempts,
                enabled = TRUE,
                updated_at = NOW()
            RETURNING {ALL_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(cron_expr)
        .bind(task_path)
        .bind(payload)
        .bind(queue_name)
        .bind(priority)
        .bind(max_attempts)
        .bind(next_run_at)
        .fetch_one(&engine.db)
        .await?;
        Ok(row)
    }

    pub async fn disable(name: &str, engine: &Engine) -> Result<()> {
        sqlx::query("UPDATE periodic_tasks SET enabled = FALSE, updated_at = NOW() WHERE name = $1")
            .bind(name)
            .execute(&engine.db)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Record for PeriodicTask {
    const TABLE: &'static str = "periodic_tasks";
    type Id = String;

    async fn find_by_id(id: String, engine: &Engine) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ALL_COLUMNS} FROM periodic_tasks WHERE name = $1"
        ))
        .bind(id)
        .fetch_optional(&engine.db)
        .await?;
        Ok(row)
    }

    async fn insert(&self, engine: &Engine) -> Result<Self> {
        Self::register(
            &self.name,
            &self.cron_expr,
            &self.task_path,
            self.payload.clone(),
            &self.queue_name,
            self.priority,
            self.max_attempts,
            self.next_run_at,
            engine,
        )
        .await
    }

    async fn update(&self, engine: &Engine) -> Result<Self> {
        self.insert(engine).await
    }

    async fn delete(&self, engine: &Engine) -> Result<()> {
        Self::disable(&self.name, engine).await
    }
}
