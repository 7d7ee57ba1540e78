//! `QueueControl` — per-queue pause switch (§3).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::kernel::Engine;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueControl {
    pub queue_name: String,
    pub paused: bool,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl QueueControl {
    pub async fn pause(queue_name: &str, reason: Option<&str>, engine: &Engine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_controls (queue_name, paused, reason)
            VALUES ($1, TRUE, $2)
            ON CONFLICT (queue_name) DO UPDATE SET paused = TRUE, reason = EXCLUDED.reason, updated_at = NOW()
            "#,
        )
        .bind(queue_name)
        .bind(reason)
        .execute(&engine.db)
        .await?;
        Ok(())
    }

    pub async fn resume(queue_name: &str, engine: &Engine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_controls (queue_name, paused, reason)
            VALUES ($1, FALSE, NULL)
            ON CONFLICT (queue_name) DO UPDATE SET paused = FALSE, reason = NULL, updated_at = NOW()
            "#,
        )
        .bind(queue_name)
        .execute(&engine.db)
        .await?;
        Ok(())
    }

    pub async fn is_paused(queue_name: &str, engine: &Engine) -> Result<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_controls WHERE queue_name = $1")
                .bind(queue_name)
                .fetch_optional(&engine.db)
                .await?;
        Ok(paused.unwrap_or(false))
    }
}
