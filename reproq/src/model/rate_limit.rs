//! `RateLimit` — token-bucket state per logical key (§3), consumed
//! transactionally by the claim engine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::kernel::Engine;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RateLimit {
    pub key: String,
    pub tokens_per_second: f64,
    pub burst_size: f64,
    pub current_tokens: f64,
    pub last_refilled_at: DateTime<Utc>,
}

impl RateLimit {
    pub async fn configure(key: &str, tokens_per_second: f64, burst_size: f64, engine: &Engine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (key, tokens_per_second, burst_size, current_tokens)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (key) DO UPDATE SET
                tokens_per_second = EXCLUDED.tokens_per_second,
                burst_size = EXCLUDED.burst_size
            "#,
        )
        .bind(key)
        .bind(tokens_per_second)
        .bind(burst_size)
        .execute(&engine.db)
        .await?;
        Ok(())
    }

    pub async fn find(key: &str, engine: &Engine) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT key, tokens_per_second, burst_size, current_tokens, last_refilled_at FROM rate_limits WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&engine.db)
        .await?;
        Ok(row)
    }

    /// Refill then attempt to take one token, entirely within the caller's
    /// transaction and row lock (§4.3 refill formula, §9 open question 3:
    /// `tokens_per_second = 0` is treated as "disabled").
    ///
    /// Returns `true` if a token was consumed.
    pub async fn try_consume(key: &str, tx: &mut sqlx::PgConnection) -> Result<bool> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT key, tokens_per_second, burst_size, current_tokens, last_refilled_at \
             FROM rate_limits WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(bucket) = row else {
            // No configured bucket for this key: unbounded.
            return Ok(true);
        };

        if bucket.tokens_per_second <= 0.0 {
            return Ok(true);
        }

        let now = Utc::now();
        let elapsed = (now - bucket.last_refilled_at).num_milliseconds().max(0) as f64 / 1000.0;
        let refilled = (bucket.current_tokens + elapsed * bucket.tokens_per_second).min(bucket.burst_size);

        if refilled < 1.0 {
            sqlx::query("UPDATE rate_limits SET current_tokens = $1, last_refilled_at = $2 WHERE key = $3")
                .bind(refilled)
                .bind(now)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            return Ok(false);
        }

        sqlx::query("UPDATE rate_limits SET current_tokens = $1, last_refilled_at = $2 WHERE key = $3")
            .bind(refilled - 1.0)
            .bind(now)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        Ok(true)
    }
}
