//! Reclaim / Reaper — detects expired leases and requeues or fails
//! orphaned `RUNNING` rows (§4.5). Safe to run in a process distinct from
//! any worker, and safe to run as multiple concurrent replicas.

use chrono::Utc;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel::{Engine, Service};
use crate::model::task_run::ErrorRecord;

/// One sweep: reclaim up to `engine.config.reclaim_limit` rows whose lease
/// has expired (past `reclaim_grace_seconds`) or, if configured, whose
/// lease is NULL (crash before any heartbeat landed), plus expire any
/// still-`READY` rows whose `expires_at` soft TTL has passed. Returns the
/// number of rows requeued and the number failed outright (lease-expiry
/// failures, TTL expiries, and lease-expired cancellations are all counted
/// as "failed").
///
/// `cancel_requested` rows are NOT excluded from the lease-expiry scan:
/// `LeaseManager::extend_leases` (lease.rs) stops renewing a row's lease
/// once cancellation is requested, so in the common case the owning
/// worker's own heartbeat-interval poll (executor.rs) observes the flag
/// and finalizes the row as `CANCELLED` well before the lease actually
/// expires. But if that worker crashed or otherwise never observed the
/// flag, excluding these rows here would leave them `RUNNING` forever —
/// leased_until stuck in the past, never reclaimed — violating §3
/// invariant 3. Once the lease does expire, this sweep is the fallback
/// path that terminally resolves them to `CANCELLED` regardless of
/// `attempts`/`max_attempts`.
pub async fn sweep(engine: &Engine) -> anyhow::Result<(u64, u64)> {
    let now = Utc::now();
    let grace = chrono::Duration::seconds(engine.config.reclaim_grace_seconds);
    let cutoff = now - grace;

    let mut tx = engine.db.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT result_id, attempts, max_attempts, workflow_id, parent_id, cancel_requested
        FROM task_runs
        WHERE status = 'RUNNING'
          AND (leased_until < $1 OR ($2 AND leased_until IS NULL))
        ORDER BY leased_until ASC NULLS FIRST
        LIMIT $3
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(cutoff)
    .bind(engine.config.reclaim_include_null_lease)
    .bind(engine.config.reclaim_limit)
    .fetch_all(&mut *tx)
    .await?;

    let mut requeued = 0u64;
    let mut failed = 0u64;

    for row in rows {
        let result_id: i64 = row.try_get("result_id")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let workflow_id: Option<uuid::Uuid> = row.try_get("workflow_id")?;
        let parent_id: Option<i64> = row.try_get("parent_id")?;
        let cancel_requested: bool = row.try_get("cancel_requested")?;

        if cancel_requested {
            let error = serde_json::to_value(ErrorRecord::cancelled())?;
            sqlx::query(
                "UPDATE task_runs SET status = 'CANCELLED', finished_at = $1, \
                 leased_until = NULL, leased_by = NULL, errors = errors || $2::jsonb, updated_at = $1 \
                 WHERE result_id = $3",
            )
            .bind(now)
            .bind(serde_json::Value::Array(vec![error]))
            .bind(result_id)
            .execute(&mut *tx)
            .await?;
            failed += 1;
            crate::workflow::on_finalized(&mut tx, result_id, crate::model::TaskStatus::Cancelled, workflow_id, parent_id).await?;
            continue;
        }

        let error = serde_json::to_value(ErrorRecord::lease_expired())?;

        if attempts < max_attempts {
            sqlx::query(
                "UPDATE task_runs SET status = 'READY', run_after = $1, \
                 leased_until = NULL, leased_by = NULL, started_at = NULL, finished_at = NULL, \
                 errors = errors || $2::jsonb, updated_at = $1 \
                 WHERE result_id = $3",
            )
            .bind(now)
            .bind(serde_json::Value::Array(vec![error]))
            .bind(result_id)
            .execute(&mut *tx)
            .await?;
            requeued += 1;
        } else {
            sqlx::query(
                "UPDATE task_runs SET status = 'FAILED', finished_at = $1, last_attempted_at = $1, \
                 leased_until = NULL, leased_by = NULL, errors = errors || $2::jsonb, updated_at = $1 \
                 WHERE result_id = $3",
            )
            .bind(now)
            .bind(serde_json::Value::Array(vec![error]))
            .bind(result_id)
            .execute(&mut *tx)
            .await?;
            failed += 1;
            crate::workflow::on_finalized(&mut tx, result_id, crate::model::TaskStatus::Failed, workflow_id, parent_id).await?;
        }
    }

    let expired_rows = sqlx::query(
        r#"
        SELECT result_id, workflow_id, parent_id
        FROM task_runs
        WHERE status = 'READY'
          AND expires_at IS NOT NULL
          AND expires_at < $1
        ORDER BY expires_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(now)
    .bind(engine.config.reclaim_limit)
    .fetch_all(&mut *tx)
    .await?;

    for row in expired_rows {
        let result_id: i64 = row.try_get("result_id")?;
        let workflow_id: Option<uuid::Uuid> = row.try_get("workflow_id")?;
        let parent_id: Option<i64> = row.try_get("parent_id")?;
        let error = serde_json::to_value(ErrorRecord::expired())?;

        sqlx::query(
            "UPDATE task_runs SET status = 'FAILED', finished_at = $1, last_attempted_at = $1, \
             errors = errors || $2::jsonb, updated_at = $1 \
             WHERE result_id = $3",
        )
        .bind(now)
        .bind(serde_json::Value::Array(vec![error]))
        .bind(result_id)
        .execute(&mut *tx)
        .await?;
        failed += 1;
        crate::workflow::on_finalized(&mut tx, result_id, crate::model::TaskStatus::Failed, workflow_id, parent_id).await?;
    }

    tx.commit().await?;

    if requeued > 0 || failed > 0 {
        info!(requeued, failed, "reclaim sweep");
    }
    Ok((requeued, failed))
}

/// Runs `sweep` on a fixed interval as a background [`Service`].
pub struct Reaper {
    engine: Engine,
}

impl Reaper {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl Service for Reaper {
    fn name(&self) -> &str {
        "reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.engine.config.reclaim_interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = sweep(&self.engine).await {
                        warn!(error = %e, "reclaim sweep failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }
}
