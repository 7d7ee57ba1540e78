//! Periodic Scheduler — maintains `PeriodicTask` rows and feeds new
//! `TaskRun` specifications into the producer side on a cron schedule (§4.8).

use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kernel::{Engine, Service};
use crate::producer::{EnqueueSpec, ExecOptions, RunAfter};

/// Compute the first fire time strictly greater than `after` for a standard
/// 5-field cron expression.
pub fn next_after(cron_expr: &str, after: chrono::DateTime<Utc>) -> anyhow::Result<chrono::DateTime<Utc>> {
    let schedule = Schedule::from_str(cron_expr)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression {cron_expr} has no future occurrence"))
}

/// One tick: select due, enabled `PeriodicTask` rows (`FOR UPDATE SKIP
/// LOCKED` so multiple scheduler replicas cooperate safely), synthesize and
/// enqueue a `TaskRun` per row under the standard dedup rule, then advance
/// `last_run_at`/`next_run_at`.
pub async fn tick(engine: &Engine) -> anyhow::Result<u64> {
    let now = Utc::now();
    let mut tx = engine.db.begin().await?;

    let rows = sqlx::query(
        "SELECT name, cron_expr, task_path, payload, queue_name, priority, max_attempts \
         FROM periodic_tasks WHERE enabled = TRUE AND next_run_at <= $1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let mut fired = 0u64;
    for row in &rows {
        let name: String = row.try_get("name")?;
        let cron_expr: String = row.try_get("cron_expr")?;
        let task_path: String = row.try_get("task_path")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let queue_name: String = row.try_get("queue_name")?;
        let priority: i16 = row.try_get("priority")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        let next_run_at = match next_after(&cron_expr, now) {
            Ok(t) => t,
            Err(e) => {
                error!(name, cron_expr, error = %e, "periodic task has an unparseable cron expression");
                continue;
            }
        };

        sqlx::query("UPDATE periodic_tasks SET last_run_at = $1, next_run_at = $2, updated_at = $1 WHERE name = $3")
            .bind(now)
            .bind(next_run_at)
            .bind(&name)
            .execute(&mut *tx)
            .await?;

        fired += 1;

        // The synthesized enqueue runs on its own pool connection, not on
        // `tx`: it has its own dedup-then-insert-with-retry loop (§4.2),
        // which would poison this transaction if a unique violation were
        // raised on `tx` itself.
        let mut spec = EnqueueSpec::new(task_path, queue_name);
        spec.priority = priority;
        spec.exec = ExecOptions { timeout_seconds: 60, max_attempts };
        if let serde_json::Value::Object(kwargs) = payload {
            spec.kwargs = kwargs;
        }
        spec.run_after = RunAfter::Immediately;
        spec.provenance = Some(serde_json::Map::from_iter([(
            "periodic_task".to_string(),
            serde_json::json!(name),
        )]));

        match crate::producer::enqueue(engine, spec).await {
            Ok(handle) => info!(name = %name, result_id = handle.result_id, "periodic task fired"),
            Err(e) => warn!(name = %name, error = %e, "periodic task enqueue failed"),
        }
    }

    tx.commit().await?;
    Ok(fired)
}

/// Register or update a periodic task in the declarative registry. A name
/// dropping out of the registry should be disabled via
/// [`crate::model::PeriodicTask::disable`], not deleted, preserving history.
pub async fn register(
    engine: &Engine,
    name: &str,
    cron_expr: &str,
    task_path: &str,
    payload: serde_json::Value,
    queue_name: &str,
    priority: i16,
    max_attempts: i32,
) -> anyhow::Result<crate::model::PeriodicTask> {
    let next_run_at = next_after(cron_expr, Utc::now())?;
    crate::model::PeriodicTask::register(
        name, cron_expr, task_path, payload, queue_name, priority, max_attempts, next_run_at, engine,
    )
    .await
}

/// Runs `tick` on a fixed interval as a background [`Service`].
pub struct Scheduler {
    engine: Engine,
}

impl Scheduler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl Service for Scheduler {
    fn name(&self) -> &str {
        "periodic_scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.engine.config.scheduler_tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tick(&self.engine).await {
                        warn!(error = %e, "periodic scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_after_is_strictly_later() {
        let now = Utc::now();
        let next = next_after("0 * * * * *", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn next_after_rejects_malformed_expression() {
        assert!(next_after("not a cron expression", Utc::now()).is_err());
    }
}
