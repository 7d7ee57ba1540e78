//! Attempt Finalizer — records an attempt's outcome, applies retry policy,
//! and hands off to the Workflow Coordinator (§4.6).

use chrono::Utc;
use sqlx::Row;
use tracing::{info, warn};

use crate::error::ReproqError;
use crate::kernel::Engine;
use crate::model::task_run::ErrorRecord;
use crate::model::TaskStatus;

/// The result an executor reports back for one claimed attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(serde_json::Value),
    Failed { kind: String, message: Option<String>, traceback: Option<String> },
    Cancelled,
}

/// Maximum retry backoff; the curve is bounded and non-decreasing per §4.6.
const MAX_BACKOFF_SECONDS: i64 = 3600;
const BASE_BACKOFF_SECONDS: i64 = 15;

fn backoff(attempts: i32) -> chrono::Duration {
    let exp = attempts.max(1).min(16) as u32 - 1;
    let seconds = BASE_BACKOFF_SECONDS.saturating_mul(1i64 << exp).min(MAX_BACKOFF_SECONDS);
    chrono::Duration::seconds(seconds)
}

/// Finalize one attempt. `worker_id` must match the row's current
/// `leased_by`; a mismatch (or a row no longer `RUNNING`) means reclaim won
/// the race for this row, so the write is silently abandoned (§7 "Lease
/// loss is silent for the loser").
///
/// Returns `Ok(None)` when the write was abandoned for that reason,
/// `Ok(Some(new_status))` otherwise.
pub async fn finalize(
    engine: &Engine,
    result_id: i64,
    worker_id: &str,
    outcome: Outcome,
) -> anyhow::Result<Option<TaskStatus>> {
    let now = Utc::now();
    let mut tx = engine.db.begin().await?;

    let row = sqlx::query(
        "SELECT status, attempts, max_attempts, errors, leased_by, workflow_id, parent_id, wait_count \
         FROM task_runs WHERE result_id = $1 FOR UPDATE",
    )
    .bind(result_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        warn!(result_id, "finalize: row no longer exists");
        return Ok(None);
    };

    let current_status: TaskStatus = row.try_get("status")?;
    let leased_by: Option<String> = row.try_get("leased_by")?;
    let attempts: i32 = row.try_get("attempts")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    let errors: serde_json::Value = row.try_get("errors")?;

    if current_status != TaskStatus::Running || leased_by.as_deref() != Some(worker_id) {
        warn!(result_id, worker_id, ?current_status, ?leased_by, "finalize: lease no longer owned, abandoning write");
        tx.rollback().await?;
        return Ok(None);
    }

    let mut errors_array = errors.as_array().cloned().unwrap_or_default();
    let new_status = match outcome {
        Outcome::Ok(value) => {
            sqlx::query(
                "UPDATE task_runs SET status = 'SUCCESSFUL', finished_at = $1, return_value = $2, \
                 leased_until = NULL, leased_by = NULL, updated_at = $1 WHERE result_id = $3",
            )
            .bind(now)
            .bind(&value)
            .bind(result_id)
            .execute(&mut *tx)
            .await?;
            TaskStatus::Successful
        }
        Outcome::Cancelled => {
            errors_array.push(serde_json::to_value(ErrorRecord::cancelled())?);
            sqlx::query(
                "UPDATE task_runs SET status = 'CANCELLED', finished_at = $1, errors = $2, \
                 leased_until = NULL, leased_by = NULL, updated_at = $1 WHERE result_id = $3",
            )
            .bind(now)
            .bind(serde_json::Value::Array(errors_array))
            .bind(result_id)
            .execute(&mut *tx)
            .await?;
            TaskStatus::Cancelled
        }
        Outcome::Failed { kind, message, traceback } => {
            let mut record = ErrorRecord::new(kind, message);
            record.traceback = traceback;
            errors_array.push(serde_json::to_value(record)?);

            if attempts < max_attempts {
                // Retryable: back to READY. `started_at` is preserved (not
                // cleared) so it continues to reflect the time of the
                // task's first attempt across retries, distinguishing an
                // ordinary retry from a reclaim-driven restart (§9).
                let run_after = now + backoff(attempts);
                sqlx::query(
                    "UPDATE task_runs SET status = 'READY', errors = $1, run_after = $2, \
                     leased_until = NULL, leased_by = NULL, updated_at = $3 WHERE result_id = $4",
                )
                .bind(serde_json::Value::Array(errors_array))
                .bind(run_after)
                .bind(now)
                .bind(result_id)
                .execute(&mut *tx)
                .await?;
                TaskStatus::Ready
            } else {
                sqlx::query(
                    "UPDATE task_runs SET status = 'FAILED', finished_at = $1, errors = $2, \
                     leased_until = NULL, leased_by = NULL, updated_at = $1 WHERE result_id = $3",
                )
                .bind(now)
                .bind(serde_json::Value::Array(errors_array))
                .bind(result_id)
                .execute(&mut *tx)
                .await?;
                TaskStatus::Failed
            }
        }
    };

    if new_status.is_terminal() {
        let workflow_id: Option<uuid::Uuid> = row.try_get("workflow_id")?;
        let parent_id: Option<i64> = row.try_get("parent_id")?;
        crate::workflow::on_finalized(&mut tx, result_id, new_status, workflow_id, parent_id).await?;
    }

    tx.commit().await?;
    info!(result_id, worker_id, ?new_status, "attempt finalized");
    Ok(Some(new_status))
}

/// Mark a row for cooperative cancellation. The executor is expected to
/// observe `cancel_requested` and report [`Outcome::Cancelled`]; this alone
/// does not change `status`.
pub async fn request_cancel(engine: &Engine, result_id: i64) -> Result<(), ReproqError> {
    sqlx::query("UPDATE task_runs SET cancel_requested = TRUE, updated_at = NOW() WHERE result_id = $1")
        .bind(result_id)
        .execute(&engine.db)
        .await
        .map_err(|e| ReproqError::ValidationError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_non_decreasing() {
        let mut prev = chrono::Duration::zero();
        for attempts in 1..12 {
            let cur = backoff(attempts);
            assert!(cur >= prev, "backoff decreased at attempts={attempts}");
            prev = cur;
        }
    }

    #[test]
    fn backoff_is_bounded() {
        for attempts in 1..30 {
            assert!(backoff(attempts) <= chrono::Duration::seconds(MAX_BACKOFF_SECONDS));
        }
    }

    #[test]
    fn backoff_starts_at_base() {
        assert_eq!(backoff(1), chrono::Duration::seconds(BASE_BACKOFF_SECONDS));
    }
}
