//! Claim engine — the atomic batch-claim operation workers poll with (§4.3).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::kernel::Engine;
use crate::model::TaskRun;

const ALL_COLUMNS: &str = "result_id, queue_name, priority, lock_key, concurrency_key, concurrency_limit, \
    task_path, spec, spec_hash, run_after, enqueued_at, expires_at, status, attempts, max_attempts, \
    timeout_seconds, started_at, last_attempted_at, finished_at, errors, return_value, worker_ids, \
    leased_until, leased_by, cancel_requested, parent_id, workflow_id, wait_count, logs_uri, \
    artifacts_uri, metadata, created_at, updated_at";

/// Atomically claim up to `max_n` READY rows from `queues` for `worker_id`,
/// honoring pause, lock-key exclusion, concurrency-key limits, and
/// rate-limit token consumption, all inside one transaction (§4.3).
///
/// The `FOR UPDATE SKIP LOCKED` candidate scan and the claiming UPDATE run
/// as one statement so a row is never visible as a candidate to two
/// concurrent claimers.
pub async fn claim(
    engine: &Engine,
    worker_id: &str,
    queues: &[String],
    max_n: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<TaskRun>> {
    if max_n <= 0 || queues.is_empty() {
        return Ok(Vec::new());
    }

    let lease_until = now + chrono::Duration::seconds(engine.config.lease_seconds);
    let aging = engine.config.priority_aging_factor_seconds;

    let mut tx = engine.db.begin().await?;

    // Candidate scan: READY, due, queue is neither paused nor excluded by an
    // already-running lock_key, with concurrency_key under its limit.
    // Ordering follows §4.3's four-level rule: effective priority (with
    // optional aging bonus), scheduled time, enqueue time, id as tiebreak.
    //
    // `lock_rank`/`conc_rank` rank same-key candidates by that same order,
    // so the "currently RUNNING" counts below combine with rank to bound
    // how many same-key rows THIS batch itself may promote together: a
    // plain "count of already-RUNNING rows < limit" check evaluated
    // per-row would let an entire batch of same-key candidates through at
    // once, since none of them are RUNNING yet at selection time. Locking
    // (`FOR UPDATE SKIP LOCKED`) happens in a second pass because window
    // functions cannot appear in the same SELECT as a locking clause.
    let rows = sqlx::query(&format!(
        r#"
        WITH scored AS (
            SELECT
                t.result_id,
                (t.priority + CASE WHEN $3::BIGINT > 0
                    THEN LEAST(EXTRACT(EPOCH FROM ($2 - t.enqueued_at))::BIGINT / $3::BIGINT, 1000)
                    ELSE 0 END) AS eff_priority,
                COALESCE(t.run_after, t.enqueued_at) AS order_time,
                t.enqueued_at,
                t.lock_key,
                t.concurrency_key,
                t.concurrency_limit,
                COALESCE((
                    SELECT COUNT(*) FROM task_runs r
                    WHERE r.lock_key = t.lock_key AND r.status = 'RUNNING'
                ), 0) AS lock_running,
                COALESCE((
                    SELECT COUNT(*) FROM task_runs r
                    WHERE r.concurrency_key = t.concurrency_key AND r.status = 'RUNNING'
                ), 0) AS conc_running,
                ROW_NUMBER() OVER (
                    PARTITION BY t.lock_key
                    ORDER BY (t.priority + CASE WHEN $3::BIGINT > 0
                        THEN LEAST(EXTRACT(EPOCH FROM ($2 - t.enqueued_at))::BIGINT / $3::BIGINT, 1000)
                        ELSE 0 END) DESC,
                        COALESCE(t.run_after, t.enqueued_at) ASC, t.enqueued_at ASC, t.result_id ASC
                ) AS lock_rank,
                ROW_NUMBER() OVER (
                    PARTITION BY t.concurrency_key
                    ORDER BY (t.priority + CASE WHEN $3::BIGINT > 0
                        THEN LEAST(EXTRACT(EPOCH FROM ($2 - t.enqueued_at))::BIGINT / $3::BIGINT, 1000)
                        ELSE 0 END) DESC,
                        COALESCE(t.run_after, t.enqueued_at) ASC, t.enqueued_at ASC, t.result_id ASC
                ) AS conc_rank
            FROM task_runs t
            WHERE t.status = 'READY'
              AND t.queue_name = ANY($1)
              AND (t.run_after IS NULL OR t.run_after <= $2)
              AND NOT EXISTS (
                  SELECT 1 FROM queue_controls qc
                  WHERE qc.queue_name = t.queue_name AND qc.paused
              )
        ),
        eligible AS (
            SELECT result_id
            FROM scored
            WHERE (lock_key IS NULL OR lock_running + lock_rank <= 1)
              AND (
                  concurrency_key IS NULL
                  OR concurrency_limit IS NULL
                  OR concurrency_limit = 0
                  OR conc_running + conc_rank <= concurrency_limit
              )
            ORDER BY eff_priority DESC, order_time ASC, enqueued_at ASC, result_id ASC
            LIMIT $4
        ),
        locked AS (
            SELECT result_id FROM task_runs
            WHERE result_id IN (SELECT result_id FROM eligible)
            FOR UPDATE SKIP LOCKED
        )
        UPDATE task_runs
        SET status = 'RUNNING',
            attempts = attempts + 1,
            started_at = COALESCE(started_at, $2),
            last_attempted_at = $2,
            leased_until = $5,
            leased_by = $6,
            worker_ids = array_append(worker_ids, $6),
            updated_at = $2
        WHERE result_id IN (SELECT result_id FROM locked) AND status = 'READY'
        RETURNING {ALL_COLUMNS}
        "#
    ))
    .bind(queues)
    .bind(now)
    .bind(aging)
    .bind(max_n)
    .bind(lease_until)
    .bind(worker_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in &rows {
        claimed.push(row_to_task_run(row)?);
    }

    // Rate limits are consumed per claimed row, keyed by queue_name. A row
    // whose bucket is exhausted is released back to READY rather than
    // committed as RUNNING, since the claiming UPDATE already ran.
    let mut accepted = Vec::with_capacity(claimed.len());
    let mut rejected_ids = Vec::new();
    for task in claimed {
        let allowed = crate::model::RateLimit::try_consume(&task.queue_name, &mut tx).await?;
        if allowed {
            accepted.push(task);
        } else {
            rejected_ids.push(task.result_id);
        }
    }

    if !rejected_ids.is_empty() {
        sqlx::query(
            "UPDATE task_runs SET status = 'READY', started_at = NULL, last_attempted_at = NULL, \
             leased_until = NULL, leased_by = NULL, attempts = attempts - 1, \
             worker_ids = worker_ids[1:array_length(worker_ids, 1) - 1] \
             WHERE result_id = ANY($1)",
        )
        .bind(&rejected_ids)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    debug!(worker_id, claimed = accepted.len(), rate_limited = rejected_ids.len(), "claim batch");
    Ok(accepted)
}

fn row_to_task_run(row: &sqlx::postgres::PgRow) -> anyhow::Result<TaskRun> {
    use sqlx::FromRow;
    Ok(TaskRun::from_row(row)?)
}

/// Bounded exponential backoff with full jitter, applied by a worker's poll
/// loop when a claim attempt returns zero candidates (§4.3).
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, attempt: 0 }
    }

    /// Reset to the minimum delay after a successful (non-empty) claim.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay to sleep before the next poll, advancing the backoff state.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.min.as_millis().saturating_mul(1u128 << self.attempt.min(20));
        let capped = exp.min(self.max.as_millis());
        self.attempt = self.attempt.saturating_add(1);

        let jittered = rand::thread_rng().gen_range(0..=capped.max(1)) as u64;
        Duration::from_millis(jittered).max(self.min)
    }
}

/// Run `claim`, retrying once on a serialization failure (a concurrent
/// claimer committed first and invalidated our candidate set under
/// `SERIALIZABLE`, or a deadlock was broken by Postgres).
pub async fn claim_with_retry(
    engine: &Engine,
    worker_id: &str,
    queues: &[String],
    max_n: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<TaskRun>> {
    match claim(engine, worker_id, queues, max_n, now).await {
        Ok(rows) => Ok(rows),
        Err(e) if is_serialization_failure(&e) => {
            warn!(worker_id, error = %e, "claim hit a serialization conflict, retrying once");
            claim(engine, worker_id, queues, max_n, now).await
        }
        Err(e) => Err(e),
    }
}

fn is_serialization_failure(err: &anyhow::Error) -> bool {
    if let Some(sqlx::Error::Database(db_err)) = err.downcast_ref::<sqlx::Error>() {
        // Postgres SQLSTATE 40001 (serialization_failure) / 40P01 (deadlock_detected).
        return matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_backoff_stays_within_bounds() {
        let mut backoff = PollBackoff::new(Duration::from_millis(50), Duration::from_millis(500));
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn poll_backoff_reset_restarts_growth() {
        let mut backoff = PollBackoff::new(Duration::from_millis(10), Duration::from_millis(1000));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }
}
