//! Lease & Heartbeat Manager — keeps a worker's row-level leases and its own
//! liveness record alive while it holds `RUNNING` attempts (§4.4).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel::{Engine, Service};
use crate::model::Worker;

/// Runs as a background [`Service`] alongside a worker's claim loop.
/// Each tick: touches the worker's own heartbeat row and extends
/// `leased_until` for every `RUNNING` row it currently owns, so a
/// long-running attempt survives past its original lease (§4.4).
pub struct LeaseManager {
    engine: Engine,
    worker: Worker,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    pub fn new(engine: Engine, worker: Worker) -> Self {
        let heartbeat_interval = Duration::from_secs(engine.config.heartbeat_seconds);
        Self { engine, worker, heartbeat_interval }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        Worker::touch(&self.worker.worker_id, &self.engine).await?;
        self.extend_leases().await?;
        Ok(())
    }

    /// Push `leased_until` forward by `lease_seconds` for every row this
    /// worker currently holds, provided it has not been asked to cancel.
    async fn extend_leases(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE task_runs SET leased_until = NOW() + make_interval(secs => $1) \
             WHERE leased_by = $2 AND status = 'RUNNING' AND cancel_requested = FALSE",
        )
        .bind(self.engine.config.lease_seconds as f64)
        .bind(&self.worker.worker_id)
        .execute(&self.engine.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Release this worker's leases on the rows it still owns by setting
    /// `leased_until = now`, inviting reclaim rather than requeuing
    /// directly — the reaper owns the requeue-vs-fail decision (§4.4, §4.5).
    async fn release_all_leases(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE task_runs SET leased_until = NOW(), updated_at = NOW() \
             WHERE leased_by = $1 AND status = 'RUNNING'",
        )
        .bind(&self.worker.worker_id)
        .execute(&self.engine.db)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl Service for LeaseManager {
    fn name(&self) -> &str {
        "lease_manager"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.worker.upsert(&self.engine).await?;
        info!(worker_id = %self.worker.worker_id, "lease manager started");

        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(worker_id = %self.worker.worker_id, error = %e, "heartbeat tick failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Graceful drain: give in-flight attempts `shutdown_timeout` to
        // finish and finalize on their own before we release their leases
        // out from under them.
        let deadline = tokio::time::Instant::now() + self.engine.config.shutdown_timeout;
        loop {
            let remaining = count_running(&self.engine, &self.worker.worker_id).await.unwrap_or(0);
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if let Err(e) = self.release_all_leases().await {
            warn!(worker_id = %self.worker.worker_id, error = %e, "failed to release leases on shutdown");
        }
        info!(worker_id = %self.worker.worker_id, "lease manager stopped");
        Ok(())
    }
}

async fn count_running(engine: &Engine, worker_id: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_runs WHERE leased_by = $1 AND status = 'RUNNING'")
        .bind(worker_id)
        .fetch_one(&engine.db)
        .await?;
    Ok(count)
}
