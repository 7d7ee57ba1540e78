//! Unified `reproq` CLI: `migrate`, `worker`, `beat`, `reclaim`, `stats`,
//! `enqueue`, `check`.
//!
//! Mirrors the subcommand surface of the original management command,
//! minus the packaging/ops concerns (`install`, `systemd`, `migrate-worker`)
//! that are out of scope for the engine itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reproq::claim::{claim_with_retry, PollBackoff};
use reproq::kernel::{Engine, Service, ServiceHost};
use reproq::model::{TaskStatus, Worker};
use reproq::producer::{EnqueueSpec, Handle};
use reproq::{finalize, reclaim, Config};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reproq")]
#[command(about = "Durable, Postgres-backed distributed task queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate,

    /// Run a worker: claim loop plus lease/heartbeat manager.
    Worker {
        #[arg(long, default_value = "default")]
        queues: String,
        #[arg(long, default_value_t = 10)]
        concurrency: i64,
    },

    /// Run the periodic scheduler and reaper (no claim loop).
    Beat,

    /// Run a single reclaim sweep and exit.
    Reclaim,

    /// Print aggregate counts per queue and status.
    Stats,

    /// Enqueue one task from the command line.
    Enqueue {
        task_path: String,
        #[arg(long, default_value = "default")]
        queue: String,
        #[arg(long)]
        kwargs_json: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i16,
    },

    /// Verify database connectivity and report the schema version.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Migrate => {
            Engine::connect(config).await?;
            tracing::info!("migrations applied");
        }
        Commands::Worker { queues, concurrency } => run_worker(config, queues, concurrency).await?,
        Commands::Beat => run_beat(config).await?,
        Commands::Reclaim => {
            let engine = Engine::connect(config).await?;
            let (requeued, failed) = reclaim::sweep(&engine).await?;
            println!("requeued={requeued} failed={failed}");
        }
        Commands::Stats => run_stats(config).await?,
        Commands::Enqueue { task_path, queue, kwargs_json, priority } => {
            let engine = Engine::connect(config).await?;
            let mut spec = EnqueueSpec::new(task_path, queue);
            spec.priority = priority;
            if let Some(raw) = kwargs_json {
                if let serde_json::Value::Object(map) = serde_json::from_str(&raw)? {
                    spec.kwargs = map;
                }
            }
            let handle: Handle = reproq::producer::enqueue(&engine, spec).await?;
            println!("result_id={}", handle.result_id);
        }
        Commands::Check => {
            let engine = Engine::connect(config).await?;
            sqlx::query("SELECT 1").execute(&engine.db).await?;
            println!("ok");
        }
    }

    Ok(())
}

async fn run_worker(config: Config, queues: String, concurrency: i64) -> Result<()> {
    let engine = Engine::connect(config).await?;
    let queue_list: Vec<String> = queues.split(',').map(|s| s.trim().to_string()).collect();

    let worker_id = format!("{}-{}", hostname(), Uuid::new_v4());
    let worker = Worker::new(worker_id.clone(), hostname(), concurrency as i32, queue_list.clone());

    let lease_manager = reproq::lease::LeaseManager::new(engine.clone(), worker.clone());
    let reaper = reclaim::Reaper::new(engine.clone());

    let claim_loop = ClaimLoop { engine: engine.clone(), worker_id: worker_id.clone(), queues: queue_list, concurrency };

    ServiceHost::new()
        .with_service(Box::new(lease_manager))
        .with_service(Box::new(reaper))
        .with_service(Box::new(claim_loop))
        .run_until_shutdown()
        .await
}

async fn run_beat(config: Config) -> Result<()> {
    let engine = Engine::connect(config).await?;
    ServiceHost::new()
        .with_service(Box::new(reproq::periodic::Scheduler::new(engine.clone())))
        .with_service(Box::new(reclaim::Reaper::new(engine)))
        .run_until_shutdown()
        .await
}

async fn run_stats(config: Config) -> Result<()> {
    let engine = Engine::connect(config).await?;
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT queue_name, status::TEXT, COUNT(*) FROM task_runs GROUP BY queue_name, status ORDER BY queue_name, status",
    )
    .fetch_all(&engine.db)
    .await?;
    for (queue_name, status, count) in rows {
        println!("{queue_name}\t{status}\t{count}");
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// The worker's own claim/execute/finalize loop, hosted as a [`Service`] so
/// it shares lifecycle with the lease manager and reaper.
struct ClaimLoop {
    engine: Engine,
    worker_id: String,
    queues: Vec<String>,
    concurrency: i64,
}

#[async_trait::async_trait]
impl Service for ClaimLoop {
    fn name(&self) -> &str {
        "claim_loop"
    }

    async fn run(self: Box<Self>, shutdown: tokio_util::sync::CancellationToken) -> Result<()> {
        let mut backoff = PollBackoff::new(self.engine.config.poll_min_backoff, self.engine.config.poll_max_backoff);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = claim_with_retry(&self.engine, &self.worker_id, &self.queues, self.concurrency, chrono::Utc::now()).await?;
            if claimed.is_empty() {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }
            backoff.reset();

            let mut attempts = tokio::task::JoinSet::new();
            for task in claimed {
                if task.status != TaskStatus::Running {
                    continue;
                }
                let engine = self.engine.clone();
                let worker_id = self.worker_id.clone();
                attempts.spawn(async move {
                    let outcome = match reproq::executor::run(&engine, &task).await {
                        Ok(outcome) => outcome,
                        Err(e) => finalize::Outcome::Failed {
                            kind: "executor_spawn_failed".to_string(),
                            message: Some(e.to_string()),
                            traceback: None,
                        },
                    };
                    finalize::finalize(&engine, task.result_id, &worker_id, outcome).await
                });
            }
            while let Some(joined) = attempts.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "attempt task panicked");
                }
            }
        }

        Ok(())
    }
}
