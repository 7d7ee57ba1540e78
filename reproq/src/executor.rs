//! Executor invocation — spawns the external subprocess that actually runs
//! one claimed attempt and parses its outcome envelope (§6).

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ReproqError;
use crate::finalize::Outcome;
use crate::kernel::Engine;
use crate::model::TaskRun;

/// The executor's single-line JSON response (§6 "Outcome envelope"). Both
/// success and failure fields are optional because which ones are present
/// depends on `ok`, not on the JSON shape alone.
#[derive(Debug, Deserialize)]
struct OutcomeEnvelope {
    ok: bool,
    #[serde(rename = "return")]
    return_value: Option<serde_json::Value>,
    exception_class: Option<String>,
    message: Option<String>,
    traceback: Option<String>,
}

/// Internal resolution of the `wait` / `deadline` / `cancel` race in [`run`].
enum Resolution {
    Output(anyhow::Result<(String, std::process::ExitStatus)>),
    TimedOut,
    Cancelled,
}

/// Invoke the Executor for one claimed attempt and translate its response
/// (or lack thereof) into an [`Outcome`] for the finalizer.
///
/// Enforces `timeout_seconds` as a backstop even though the executor is
/// expected to self-terminate on timeout and report a `failed` outcome
/// (§5 "Timeouts"): a worker that cannot trust the executor process still
/// must not block its claim slot indefinitely.
///
/// Also polls `cancel_requested` on the same cadence as the worker's
/// heartbeat (§4.4 "Running workers observe it at heartbeat or poll
/// boundaries and terminate the attempt"): if a cancel is observed before
/// the executor exits, the child is killed and the attempt resolves to
/// [`Outcome::Cancelled`].
pub async fn run(engine: &Engine, task: &TaskRun) -> anyhow::Result<Outcome> {
    let payload = serde_json::to_vec(&task.spec)?;
    if payload.len() > engine.config.max_payload_bytes {
        return Err(ReproqError::PayloadTooLarge {
            actual: payload.len(),
            limit: engine.config.max_payload_bytes,
        }
        .into());
    }

    let mut child = Command::new(&engine.config.executor_path)
        .arg("--payload-stdin")
        .arg("--task-path")
        .arg(&task.task_path)
        .arg("--result-id")
        .arg(task.result_id.to_string())
        .arg("--attempt")
        .arg(task.attempts.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
    }

    let timeout = Duration::from_secs(task.timeout_seconds.max(0) as u64);
    let cancel_poll = Duration::from_secs(engine.config.heartbeat_seconds.max(1));
    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let resolution = {
        let wait = async {
            let line = lines.next_line().await?.unwrap_or_default();
            let status = child.wait().await?;
            anyhow::Ok((line, status))
        };
        tokio::pin!(wait);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut cancel_ticker = tokio::time::interval(cancel_poll);

        loop {
            tokio::select! {
                res = &mut wait => break Resolution::Output(res),
                _ = &mut deadline => break Resolution::TimedOut,
                _ = cancel_ticker.tick() => {
                    if is_cancel_requested(engine, task.result_id).await.unwrap_or(false) {
                        break Resolution::Cancelled;
                    }
                }
            }
        }
    };

    match resolution {
        Resolution::Output(Ok((line, status))) => Ok(interpret(&line, status.success())),
        Resolution::Output(Err(e)) => {
            warn!(result_id = task.result_id, error = %e, "executor process I/O failed");
            Ok(Outcome::Failed {
                kind: "executor_io_error".to_string(),
                message: Some(e.to_string()),
                traceback: None,
            })
        }
        Resolution::TimedOut => {
            let _ = child.kill().await;
            Ok(Outcome::Failed {
                kind: "timeout".to_string(),
                message: Some(format!("attempt exceeded {}s", task.timeout_seconds)),
                traceback: None,
            })
        }
        Resolution::Cancelled => {
            let _ = child.kill().await;
            info!(result_id = task.result_id, "cancel_requested observed, attempt terminated");
            Ok(Outcome::Cancelled)
        }
    }
}

/// Re-read `cancel_requested` directly from the row (not from the stale
/// in-memory `TaskRun` the attempt started with).
async fn is_cancel_requested(engine: &Engine, result_id: i64) -> anyhow::Result<bool> {
    let flag: Option<bool> =
        sqlx::query_scalar("SELECT cancel_requested FROM task_runs WHERE result_id = $1")
            .bind(result_id)
            .fetch_optional(&engine.db)
            .await?;
    Ok(flag.unwrap_or(false))
}

fn interpret(line: &str, exit_success: bool) -> Outcome {
    match serde_json::from_str::<OutcomeEnvelope>(line) {
        Ok(envelope) if envelope.ok => {
            Outcome::Ok(envelope.return_value.unwrap_or(serde_json::Value::Null))
        }
        Ok(envelope) => Outcome::Failed {
            kind: envelope.exception_class.unwrap_or_else(|| "unknown".to_string()),
            message: envelope.message,
            traceback: envelope.traceback,
        },
        Err(e) => {
            warn!(error = %e, line, exit_success, "executor produced an unparseable outcome envelope");
            Outcome::Failed {
                kind: "deserialize_failed".to_string(),
                message: Some(format!("could not parse executor output: {e}")),
                traceback: None,
            }
        }
    }
}
