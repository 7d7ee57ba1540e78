//! Workflow Coordinator — Chain, Group, and Chord composition patterns,
//! expressed via `parent_id`, `workflow_id`, and `wait_count` (§4.7).

use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::ReproqError;
use crate::kernel::Engine;
use crate::model::task_run::ErrorRecord;
use crate::model::{TaskStatus, WorkflowRun};
use crate::producer::{EnqueueSpec, Handle};

/// Insert a sequential chain: the first spec is `READY`; every subsequent
/// spec is inserted `WAITING` with `wait_count = 1` and `parent_id` set to
/// the previous task's id.
pub async fn chain(engine: &Engine, mut specs: Vec<EnqueueSpec>) -> Result<Vec<Handle>, ReproqError> {
    if specs.is_empty() {
        return Ok(Vec::new());
    }

    let mut handles = Vec::with_capacity(specs.len());
    let first = specs.remove(0);
    let first_handle = crate::producer::enqueue(engine, first).await?;
    handles.push(first_handle);

    let mut parent_id = first_handle.result_id;
    for mut spec in specs {
        spec.parent_id = Some(parent_id);
        spec.wait_count = 1;
        spec.initial_status = TaskStatus::Waiting;
        let handle = crate::producer::enqueue(engine, spec).await?;
        parent_id = handle.result_id;
        handles.push(handle);
    }

    Ok(handles)
}

/// Insert a parallel group: every spec is `READY` with a shared
/// `workflow_id`. No `WorkflowRun` row is needed; the coordinator takes no
/// action at completion beyond the per-task finalizer.
pub async fn group(engine: &Engine, specs: Vec<EnqueueSpec>) -> Result<(Uuid, Vec<Handle>), ReproqError> {
    let workflow_id = Uuid::new_v4();
    let mut handles = Vec::with_capacity(specs.len());
    for mut spec in specs {
        spec.workflow_id = Some(workflow_id);
        handles.push(crate::producer::enqueue(engine, spec).await?);
    }
    Ok((workflow_id, handles))
}

/// Insert a fan-in: `predecessors` are `READY` sharing `workflow_id`;
/// `callback` is inserted `WAITING` with `wait_count = predecessors.len()`.
/// A [`WorkflowRun`] row tracks the fan-in counters.
pub async fn chord(
    engine: &Engine,
    predecessors: Vec<EnqueueSpec>,
    mut callback: EnqueueSpec,
) -> Result<(Uuid, Vec<Handle>, Handle), ReproqError> {
    let workflow_id = Uuid::new_v4();
    let expected_count = predecessors.len() as i32;

    callback.workflow_id = Some(workflow_id);
    callback.wait_count = expected_count;
    callback.initial_status = TaskStatus::Waiting;
    let callback_handle = crate::producer::enqueue(engine, callback).await?;

    WorkflowRun::create(workflow_id, expected_count, Some(callback_handle.result_id), engine)
        .await
        .map_err(|e| ReproqError::ValidationError(e.to_string()))?;

    let mut predecessor_handles = Vec::with_capacity(predecessors.len());
    for mut spec in predecessors {
        spec.workflow_id = Some(workflow_id);
        predecessor_handles.push(crate::producer::enqueue(engine, spec).await?);
    }

    Ok((workflow_id, predecessor_handles, callback_handle))
}

/// Called from within the finalizer's transaction immediately after a
/// `TaskRun` reaches a terminal state. Releases chain children and advances
/// chord fan-in counters.
pub async fn on_finalized(
    tx: &mut sqlx::PgConnection,
    result_id: i64,
    new_status: TaskStatus,
    workflow_id: Option<Uuid>,
    parent_id: Option<i64>,
) -> anyhow::Result<()> {
    let _ = parent_id; // the relation walked here is child→parent, not parent→child.

    if new_status == TaskStatus::Successful {
        release_chain_children(tx, result_id).await?;
    } else {
        fail_chain_children(tx, result_id).await?;
    }

    if let Some(workflow_id) = workflow_id {
        advance_chord(tx, workflow_id, new_status).await?;
    }

    Ok(())
}

async fn release_chain_children(tx: &mut sqlx::PgConnection, parent_id: i64) -> anyhow::Result<()> {
    let rows = sqlx::query(
        "UPDATE task_runs SET wait_count = wait_count - 1, updated_at = NOW() \
         WHERE parent_id = $1 AND status = 'WAITING' \
         RETURNING result_id, wait_count",
    )
    .bind(parent_id)
    .fetch_all(&mut *tx)
    .await?;

    for row in rows {
        let child_id: i64 = row.try_get("result_id")?;
        let wait_count: i32 = row.try_get("wait_count")?;
        if wait_count <= 0 {
            sqlx::query("UPDATE task_runs SET status = 'READY', run_after = NOW(), updated_at = NOW() WHERE result_id = $1")
                .bind(child_id)
                .execute(&mut *tx)
                .await?;
            info!(parent_id, child_id, "chain child released");
        }
    }
    Ok(())
}

async fn fail_chain_children(tx: &mut sqlx::PgConnection, parent_id: i64) -> anyhow::Result<()> {
    let error = serde_json::to_value(ErrorRecord::parent_failed())?;
    sqlx::query(
        "UPDATE task_runs SET status = 'FAILED', finished_at = NOW(), \
         errors = errors || $1::jsonb, updated_at = NOW() \
         WHERE parent_id = $2 AND status = 'WAITING'",
    )
    .bind(serde_json::Value::Array(vec![error]))
    .bind(parent_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn advance_chord(
    tx: &mut sqlx::PgConnection,
    workflow_id: Uuid,
    new_status: TaskStatus,
) -> anyhow::Result<()> {
    let Some(mut run) = sqlx::query_as::<_, WorkflowRun>(
        "SELECT workflow_id, expected_count, success_count, failure_count, callback_result_id, status, created_at, updated_at \
         FROM workflow_runs WHERE workflow_id = $1 FOR UPDATE",
    )
    .bind(workflow_id)
    .fetch_optional(&mut *tx)
    .await?
    else {
        // No WorkflowRun row: this is a Group, not a Chord. Nothing to do.
        return Ok(());
    };

    let succeeded = new_status == TaskStatus::Successful;
    run = WorkflowRun::increment(workflow_id, succeeded, tx).await?;

    if !run.is_complete() {
        return Ok(());
    }

    let Some(callback_id) = run.callback_result_id else {
        return Ok(());
    };

    if run.all_succeeded() {
        sqlx::query(
            "UPDATE task_runs SET wait_count = 0, status = 'READY', run_after = NOW(), updated_at = NOW() \
             WHERE result_id = $1 AND status = 'WAITING'",
        )
        .bind(callback_id)
        .execute(&mut *tx)
        .await?;
        crate::model::WorkflowRun::mark_status(workflow_id, crate::model::workflow_run::WorkflowStatus::Succeeded, tx).await?;
        info!(%workflow_id, callback_id, "chord callback released");
    } else {
        let error = serde_json::to_value(ErrorRecord::chord_partial_failure())?;
        sqlx::query(
            "UPDATE task_runs SET status = 'FAILED', finished_at = NOW(), \
             errors = errors || $1::jsonb, updated_at = NOW() \
             WHERE result_id = $2 AND status = 'WAITING'",
        )
        .bind(serde_json::Value::Array(vec![error]))
        .bind(callback_id)
        .execute(&mut *tx)
        .await?;
        crate::model::WorkflowRun::mark_status(workflow_id, crate::model::workflow_run::WorkflowStatus::Failed, tx).await?;
        info!(%workflow_id, callback_id, "chord callback failed: partial failure among predecessors");
    }

    Ok(())
}
