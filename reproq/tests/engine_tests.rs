mod common;

use chrono::Utc;
use reproq::claim::claim;
use reproq::finalize::{finalize, request_cancel, Outcome};
use reproq::model::{PeriodicTask, Record, TaskStatus, WorkflowRun};
use reproq::producer::{enqueue, EnqueueSpec};
use reproq::{periodic, reclaim, workflow};
use test_context::test_context;

#[test_context(common::TestHarness)]
#[tokio::test]
async fn chain_releases_next_task_only_after_parent_succeeds(ctx: &common::TestHarness) {
    let first = EnqueueSpec::new("pkg.chain1", "default");
    let second = EnqueueSpec::new("pkg.chain2", "default");

    let handles = workflow::chain(&ctx.engine, vec![first, second]).await.unwrap();
    assert_eq!(handles.len(), 2);

    let second_row = reproq::model::TaskRun::find_by_id(handles[1].result_id, &ctx.engine)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_row.status, TaskStatus::Waiting);
    assert_eq!(second_row.wait_count, 1);

    // Only the first task is claimable while the chain is pending.
    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 2, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].result_id, handles[0].result_id);

    finalize(&ctx.engine, handles[0].result_id, "worker-1", Outcome::Ok(serde_json::json!(null)))
        .await
        .unwrap();

    let second_row = reproq::model::TaskRun::find_by_id(handles[1].result_id, &ctx.engine)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_row.status, TaskStatus::Ready);
    assert_eq!(second_row.wait_count, 0);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn chain_fails_child_when_parent_fails(ctx: &common::TestHarness) {
    let mut first = EnqueueSpec::new("pkg.chainfail1", "default");
    first.exec.max_attempts = 1;
    let second = EnqueueSpec::new("pkg.chainfail2", "default");

    let handles = workflow::chain(&ctx.engine, vec![first, second]).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed[0].result_id, handles[0].result_id);

    finalize(
        &ctx.engine,
        handles[0].result_id,
        "worker-1",
        Outcome::Failed { kind: "boom".to_string(), message: None, traceback: None },
    )
    .await
    .unwrap();

    let second_row = reproq::model::TaskRun::find_by_id(handles[1].result_id, &ctx.engine)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_row.status, TaskStatus::Failed);
    let errors = second_row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "parent_failed");
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn concurrency_limit_zero_means_unlimited(ctx: &common::TestHarness) {
    for i in 0..3 {
        let mut spec = EnqueueSpec::new(format!("pkg.unlimited{i}"), "default");
        spec.concurrency_key = Some("shared".to_string());
        spec.concurrency_limit = Some(0);
        enqueue(&ctx.engine, spec).await.unwrap();
    }

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 3, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 3);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn concurrency_limit_gates_claims_at_the_configured_bound(ctx: &common::TestHarness) {
    for i in 0..3 {
        let mut spec = EnqueueSpec::new(format!("pkg.capped{i}"), "default");
        spec.concurrency_key = Some("shared-capped".to_string());
        spec.concurrency_limit = Some(2);
        enqueue(&ctx.engine, spec).await.unwrap();
    }

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 3, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 2);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn lock_key_admits_only_one_row_from_a_single_batch(ctx: &common::TestHarness) {
    for i in 0..2 {
        let mut spec = EnqueueSpec::new(format!("pkg.batchlocked{i}"), "default");
        spec.lock_key = Some("batch-k1".to_string());
        enqueue(&ctx.engine, spec).await.unwrap();
    }

    // A single claim() call with max_n=2 must still promote at most one
    // row sharing this lock_key, even though neither is RUNNING yet when
    // the batch is selected.
    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 2, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn priority_extremes_are_accepted_and_ordered(ctx: &common::TestHarness) {
    let mut low = EnqueueSpec::new("pkg.lowest", "default");
    low.priority = i16::MIN;
    let mut high = EnqueueSpec::new("pkg.highest", "default");
    high.priority = i16::MAX;

    enqueue(&ctx.engine, low).await.unwrap();
    enqueue(&ctx.engine, high).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].priority, i16::MAX);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn paused_queue_yields_no_claims(ctx: &common::TestHarness) {
    use reproq::model::QueueControl;

    enqueue(&ctx.engine, EnqueueSpec::new("pkg.paused", "default")).await.unwrap();
    QueueControl::pause("default", Some("maintenance"), &ctx.engine).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert!(claimed.is_empty());

    QueueControl::resume("default", &ctx.engine).await.unwrap();
    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn reaper_expires_ready_rows_past_their_ttl(ctx: &common::TestHarness) {
    let mut expired = EnqueueSpec::new("pkg.ttl_expired", "default");
    expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
    let expired_handle = enqueue(&ctx.engine, expired).await.unwrap();

    let mut unexpired = EnqueueSpec::new("pkg.ttl_alive", "default");
    unexpired.expires_at = Some(Utc::now() + chrono::Duration::seconds(3600));
    let unexpired_handle = enqueue(&ctx.engine, unexpired).await.unwrap();

    let (requeued, failed) = reclaim::sweep(&ctx.engine).await.unwrap();
    assert_eq!(requeued, 0);
    assert_eq!(failed, 1);

    let expired_row = reproq::model::TaskRun::find_by_id(expired_handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(expired_row.status, TaskStatus::Failed);
    let errors = expired_row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "expired");

    let unexpired_row = reproq::model::TaskRun::find_by_id(unexpired_handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(unexpired_row.status, TaskStatus::Ready);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn dedup_returns_same_result_id(ctx: &common::TestHarness) {
    let spec = || {
        let mut s = EnqueueSpec::new("pkg.t", "default");
        s.priority = 0;
        s
    };

    let first = enqueue(&ctx.engine, spec()).await.unwrap();
    let second = enqueue(&ctx.engine, spec()).await.unwrap();
    assert_eq!(first.result_id, second.result_id);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_runs WHERE spec_hash = (SELECT spec_hash FROM task_runs WHERE result_id = $1)")
        .bind(first.result_id)
        .fetch_one(&ctx.engine.db)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn claim_prefers_highest_priority(ctx: &common::TestHarness) {
    for priority in [0i16, 10, 5] {
        let mut spec = EnqueueSpec::new(format!("pkg.t{priority}"), "default");
        spec.priority = priority;
        enqueue(&ctx.engine, spec).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].priority, 10);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn lock_key_excludes_concurrent_claim(ctx: &common::TestHarness) {
    for i in 0..2 {
        let mut spec = EnqueueSpec::new(format!("pkg.locked{i}"), "default");
        spec.lock_key = Some("k1".to_string());
        enqueue(&ctx.engine, spec).await.unwrap();
    }

    let first = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = claim(&ctx.engine, "worker-2", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert!(second.is_empty());

    finalize(&ctx.engine, first[0].result_id, "worker-1", Outcome::Ok(serde_json::json!(null)))
        .await
        .unwrap();

    let third = claim(&ctx.engine, "worker-2", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(third.len(), 1);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn lease_reclaim_requeues_expired_attempt(ctx: &common::TestHarness) {
    let spec = EnqueueSpec::new("pkg.reclaimable", "default");
    let handle = enqueue(&ctx.engine, spec).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    sqlx::query("UPDATE task_runs SET leased_until = NOW() - INTERVAL '1 second' WHERE result_id = $1")
        .bind(handle.result_id)
        .execute(&ctx.engine.db)
        .await
        .unwrap();

    let (requeued, failed) = reclaim::sweep(&ctx.engine).await.unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(failed, 0);

    let row = reproq::model::TaskRun::find_by_id(handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Ready);
    assert!(row.leased_until.is_none());
    assert!(row.leased_by.is_none());
    let errors = row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "lease_expired");
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn chord_callback_releases_after_all_predecessors_succeed(ctx: &common::TestHarness) {
    let p1 = EnqueueSpec::new("pkg.p1", "default");
    let p2 = EnqueueSpec::new("pkg.p2", "default");
    let cb = EnqueueSpec::new("pkg.cb", "default");

    let (workflow_id, predecessors, callback) = workflow::chord(&ctx.engine, vec![p1, p2], cb).await.unwrap();
    assert_eq!(predecessors.len(), 2);

    for handle in &predecessors {
        let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
        assert_eq!(claimed[0].result_id, handle.result_id);
        finalize(&ctx.engine, handle.result_id, "worker-1", Outcome::Ok(serde_json::json!(null)))
            .await
            .unwrap();
    }

    let run = WorkflowRun::find(workflow_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(run.success_count, 2);
    assert_eq!(run.failure_count, 0);

    let row = reproq::model::TaskRun::find_by_id(callback.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Ready);
    assert_eq!(row.wait_count, 0);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn chord_callback_fails_when_any_predecessor_fails(ctx: &common::TestHarness) {
    let mut p1 = EnqueueSpec::new("pkg.p1", "default");
    p1.exec.max_attempts = 1;
    let mut p2 = EnqueueSpec::new("pkg.p2", "default");
    p2.exec.max_attempts = 1;
    let cb = EnqueueSpec::new("pkg.cb", "default");

    let (_workflow_id, _predecessors, callback) = workflow::chord(&ctx.engine, vec![p1, p2], cb).await.unwrap();

    let first = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    finalize(&ctx.engine, first[0].result_id, "worker-1", Outcome::Ok(serde_json::json!(null)))
        .await
        .unwrap();

    let second = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    finalize(
        &ctx.engine,
        second[0].result_id,
        "worker-1",
        Outcome::Failed { kind: "boom".to_string(), message: None, traceback: None },
    )
    .await
    .unwrap();

    let row = reproq::model::TaskRun::find_by_id(callback.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    let errors = row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "chord_partial_failure");
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn periodic_tick_emits_exactly_one_row_and_advances_schedule(ctx: &common::TestHarness) {
    let past = Utc::now() - chrono::Duration::seconds(1);
    sqlx::query(
        "INSERT INTO periodic_tasks (name, cron_expr, task_path, payload, queue_name, priority, max_attempts, next_run_at, enabled) \
         VALUES ('hourly', '0 0 * * * *', 'pkg.hourly', '{}'::jsonb, 'default', 0, 3, $1, TRUE)",
    )
    .bind(past)
    .execute(&ctx.engine.db)
    .await
    .unwrap();

    let fired = periodic::tick(&ctx.engine).await.unwrap();
    assert_eq!(fired, 1);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_runs WHERE task_path = 'pkg.hourly'")
        .fetch_one(&ctx.engine.db)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let task = PeriodicTask::find_by_id("hourly".to_string(), &ctx.engine).await.unwrap().unwrap();
    assert!(task.last_run_at.is_some());
    assert!(task.next_run_at > Utc::now());

    let fired_again = periodic::tick(&ctx.engine).await.unwrap();
    assert_eq!(fired_again, 0);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn run_after_equal_to_now_is_claimable(ctx: &common::TestHarness) {
    let now = Utc::now();
    let mut spec = EnqueueSpec::new("pkg.now", "default");
    spec.run_after = reproq::producer::RunAfter::At(now);
    enqueue(&ctx.engine, spec).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, now).await.unwrap();
    assert_eq!(claimed.len(), 1);
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn max_attempts_one_fails_after_first_failure(ctx: &common::TestHarness) {
    let mut spec = EnqueueSpec::new("pkg.oneshot", "default");
    spec.exec.max_attempts = 1;
    let handle = enqueue(&ctx.engine, spec).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let status = finalize(
        &ctx.engine,
        handle.result_id,
        "worker-1",
        Outcome::Failed { kind: "boom".to_string(), message: None, traceback: None },
    )
    .await
    .unwrap();

    assert_eq!(status, Some(TaskStatus::Failed));
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn finalize_with_cancelled_outcome_marks_row_cancelled(ctx: &common::TestHarness) {
    let spec = EnqueueSpec::new("pkg.cancel_me", "default");
    let handle = enqueue(&ctx.engine, spec).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    request_cancel(&ctx.engine, handle.result_id).await.unwrap();
    let row = reproq::model::TaskRun::find_by_id(handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert!(row.cancel_requested);
    assert_eq!(row.status, TaskStatus::Running);

    let status = finalize(&ctx.engine, handle.result_id, "worker-1", Outcome::Cancelled).await.unwrap();
    assert_eq!(status, Some(TaskStatus::Cancelled));

    let row = reproq::model::TaskRun::find_by_id(handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    assert!(row.leased_until.is_none());
    let errors = row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "cancelled");
}

#[test_context(common::TestHarness)]
#[tokio::test]
async fn reclaim_resolves_cancel_requested_lease_expired_row_to_cancelled(ctx: &common::TestHarness) {
    let spec = EnqueueSpec::new("pkg.cancel_orphaned", "default");
    let handle = enqueue(&ctx.engine, spec).await.unwrap();

    let claimed = claim(&ctx.engine, "worker-1", &["default".to_string()], 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Simulate a worker that observed neither the cancel flag nor kept
    // renewing its lease after the cancel was requested.
    request_cancel(&ctx.engine, handle.result_id).await.unwrap();
    sqlx::query("UPDATE task_runs SET leased_until = NOW() - INTERVAL '1 second' WHERE result_id = $1")
        .bind(handle.result_id)
        .execute(&ctx.engine.db)
        .await
        .unwrap();

    let (requeued, failed) = reclaim::sweep(&ctx.engine).await.unwrap();
    assert_eq!(requeued, 0);
    assert_eq!(failed, 1);

    let row = reproq::model::TaskRun::find_by_id(handle.result_id, &ctx.engine).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    assert!(row.leased_until.is_none());
    assert!(row.leased_by.is_none());
    let errors = row.errors.as_array().unwrap();
    assert_eq!(errors.last().unwrap()["kind"], "cancelled");
}
