//! `TaskRun` — one row per execution attempt-group (§3).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::Engine;
use crate::model::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Ready,
    Running,
    Waiting,
    Successful,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Successful | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One entry in a `TaskRun`'s append-only `errors` sequence (§3, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: Option<String>,
    pub traceback: Option<String>,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: Option<String>) -> Self {
        Self { kind: kind.into(), message, traceback: None, at: Utc::now() }
    }

    pub fn lease_expired() -> Self {
        Self::new("lease_expired", None)
    }

    pub fn cancelled() -> Self {
        Self::new("cancelled", None)
    }

    pub fn parent_failed() -> Self {
        Self::new("parent_failed", None)
    }

    pub fn chord_partial_failure() -> Self {
        Self::new("chord_partial_failure", None)
    }

    pub fn expired() -> Self {
        Self::new("expired", None)
    }
}

/// An execution attempt-group. See the module docs and §3 for the full
/// invariant list; this struct is a straight column-for-column mapping of
/// the `task_runs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskRun {
    #[builder(default)]
    pub result_id: i64,

    pub queue_name: String,
    #[builder(default = 0)]
    pub priority: i16,
    #[builder(default, setter(strip_option))]
    pub lock_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub concurrency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub concurrency_limit: Option<i32>,

    pub task_path: String,
    pub spec: serde_json::Value,
    pub spec_hash: String,

    #[builder(default, setter(strip_option))]
    pub run_after: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub enqueued_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub expires_at: Option<DateTime<Utc>>,

    #[builder(default = TaskStatus::Ready)]
    pub status: TaskStatus,

    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = 60)]
    pub timeout_seconds: i32,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_attempted_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = serde_json::json!([]))]
    pub errors: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub return_value: Option<serde_json::Value>,
    #[builder(default)]
    pub worker_ids: Vec<String>,

    #[builder(default, setter(strip_option))]
    pub leased_until: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub leased_by: Option<String>,
    #[builder(default = false)]
    pub cancel_requested: bool,

    #[builder(default, setter(strip_option))]
    pub parent_id: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub workflow_id: Option<Uuid>,
    #[builder(default = 0)]
    pub wait_count: i32,

    #[builder(default, setter(strip_option))]
    pub logs_uri: Option<String>,
    #[builder(default, setter(strip_option))]
    pub artifacts_uri: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const ALL_COLUMNS: &str = "result_id, queue_name, priority, lock_key, concurrency_key, concurrency_limit, \
    task_path, spec, spec_hash, run_after, enqueued_at, expires_at, status, attempts, max_attempts, \
    timeout_seconds, started_at, last_attempted_at, finished_at, errors, return_value, worker_ids, \
    leased_until, leased_by, cancel_requested, parent_id, workflow_id, wait_count, logs_uri, \
    artifacts_uri, metadata, created_at, updated_at";

impl TaskRun {
    /// Append an [`ErrorRecord`] to the `errors` column in memory (callers
    /// persist via a targeted UPDATE, not through this method).
    pub fn push_error(&mut self, record: ErrorRecord) {
        let mut errors = self.errors.as_array().cloned().unwrap_or_default();
        errors.push(serde_json::to_value(record).expect("ErrorRecord serializes"));
        self.errors = serde_json::Value::Array(errors);
    }

    pub async fn find_by_workflow(workflow_id: Uuid, engine: &Engine) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ALL_COLUMNS} FROM task_runs WHERE workflow_id = $1 ORDER BY result_id"
        ))
        .bind(workflow_id)
        .fetch_all(&engine.db)
        .await?;
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl Record for TaskRun {
    const TABLE: &'static str = "task_runs";
    type Id = i64;

    async fn find_by_id(id: i64, engine: &Engine) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ALL_COLUMNS} FROM task_runs WHERE result_id = $1"
        ))
        .bind(id)
        .fetch_optional(&engine.db)
        .await?;
        Ok(row)
    }

    async fn insert(&self, engine: &Engine) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO task_runs (
                queue_name, priority, lock_key, concurrency_key, concurrency_limit,
                task_path, spec, spec_hash, run_after, expires_at, status,
                max_attempts, timeout_seconds, parent_id, workflow_id, wait_count, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {ALL_COLUMNS}
            "#
        ))
        .bind(&self.queue_name)
        .bind(self.priority)
        .bind(&self.lock_key)
        .bind(&self.concurrency_key)
        .bind(self.concurrency_limit)
        .bind(&self.task_path)
        .bind(&self.spec)
        .bind(&self.spec_hash)
        .bind(self.run_after)
        .bind(self.expires_at)
        .bind(self.status)
        .bind(self.max_attempts)
        .bind(self.timeout_seconds)
        .bind(self.parent_id)
        .bind(self.workflow_id)
        .bind(self.wait_count)
        .bind(&self.metadata)
        .fetch_one(&engine.db)
        .await?;
        Ok(row)
    }

    async fn update(&self, engine: &Engine) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE task_runs SET
                status = $1, attempts = $2, started_at = $3, last_attempted_at = $4, finished_at = $5,
                errors = $6, return_value = $7, worker_ids = $8, leased_until = $9, leased_by = $10,
                cancel_requested = $11, wait_count = $12, run_after = $13, updated_at = NOW()
            WHERE result_id = $14
            RETURNING {ALL_COLUMNS}
            "#
        ))
        .bind(self.status)
        .bind(self.attempts)
        .bind(self.started_at)
        .bind(self.last_attempted_at)
        .bind(self.finished_at)
        .bind(&self.errors)
        .bind(&self.return_value)
        .bind(&self.worker_ids)
        .bind(self.leased_until)
        .bind(&self.leased_by)
        .bind(self.cancel_requested)
        .bind(self.wait_count)
        .bind(self.run_after)
        .bind(self.result_id)
        .fetch_one(&engine.db)
        .await?;
        Ok(row)
    }

    async fn delete(&self, engine: &Engine) -> Result<()> {
        sqlx::query("DELETE FROM task_runs WHERE result_id = $1")
            .bind(self.result_id)
            .execute(&engine.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskRun {
        TaskRun::builder()
            .queue_name("default")
            .task_path("pkg.t")
            .spec(serde_json::json!({}))
            .spec_hash("0".repeat(64))
            .build()
    }

    #[test]
    fn new_task_run_defaults_to_ready() {
        assert_eq!(sample().status, TaskStatus::Ready);
    }

    #[test]
    fn new_task_run_has_zero_attempts() {
        assert_eq!(sample().attempts, 0);
    }

    #[test]
    fn push_error_appends_to_errors_array() {
        let mut task = sample();
        task.push_error(ErrorRecord::lease_expired());
        let errors = task.errors.as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["kind"], "lease_expired");
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(TaskStatus::Successful.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
    }
}
