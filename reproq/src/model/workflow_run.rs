//! `WorkflowRun` — fan-in counter backing chord callbacks (§3, §4.7).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::kernel::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Succeeded => "SUCCEEDED",
            WorkflowStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: Uuid,
    pub expected_count: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub callback_result_id: Option<i64>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub async fn create(
        workflow_id: Uuid,
        expected_count: i32,
        callback_result_id: Option<i64>,
        engine: &Engine,
    ) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO workflow_runs (workflow_id, expected_count, callback_result_id, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING workflow_id, expected_count, success_count, failure_count, callback_result_id, status, created_at, updated_at
            "#,
        )
        .bind(workflow_id)
        .bind(expected_count)
        .bind(callback_result_id)
        .fetch_one(&engine.db)
        .await?;
        Ok(row)
    }

    pub async fn find(workflow_id: Uuid, engine: &Engine) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT workflow_id, expected_count, success_count, failure_count, callback_result_id, status, created_at, updated_at \
             FROM workflow_runs WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&engine.db)
        .await?;
        Ok(row)
    }

    /// Locks the row and atomically increments `success_count` or
    /// `failure_count`, returning the post-increment state. Callers run
    /// this inside a transaction so the row lock serializes concurrent
    /// predecessor finalizations (§4.7 "increment-then-check").
    pub async fn increment(
        workflow_id: Uuid,
        succeeded: bool,
        tx: &mut sqlx::PgConnection,
    ) -> Result<Self> {
        let column = if succeeded { "success_count" } else { "failure_count" };
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE workflow_runs
            SET {column} = {column} + 1, updated_at = NOW()
            WHERE workflow_id = $1
            RETURNING workflow_id, expected_count, success_count, failure_count, callback_result_id, status, created_at, updated_at
            "#
        ))
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await?;
        Ok(row)
    }

    pub async fn mark_status(workflow_id: Uuid, status: WorkflowStatus, tx: &mut sqlx::PgConnection) -> Result<()> {
        sqlx::query("UPDATE workflow_runs SET status = $1, updated_at = NOW() WHERE workflow_id = $2")
            .bind(status.to_string())
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.success_count + self.failure_count >= self.expected_count
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(success: i32, failure: i32, expected: i32) -> WorkflowRun {
        WorkflowRun {
            workflow_id: Uuid::new_v4(),
            expected_count: expected,
            success_count: success,
            failure_count: failure,
            callback_result_id: None,
            status: "PENDING".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn is_complete_when_counts_reach_expected() {
        assert!(!sample(1, 0, 2).is_complete());
        assert!(sample(2, 0, 2).is_complete());
        assert!(sample(1, 1, 2).is_complete());
    }

    #[test]
    fn all_succeeded_requires_zero_failures() {
        assert!(sample(2, 0, 2).all_succeeded());
        assert!(!sample(1, 1, 2).all_succeeded());
    }
}
