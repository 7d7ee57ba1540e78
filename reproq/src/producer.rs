//! Producer path — `enqueue` / `bulk_enqueue` (§4.2).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::ReproqError;
use crate::kernel::Engine;
use crate::serialize::{canonical::fingerprint, value::TYPE_TAG_KEY};

/// A relative or absolute `run_after` as accepted from callers. A relative
/// duration is added to "now" at enqueue time; an absolute instant must
/// already be timezone-aware (guaranteed by `DateTime<Utc>`).
#[derive(Debug, Clone)]
pub enum RunAfter {
    Immediately,
    In(std::time::Duration),
    At(DateTime<Utc>),
}

/// The exec sub-object of an enqueue specification (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOptions {
    pub timeout_seconds: i32,
    pub max_attempts: i32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { timeout_seconds: 60, max_attempts: 3 }
    }
}

/// The normalized input to `enqueue`. Reserved routing fields (`priority`,
/// `lock_key`, `concurrency_key`, `concurrency_limit`, `run_after`) are
/// modeled as distinct fields here rather than mixed into `kwargs`, so step
/// 3 of §4.2 ("extract reserved fields from user-facing kwargs") is
/// enforced by construction: a caller cannot accidentally leak them into
/// the fingerprinted payload.
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    pub task_path: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub queue_name: String,
    pub priority: i16,
    pub run_after: RunAfter,
    pub exec: ExecOptions,
    pub takes_context: bool,
    pub lock_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<i32>,
    /// Soft TTL (§3): a `READY` row still unclaimed past this instant is
    /// expired by the reaper rather than executed (§4.5).
    pub expires_at: Option<DateTime<Utc>>,
    pub provenance: Option<serde_json::Map<String, serde_json::Value>>,
    /// When `false`, skip the in-flight dedup check (defaults to on, §4.2 step 6).
    pub dedup: bool,
    /// Workflow routing, threaded through by the workflow coordinator.
    pub parent_id: Option<i64>,
    pub workflow_id: Option<Uuid>,
    pub wait_count: i32,
    pub initial_status: crate::model::TaskStatus,
}

impl EnqueueSpec {
    pub fn new(task_path: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            task_path: task_path.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            queue_name: queue_name.into(),
            priority: 0,
            run_after: RunAfter::Immediately,
            exec: ExecOptions::default(),
            takes_context: false,
            lock_key: None,
            concurrency_key: None,
            concurrency_limit: None,
            expires_at: None,
            provenance: None,
            dedup: true,
            parent_id: None,
            workflow_id: None,
            wait_count: 0,
            initial_status: crate::model::TaskStatus::Ready,
        }
    }

    fn resolve_run_after(&self) -> Option<DateTime<Utc>> {
        match &self.run_after {
            RunAfter::Immediately => None,
            RunAfter::In(duration) => {
                Some(Utc::now() + ChronoDuration::from_std(*duration).unwrap_or_default())
            }
            RunAfter::At(at) => Some(*at),
        }
    }

    /// Build the full enqueue specification JSON (§6 schema) this task's
    /// fingerprint is computed over.
    fn to_spec_json(&self, run_after: Option<DateTime<Utc>>) -> Result<serde_json::Value, ReproqError> {
        for key in self.kwargs.keys() {
            if key == TYPE_TAG_KEY {
                return Err(ReproqError::ValidationError(format!(
                    "kwargs key collides with reserved tag {TYPE_TAG_KEY}"
                )));
            }
        }

        let mut spec = serde_json::Map::new();
        spec.insert("v".to_string(), serde_json::json!(1));
        spec.insert("task_path".to_string(), serde_json::json!(self.task_path));
        spec.insert("args".to_string(), serde_json::Value::Array(self.args.clone()));
        spec.insert("kwargs".to_string(), serde_json::Value::Object(self.kwargs.clone()));
        spec.insert("queue_name".to_string(), serde_json::json!(self.queue_name));
        spec.insert("priority".to_string(), serde_json::json!(self.priority));
        spec.insert(
            "run_after".to_string(),
            run_after.map(|t| serde_json::json!(t.to_rfc3339())).unwrap_or(serde_json::Value::Null),
        );
        spec.insert(
            "exec".to_string(),
            serde_json::json!({"timeout_seconds": self.exec.timeout_seconds, "max_attempts": self.exec.max_attempts}),
        );
        if self.takes_context {
            spec.insert("takes_context".to_string(), serde_json::json!(true));
        }
        if let Some(lock_key) = &self.lock_key {
            spec.insert("lock_key".to_string(), serde_json::json!(lock_key));
        }
        if let Some(key) = &self.concurrency_key {
            spec.insert("concurrency_key".to_string(), serde_json::json!(key));
        }
        if let Some(limit) = self.concurrency_limit {
            spec.insert("concurrency_limit".to_string(), serde_json::json!(limit));
        }
        if let Some(expires_at) = self.expires_at {
            spec.insert("expires_at".to_string(), serde_json::json!(expires_at.to_rfc3339()));
        }
        if let Some(provenance) = &self.provenance {
            spec.insert("provenance".to_string(), serde_json::Value::Object(provenance.clone()));
        }

        Ok(serde_json::Value::Object(spec))
    }
}

/// An opaque handle to an enqueued (or already in-flight) task (§9 "Handle
/// objects returning deferred results").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub result_id: i64,
}

impl Handle {
    /// Re-read the current `TaskRun` row behind this handle.
    pub async fn fetch(&self, engine: &Engine) -> anyhow::Result<Option<crate::model::TaskRun>> {
        use crate::model::Record;
        crate::model::TaskRun::find_by_id(self.result_id, engine).await
    }
}

/// Enqueue one task, honoring the in-flight dedup rule (§4.2).
pub async fn enqueue(engine: &Engine, spec: EnqueueSpec) -> Result<Handle, ReproqError> {
    if !engine.config.is_queue_allowed(&spec.queue_name) {
        return Err(ReproqError::UnknownQueue(spec.queue_name.clone()));
    }

    let run_after = spec.resolve_run_after();
    let spec_json = spec.to_spec_json(run_after)?;
    let spec_hash = fingerprint(&spec_json);

    if spec.dedup {
        if let Some(result_id) = find_inflight(engine, &spec_hash).await? {
            return Ok(Handle { result_id });
        }
    }

    match try_insert(engine, &spec, &spec_json, &spec_hash, run_after).await {
        Ok(result_id) => Ok(Handle { result_id }),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // A concurrent enqueue won the dedup race; reselect.
            if let Some(result_id) = find_inflight(engine, &spec_hash).await.map_err(map_sqlx)? {
                return Ok(Handle { result_id });
            }
            // The winner already finished (terminal) between our SELECT and
            // its commit: retry the insert once more.
            match try_insert(engine, &spec, &spec_json, &spec_hash, run_after).await {
                Ok(result_id) => Ok(Handle { result_id }),
                Err(_) => Err(ReproqError::EnqueueConflict { spec_hash }),
            }
        }
        Err(e) => Err(map_sqlx(e)),
    }
}

/// Enqueue many specs at once, grouped by the single configured alias.
/// Pre-fetches existing dedup matches in chunks of at most 1000, inserts
/// the remainder with `ON CONFLICT DO NOTHING`, then reloads ids for
/// matched hashes. Returns handles in input order (§4.2 "Bulk enqueue").
pub async fn bulk_enqueue(engine: &Engine, specs: Vec<EnqueueSpec>) -> Result<Vec<Handle>, ReproqError> {
    const CHUNK: usize = 1000;

    let mut prepared = Vec::with_capacity(specs.len());
    for spec in &specs {
        if !engine.config.is_queue_allowed(&spec.queue_name) {
            return Err(ReproqError::UnknownQueue(spec.queue_name.clone()));
        }
        let run_after = spec.resolve_run_after();
        let spec_json = spec.to_spec_json(run_after)?;
        let spec_hash = fingerprint(&spec_json);
        prepared.push((spec_json, spec_hash, run_after));
    }

    let mut existing: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for chunk in prepared.chunks(CHUNK) {
        let hashes: Vec<&str> = chunk.iter().map(|(_, h, _)| h.as_str()).collect();
        let rows = sqlx::query(
            "SELECT result_id, spec_hash FROM task_runs WHERE spec_hash = ANY($1) AND status IN ('READY', 'RUNNING')",
        )
        .bind(&hashes)
        .fetch_all(&engine.db)
        .await
        .map_err(map_sqlx)?;
        for row in rows {
            let hash: String = row.try_get("spec_hash").map_err(map_sqlx)?;
            let id: i64 = row.try_get("result_id").map_err(map_sqlx)?;
            existing.insert(hash, id);
        }
    }

    for (i, spec) in specs.iter().enumerate() {
        let (spec_json, spec_hash, run_after) = &prepared[i];
        if existing.contains_key(spec_hash) {
            continue;
        }
        let inserted = try_insert_ignore_conflict(engine, spec, spec_json, spec_hash, *run_after)
            .await
            .map_err(map_sqlx)?;
        if let Some(id) = inserted {
            existing.insert(spec_hash.clone(), id);
        }
    }

    // Anything still missing lost a race between our bulk insert and a
    // concurrent single enqueue; reselect once more.
    let missing: Vec<&str> = prepared
        .iter()
        .filter(|(_, hash, _)| !existing.contains_key(hash))
        .map(|(_, hash, _)| hash.as_str())
        .collect();
    if !missing.is_empty() {
        let rows = sqlx::query(
            "SELECT result_id, spec_hash FROM task_runs WHERE spec_hash = ANY($1) AND status IN ('READY', 'RUNNING')",
        )
        .bind(&missing)
        .fetch_all(&engine.db)
        .await
        .map_err(map_sqlx)?;
        for row in rows {
            let hash: String = row.try_get("spec_hash").map_err(map_sqlx)?;
            let id: i64 = row.try_get("result_id").map_err(map_sqlx)?;
            existing.insert(hash, id);
        }
    }

    prepared
        .iter()
        .map(|(_, hash, _)| {
            existing
                .get(hash)
                .map(|id| Handle { result_id: *id })
                .ok_or_else(|| ReproqError::EnqueueConflict { spec_hash: hash.clone() })
        })
        .collect()
}

async fn find_inflight(engine: &Engine, spec_hash: &str) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT result_id FROM task_runs WHERE spec_hash = $1 AND status IN ('READY', 'RUNNING')")
        .bind(spec_hash)
        .fetch_optional(&engine.db)
        .await
}

async fn try_insert(
    engine: &Engine,
    spec: &EnqueueSpec,
    spec_json: &serde_json::Value,
    spec_hash: &str,
    run_after: Option<DateTime<Utc>>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO task_runs (
            queue_name, priority, lock_key, concurrency_key, concurrency_limit,
            task_path, spec, spec_hash, run_after, expires_at, status, max_attempts, timeout_seconds,
            parent_id, workflow_id, wait_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING result_id
        "#,
    )
    .bind(&spec.queue_name)
    .bind(spec.priority)
    .bind(&spec.lock_key)
    .bind(&spec.concurrency_key)
    .bind(spec.concurrency_limit)
    .bind(&spec.task_path)
    .bind(spec_json)
    .bind(spec_hash)
    .bind(run_after)
    .bind(spec.expires_at)
    .bind(spec.initial_status)
    .bind(spec.exec.max_attempts)
    .bind(spec.exec.timeout_seconds)
    .bind(spec.parent_id)
    .bind(spec.workflow_id)
    .bind(spec.wait_count)
    .fetch_one(&engine.db)
    .await
}

async fn try_insert_ignore_conflict(
    engine: &Engine,
    spec: &EnqueueSpec,
    spec_json: &serde_json::Value,
    spec_hash: &str,
    run_after: Option<DateTime<Utc>>,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO task_runs (
            queue_name, priority, lock_key, concurrency_key, concurrency_limit,
            task_path, spec, spec_hash, run_after, expires_at, status, max_attempts, timeout_seconds,
            parent_id, workflow_id, wait_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (spec_hash) WHERE status IN ('READY', 'RUNNING') DO NOTHING
        RETURNING result_id
        "#,
    )
    .bind(&spec.queue_name)
    .bind(spec.priority)
    .bind(&spec.lock_key)
    .bind(&spec.concurrency_key)
    .bind(spec.concurrency_limit)
    .bind(&spec.task_path)
    .bind(spec_json)
    .bind(spec_hash)
    .bind(run_after)
    .bind(spec.expires_at)
    .bind(spec.initial_status)
    .bind(spec.exec.max_attempts)
    .bind(spec.exec.timeout_seconds)
    .bind(spec.parent_id)
    .bind(spec.workflow_id)
    .bind(spec.wait_count)
    .fetch_optional(&engine.db)
    .await
}

fn map_sqlx(e: sqlx::Error) -> ReproqError {
    ReproqError::ValidationError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_kwargs_key_is_rejected() {
        let mut spec = EnqueueSpec::new("pkg.t", "default");
        spec.kwargs.insert(TYPE_TAG_KEY.to_string(), serde_json::json!("x"));
        let err = spec.to_spec_json(None).unwrap_err();
        assert!(matches!(err, ReproqError::ValidationError(_)));
    }

    #[test]
    fn identical_specs_hash_identically_regardless_of_kwargs_order() {
        let mut a = EnqueueSpec::new("pkg.t", "default");
        a.kwargs.insert("b".to_string(), serde_json::json!(1));
        a.kwargs.insert("a".to_string(), serde_json::json!(2));

        let mut b = EnqueueSpec::new("pkg.t", "default");
        b.kwargs.insert("a".to_string(), serde_json::json!(2));
        b.kwargs.insert("b".to_string(), serde_json::json!(1));

        let hash_a = fingerprint(&a.to_spec_json(None).unwrap());
        let hash_b = fingerprint(&b.to_spec_json(None).unwrap());
        assert_eq!(hash_a, hash_b);
    }
}
