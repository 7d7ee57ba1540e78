//! Error kinds surfaced by the engine (§7).

use thiserror::Error;

/// Errors the engine itself raises or persists. Attempt-level failures
/// (executor exceptions, timeouts) are captured as [`crate::model::task_run::ErrorRecord`]
/// rows rather than as this enum — these variants are the ones that either
/// reach a caller directly (validation) or get matched on by callers that
/// need to distinguish engine-level failure modes.
#[derive(Debug, Error)]
pub enum ReproqError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("execution failed: {exception_class}: {message}")]
    ExecutionFailed {
        exception_class: String,
        message: String,
        traceback: Option<String>,
    },

    #[error("attempt timed out after {timeout_seconds}s")]
    Timeout { timeout_seconds: i32 },

    #[error("lease lost for result_id {result_id}")]
    LeaseLost { result_id: i64 },

    #[error("cancelled")]
    Cancelled,

    #[error("enqueue conflict: could not resolve dedup race for spec_hash {spec_hash}")]
    EnqueueConflict { spec_hash: String },

    #[error("spec payload of {actual} bytes exceeds max_payload_bytes ({limit})")]
    PayloadTooLarge { actual: usize, limit: usize },
}
