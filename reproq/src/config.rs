//! Engine configuration loaded from environment variables.
//!
//! The engine is configured by a single immutable struct passed at startup
//! (see §9 "Global settings" — no ambient state, no process-wide statics).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Engine-wide configuration. Built once at startup via [`Config::from_env`]
/// and shared read-only (behind an `Arc`) by every service.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// Queue names producers are allowed to target. Enforced by the
    /// producer path (`UnknownQueue` otherwise).
    pub allowed_queues: Vec<String>,

    /// Queue name → database alias, matched exact-then-glob. A single alias
    /// ("default") is sufficient for a single-database deployment.
    pub queue_aliases: HashMap<String, String>,

    /// How long a claimed row's lease is valid for before it becomes a
    /// reclaim candidate (§4.3, §4.4).
    pub lease_seconds: i64,

    /// Interval between a worker's heartbeat ticks (§4.4).
    pub heartbeat_seconds: u64,

    /// How long a worker waits for in-flight attempts to finish during
    /// graceful shutdown before releasing their leases (§4.4).
    pub shutdown_timeout: Duration,

    /// Interval between reaper sweeps (§4.5).
    pub reclaim_interval_seconds: u64,

    /// Grace period added on top of lease expiry before a row is considered
    /// a reclaim candidate (§4.5).
    pub reclaim_grace_seconds: i64,

    /// Whether the reaper also reclaims rows with a NULL lease (crash before
    /// the first heartbeat ever landed).
    pub reclaim_include_null_lease: bool,

    /// Bound on rows reclaimed per sweep (§4.5).
    pub reclaim_limit: i64,

    /// Bounded exponential backoff applied by a worker when a claim attempt
    /// returns zero candidates (§4.3).
    pub poll_min_backoff: Duration,
    pub poll_max_backoff: Duration,

    /// Interval between periodic-scheduler ticks (§4.8).
    pub scheduler_tick: Duration,

    /// Hard ceiling on the size of an enqueue specification's payload
    /// (§6 "Executor invocation contract").
    pub max_payload_bytes: usize,

    /// Path to the Executor binary a worker invokes per claimed attempt
    /// (§6 "Executor invocation contract").
    pub executor_path: String,

    /// Aging factor dividing queue wait time into extra effective priority
    /// points (§4.3 ordering rule 1). `0` disables aging.
    pub priority_aging_factor_seconds: i64,
}

impl Config {
    /// Load configuration from environment variables, falling back to a
    /// `.env` file in the working directory if present (development only).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let allowed_queues = env::var("REPROQ_QUEUES")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut queue_aliases = HashMap::new();
        queue_aliases.insert("*".to_string(), "default".to_string());

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            allowed_queues,
            queue_aliases,
            lease_seconds: env_parse("REPROQ_LEASE_SECONDS", 60)?,
            heartbeat_seconds: env_parse("REPROQ_HEARTBEAT_SECONDS", 15)?,
            shutdown_timeout: Duration::from_secs(env_parse("REPROQ_SHUTDOWN_TIMEOUT_SECONDS", 30)?),
            reclaim_interval_seconds: env_parse("REPROQ_RECLAIM_INTERVAL_SECONDS", 30)?,
            reclaim_grace_seconds: env_parse("REPROQ_RECLAIM_GRACE_SECONDS", 5)?,
            reclaim_include_null_lease: env_parse("REPROQ_RECLAIM_INCLUDE_NULL_LEASE", true)?,
            reclaim_limit: env_parse("REPROQ_RECLAIM_LIMIT", 500)?,
            poll_min_backoff: Duration::from_millis(env_parse("REPROQ_POLL_MIN_BACKOFF_MS", 200)?),
            poll_max_backoff: Duration::from_millis(env_parse("REPROQ_POLL_MAX_BACKOFF_MS", 5_000)?),
            scheduler_tick: Duration::from_secs(env_parse("REPROQ_SCHEDULER_TICK_SECONDS", 30)?),
            max_payload_bytes: env_parse("REPROQ_MAX_PAYLOAD_BYTES", 1_048_576)?,
            executor_path: env::var("REPROQ_EXECUTOR_PATH").unwrap_or_else(|_| "reproq-executor".to_string()),
            priority_aging_factor_seconds: env_parse("REPROQ_PRIORITY_AGING_FACTOR_SECONDS", 0)?,
        })
    }

    /// Resolve the database alias a queue name routes to: exact match on
    /// the queue name, then glob fallback, then the wildcard default.
    pub fn alias_for_queue(&self, queue_name: &str) -> &str {
        if let Some(alias) = self.queue_aliases.get(queue_name) {
            return alias;
        }
        for (pattern, alias) in &self.queue_aliases {
            if pattern != "*" && glob_match(pattern, queue_name) {
                return alias;
            }
        }
        self.queue_aliases
            .get("*")
            .map(|s| s.as_str())
            .unwrap_or("default")
    }

    pub fn is_queue_allowed(&self, queue_name: &str) -> bool {
        self.allowed_queues.iter().any(|q| q == queue_name)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} is not valid: {e}")),
        Err(_) => Ok(default),
    }
}

/// Minimal `*`-glob matcher for queue alias patterns (no other wildcards).
fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == candidate,
        Some((prefix, suffix)) => {
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
    }
}
