//! reproq — a durable, Postgres-backed distributed task queue.
//!
//! Producers enqueue specifications of deferred work; a fleet of worker
//! processes claims, leases, executes (via an external subprocess executor),
//! and finalizes those specifications with at-least-once semantics.

pub mod claim;
pub mod config;
pub mod error;
pub mod executor;
pub mod finalize;
pub mod kernel;
pub mod lease;
pub mod model;
pub mod periodic;
pub mod producer;
pub mod reclaim;
pub mod serialize;
pub mod workflow;

pub use config::Config;
pub use error::ReproqError;
pub use kernel::Engine;
