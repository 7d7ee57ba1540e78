//! Kernel — core infrastructure: the database engine handle and the
//! service-hosting scaffolding every long-running component runs under.
//!
//! IMPORTANT: kernel is for INFRASTRUCTURE only, not queue semantics.
//! Claim/lease/reclaim/finalize/workflow/periodic logic lives in their own
//! top-level modules; this module only wires them to a `PgPool` and a
//! shutdown signal.

pub mod engine;
pub mod service;

pub use engine::Engine;
pub use service::{Service, ServiceHost};
