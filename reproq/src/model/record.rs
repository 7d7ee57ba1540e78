//! `Record` trait for simple CRUD access to persisted entities.

use anyhow::Result;
use async_trait::async_trait;

use crate::kernel::Engine;

/// Standard CRUD surface for a database-backed model. Most engine
/// components (claim, finalize, reclaim) use purpose-built queries instead
/// of these generic methods, since their writes are conditional on row
/// state under a transaction; `Record` exists for the simpler entities
/// (`Worker`, `PeriodicTask`, `QueueControl`) and for tests and tooling.
#[async_trait]
pub trait Record: Sized + Send + Sync {
    const TABLE: &'static str;
    type Id;

    async fn find_by_id(id: Self::Id, engine: &Engine) -> Result<Option<Self>>;
    async fn insert(&self, engine: &Engine) -> Result<Self>;
    async fn update(&self, engine: &Engine) -> Result<Self>;
    async fn delete(&self, engine: &Engine) -> Result<()>;
}
