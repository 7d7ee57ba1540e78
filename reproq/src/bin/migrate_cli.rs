//! Runs pending schema migrations against `DATABASE_URL`.
//!
//! Thin wrapper kept separate from the main `reproq` binary so migrations
//! can be applied ahead of a deploy without bringing up any service.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    sqlx::migrate!("./migrations").run(&pool).await.context("migration failed")?;
    tracing::info!("migrations applied");
    Ok(())
}
