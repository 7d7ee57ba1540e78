//! A minimal service-hosting abstraction.
//!
//! Each long-running component of the queue engine (the worker's lease
//! manager, the reaper, the periodic scheduler) implements [`Service`] and
//! is run to completion by a [`ServiceHost`], which fans a single shutdown
//! signal out to every hosted service and waits for them all to drain.
//!
//! ```ignore
//! ServiceHost::new()
//!     .with_service(Box::new(lease_manager))
//!     .with_service(Box::new(reaper))
//!     .run_until_shutdown()
//!     .await?;
//! ```

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background component.
#[async_trait::async_trait]
pub trait Service: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Run until `shutdown` is cancelled, then return. Implementations
    /// should select on the shutdown token alongside their own work so they
    /// never block it.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Hosts a set of [`Service`]s under one shutdown signal.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Run every hosted service until Ctrl+C (or another externally
    /// cancelled token) is observed, then wait for all of them to drain.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let ctrl_c_token = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            ctrl_c_token.cancel();
        });

        self.run(shutdown).await
    }

    /// Run every hosted service until `shutdown` is cancelled by the
    /// caller. Useful in tests that want deterministic shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();
        for service in self.services {
            let name = service.name().to_string();
            let token = shutdown.clone();
            set.spawn(async move {
                let result = service.run(token).await;
                (name, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = %name, "service stopped"),
                Ok((name, Err(e))) => error!(service = %name, error = %e, "service exited with error"),
                Err(join_err) => error!(error = %join_err, "service task panicked"),
            }
        }

        Ok(())
    }
}
