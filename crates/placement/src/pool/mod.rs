//! Runner pools
//!
//! This module provides:
//! - [`RunnerPool`] - ordered candidate lists per call, graceful shutdown
//! - [`StaticRunnerPool`] - fixed runner list in configuration order
//! - [`ConsistentHashPool`] - live membership ordered by a hash ring on the
//!   call's routing key, with circuit breakers and health probes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConsistentHashPool                        │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │ Membership loop  │  │ Health probe │  │   Shutdown    │  │
//! │  │ (watch channel)  │  │  (interval)  │  │   (drain)     │  │
//! │  └────────┬─────────┘  └──────┬───────┘  └───────────────┘  │
//! │           ▼                   ▼                              │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        Arc<Membership> snapshot (swap on write)     │    │
//! │  │   members: address -> runner + circuit breaker      │    │
//! │  │   ring: SHA-256 virtual nodes                       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod hash_pool;
mod ring;
mod static_pool;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::call::RunnerCall;
use crate::context::CallContext;
use crate::runner::{FactoryError, Runner};

pub use hash_pool::{ConsistentHashPool, HashPoolConfig, RunnerHealth};
pub use ring::HashRing;
pub use static_pool::StaticRunnerPool;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool has no members
    #[error("no runners available")]
    NoRunners,

    /// Pool was shut down
    #[error("runner pool is closed")]
    Closed,

    /// Shutdown deadline passed before every runner drained
    #[error("runner pool shutdown timed out, teardown continues in the background")]
    ShutdownTimeout,

    /// A runner client could not be built
    #[error("runner construction failed: {0}")]
    Factory(#[from] FactoryError),
}

impl PoolError {
    /// Errors a placer must surface without retrying
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::NoRunners | Self::Closed)
    }
}

/// Placement feedback for pool health bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Declined,
    Failed,
}

/// Owner of the live runner set
#[async_trait]
pub trait RunnerPool: Send + Sync {
    /// Candidates for `call`, most preferred first
    ///
    /// Errors are unrecoverable for this call; runners that are temporarily
    /// unusable are omitted or demoted instead.
    async fn runners(&self, call: &dyn RunnerCall) -> Result<Vec<Arc<dyn Runner>>, PoolError>;

    /// Outcome of one dispatch attempt against `address`
    fn record_attempt(&self, _address: &str, _outcome: AttemptOutcome) {}

    /// Stop handing out candidates and close every runner once drained
    async fn shutdown(&self, ctx: &CallContext) -> Result<(), PoolError>;
}

/// Close `runners` concurrently, bounded by `ctx`
///
/// Teardown runs in its own task, so when `ctx` ends first it keeps going in
/// the background and the caller gets [`PoolError::ShutdownTimeout`].
pub(crate) async fn close_runners(
    ctx: &CallContext,
    runners: Vec<Arc<dyn Runner>>,
) -> Result<(), PoolError> {
    if runners.is_empty() {
        return Ok(());
    }

    let mut teardown = tokio::spawn(async move {
        let background = CallContext::background();
        let closes = runners.iter().map(|runner| {
            let ctx = background.clone();
            async move {
                if let Err(e) = runner.close(&ctx).await {
                    warn!(runner = %runner.address(), error = %e, "Failed to close runner");
                }
            }
        });
        futures::future::join_all(closes).await;
    });

    match ctx.run(&mut teardown).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(error = %err, "Shutdown deadline reached, runners keep draining in the background");
            Err(PoolError::ShutdownTimeout)
        }
    }
}
