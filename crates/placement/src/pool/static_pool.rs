//! Fixed-membership pool

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{close_runners, PoolError, RunnerPool};
use crate::call::RunnerCall;
use crate::context::CallContext;
use crate::runner::{Runner, RunnerFactory};

/// Pool over a fixed runner list, returned in configuration order
pub struct StaticRunnerPool {
    runners: RwLock<Vec<Arc<dyn Runner>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StaticRunnerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addresses: Vec<String> = self
            .runners
            .read()
            .iter()
            .map(|r| r.address().to_string())
            .collect();
        f.debug_struct("StaticRunnerPool")
            .field("runners", &addresses)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StaticRunnerPool {
    pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
        Self {
            runners: RwLock::new(runners),
            closed: AtomicBool::new(false),
        }
    }

    /// Build one runner per address
    ///
    /// Addresses that fail to build are logged and left out; duplicates are
    /// built once.
    pub async fn from_addresses(addresses: &[String], factory: &dyn RunnerFactory) -> Self {
        let mut seen = HashSet::new();
        let mut runners = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !seen.insert(address.as_str()) {
                continue;
            }
            match factory.build(address).await {
                Ok(runner) => runners.push(runner),
                Err(e) => warn!(%address, error = %e, "Failed to build runner, leaving it out of the pool"),
            }
        }
        info!(
            configured = addresses.len(),
            built = runners.len(),
            "Static runner pool ready"
        );
        Self::new(runners)
    }

    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerPool for StaticRunnerPool {
    async fn runners(&self, _call: &dyn RunnerCall) -> Result<Vec<Arc<dyn Runner>>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let runners = self.runners.read().clone();
        if runners.is_empty() {
            return Err(PoolError::NoRunners);
        }
        Ok(runners)
    }

    async fn shutdown(&self, ctx: &CallContext) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let runners = std::mem::take(&mut *self.runners.write());
        info!(runners = runners.len(), "Shutting down static runner pool");
        close_runners(ctx, runners).await
    }
}
