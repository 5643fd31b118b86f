pub mod place;
pub mod status;
pub mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use switchyard_placement::prelude::*;
use tracing::{info, warn};

use crate::config::{LbConfig, PoolKind};

/// Runner client factory for the configured transport
pub async fn build_factory(config: &LbConfig) -> Result<Arc<dyn RunnerFactory>> {
    match &config.tls {
        Some(tls) => {
            let pki = PkiData::from_files(&tls.ca, &tls.cert, &tls.key)
                .await
                .context("Failed to load runner PKI material")?;
            info!(cert_common_name = %config.cert_common_name, "Using mutual TLS for runners");
            Ok(Arc::new(MtlsRunnerFactory::new(
                config.cert_common_name.clone(),
                pki,
            )))
        }
        None => {
            warn!("RUNNER_TLS_* not set, connecting to runners without TLS");
            Ok(Arc::new(InsecureRunnerFactory::new()))
        }
    }
}

/// Pool of the configured kind over the configured runners
pub async fn build_pool(
    config: &LbConfig,
    factory: Arc<dyn RunnerFactory>,
) -> Result<Box<dyn RunnerPool>> {
    let pool: Box<dyn RunnerPool> = match config.pool {
        PoolKind::Static => Box::new(
            StaticRunnerPool::from_addresses(&config.runner_addresses, factory.as_ref()).await,
        ),
        PoolKind::ConsistentHash => {
            let pool = ConsistentHashPool::new(factory, config.hash_pool.clone());
            pool.set_membership(&config.runner_addresses)
                .await
                .context("Failed to populate runner pool")?;
            Box::new(pool)
        }
    };
    info!(kind = %config.pool, runners = config.runner_addresses.len(), "Runner pool ready");
    Ok(pool)
}

/// Shut a pool down within the configured drain deadline
pub async fn shutdown_pool(pool: &dyn RunnerPool, config: &LbConfig) {
    let ctx = CallContext::with_timeout_from_now(config.shutdown_timeout);
    match pool.shutdown(&ctx).await {
        Ok(()) => info!("Runner pool shut down"),
        Err(e) => warn!(error = %e, "Runner pool shutdown incomplete"),
    }
}
