// Run a consistent-hash pool and report runner health until interrupted
//
// Membership comes from the configured address list, or from a file that is
// re-read periodically when one is given. The pool follows file changes live.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use switchyard_placement::prelude::*;
use switchyard_placement::RunnerHealth;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{build_factory, shutdown_pool};
use crate::config::{parse_addresses, LbConfig};

#[derive(Debug, Clone)]
pub struct WatchArgs {
    pub membership_file: Option<PathBuf>,
    pub reload_interval: Duration,
    pub report_interval: Duration,
}

/// Membership file: addresses separated by commas or whitespace, `#` comments
pub async fn read_membership(path: &Path) -> Result<Vec<String>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read membership file {}", path.display()))?;
    let mut addresses: Vec<String> = raw
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(parse_addresses)
        .collect();
    addresses.dedup();
    Ok(addresses)
}

pub async fn run(config: &LbConfig, args: WatchArgs) -> Result<()> {
    let initial = match &args.membership_file {
        Some(path) => read_membership(path).await?,
        None => config.runner_addresses.clone(),
    };

    let factory = build_factory(config).await?;
    let pool = ConsistentHashPool::new(factory, config.hash_pool.clone());
    let (membership_tx, membership_rx) = watch::channel(initial);
    pool.watch_membership(membership_rx);
    pool.start_health_checks();

    info!(
        membership_file = ?args.membership_file,
        health_check_interval_ms = config.hash_pool.health_check_interval.as_millis() as u64,
        "Watching runner pool"
    );

    let mut reload = tokio::time::interval(args.reload_interval);
    let mut report = tokio::time::interval(args.report_interval);
    reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Received shutdown signal");
                break;
            }
            _ = reload.tick(), if args.membership_file.is_some() => {
                let Some(path) = &args.membership_file else { continue };
                match read_membership(path).await {
                    Ok(addresses) => {
                        membership_tx.send_if_modified(|current| {
                            if *current == addresses {
                                return false;
                            }
                            info!(runners = addresses.len(), "Membership file changed");
                            *current = addresses;
                            true
                        });
                    }
                    Err(e) => warn!(error = %e, "Keeping previous membership"),
                }
            }
            _ = report.tick() => log_health(&pool.health()),
        }
    }

    shutdown_pool(&pool, config).await;
    Ok(())
}

fn log_health(health: &[RunnerHealth]) {
    if health.is_empty() {
        warn!("Runner pool is empty");
        return;
    }
    for member in health {
        match (&member.last_error, &member.last_status) {
            (Some(error), _) => warn!(
                address = %member.address,
                circuit = ?member.circuit,
                error = %error,
                "Runner unhealthy"
            ),
            (None, Some(status)) => info!(
                address = %member.address,
                circuit = ?member.circuit,
                active = status.active_request_count,
                "Runner healthy"
            ),
            (None, None) => debug!(address = %member.address, "Runner not probed yet"),
        }
    }
}
