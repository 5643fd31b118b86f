//! Dynamic pool ordered by consistent hashing
//!
//! Membership is an immutable snapshot behind an `Arc`; writers build a new
//! snapshot and swap it in, so `runners()` never waits on a membership
//! change and never observes a half-applied one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::ring::{HashRing, DEFAULT_VIRTUAL_NODES};
use super::{close_runners, AttemptOutcome, PoolError, RunnerPool};
use crate::call::RunnerCall;
use crate::context::CallContext;
use crate::reliability::duration_millis;
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::runner::{Runner, RunnerFactory, RunnerStatus};

/// Consistent-hash pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashPoolConfig {
    /// Virtual nodes per runner on the ring
    pub virtual_nodes: usize,

    /// Per-runner circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// Period of the background status probe
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Deadline for a single status probe
    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,

    /// How long a removed runner may drain before its close gives up
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
}

impl Default for HashPoolConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl HashPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Health view of one pool member
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerHealth {
    pub address: String,
    pub circuit: CircuitState,
    /// Last successful status probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunnerStatus>,
    /// Error from the last probe, if it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ProbeRecord {
    status: Option<RunnerStatus>,
    error: Option<String>,
    checked_at: Option<DateTime<Utc>>,
}

struct Member {
    runner: Arc<dyn Runner>,
    breaker: CircuitBreaker,
    probe: Mutex<ProbeRecord>,
}

impl Member {
    fn new(runner: Arc<dyn Runner>, breaker: CircuitBreakerConfig) -> Self {
        Self {
            runner,
            breaker: CircuitBreaker::new(breaker),
            probe: Mutex::new(ProbeRecord::default()),
        }
    }

    fn health(&self, address: &str) -> RunnerHealth {
        let probe = self.probe.lock();
        RunnerHealth {
            address: address.to_string(),
            circuit: self.breaker.state(),
            last_status: probe.status.clone(),
            last_error: probe.error.clone(),
            checked_at: probe.checked_at,
        }
    }

    fn record(&self, outcome: AttemptOutcome) {
        let before = self.breaker.state();
        match outcome {
            AttemptOutcome::Accepted => self.breaker.record_success(),
            AttemptOutcome::Failed => self.breaker.record_failure(),
            // A busy runner is not an unhealthy one
            AttemptOutcome::Declined => return,
        }
        let after = self.breaker.state();
        if before != after {
            match after {
                CircuitState::Open => {
                    warn!(runner = %self.runner.address(), "Circuit opened, runner demoted")
                }
                CircuitState::Closed => {
                    info!(runner = %self.runner.address(), "Circuit closed, runner recovered")
                }
                CircuitState::HalfOpen => {
                    debug!(runner = %self.runner.address(), "Circuit half-open")
                }
            }
        }
    }
}

struct Membership {
    members: BTreeMap<String, Arc<Member>>,
    ring: HashRing,
}

impl Membership {
    fn new(members: BTreeMap<String, Arc<Member>>, virtual_nodes: usize) -> Self {
        let ring = HashRing::new(members.keys().cloned().collect(), virtual_nodes);
        Self { members, ring }
    }

    fn empty() -> Self {
        Self {
            members: BTreeMap::new(),
            ring: HashRing::default(),
        }
    }
}

/// State shared with the background loops
struct Shared {
    factory: Arc<dyn RunnerFactory>,
    config: HashPoolConfig,
    membership: RwLock<Arc<Membership>>,
    closed: AtomicBool,
}

impl Shared {
    fn snapshot(&self) -> Arc<Membership> {
        Arc::clone(&self.membership.read())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn add_runner(&self, address: &str) -> Result<bool, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.snapshot().members.contains_key(address) {
            return Ok(false);
        }

        let runner = self.factory.build(address).await?;

        let rejected = {
            let mut membership = self.membership.write();
            if self.is_closed() || membership.members.contains_key(address) {
                Some(runner)
            } else {
                let mut members = membership.members.clone();
                members.insert(
                    address.to_string(),
                    Arc::new(Member::new(runner, self.config.circuit_breaker.clone())),
                );
                *membership = Arc::new(Membership::new(members, self.config.virtual_nodes));
                None
            }
        };

        // Lost a race with shutdown or a concurrent add of the same address
        if let Some(runner) = rejected {
            if let Err(e) = runner.close(&CallContext::background()).await {
                debug!(%address, error = %e, "Failed to close redundant runner");
            }
            return if self.is_closed() {
                Err(PoolError::Closed)
            } else {
                Ok(false)
            };
        }

        info!(%address, "Added runner to pool");
        Ok(true)
    }

    fn remove_runner(&self, address: &str) -> bool {
        let removed = {
            let mut membership = self.membership.write();
            if !membership.members.contains_key(address) {
                None
            } else {
                let mut members = membership.members.clone();
                let removed = members.remove(address);
                *membership = Arc::new(Membership::new(members, self.config.virtual_nodes));
                removed
            }
        };

        let Some(member) = removed else {
            return false;
        };

        info!(%address, "Removed runner from pool, draining in the background");
        let drain_timeout = self.config.drain_timeout;
        let address = address.to_string();
        tokio::spawn(async move {
            let ctx = CallContext::with_timeout_from_now(drain_timeout);
            match member.runner.close(&ctx).await {
                Ok(()) => debug!(%address, "Removed runner closed"),
                Err(e) => warn!(%address, error = %e, "Removed runner did not drain cleanly"),
            }
        });
        true
    }

    async fn set_membership(&self, addresses: &[String]) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let desired: BTreeSet<&str> = addresses.iter().map(String::as_str).collect();
        let current: Vec<String> = self.snapshot().members.keys().cloned().collect();

        for address in current.iter().filter(|a| !desired.contains(a.as_str())) {
            self.remove_runner(address);
        }

        let additions = desired
            .iter()
            .filter(|a| !current.iter().any(|c| c == *a))
            .map(|address| async move { (*address, self.add_runner(address).await) });

        for (address, result) in futures::future::join_all(additions).await {
            match result {
                Ok(_) => {}
                Err(PoolError::Closed) => return Err(PoolError::Closed),
                Err(e) => {
                    warn!(%address, error = %e, "Failed to add runner, it stays out until the next membership update")
                }
            }
        }
        Ok(())
    }

    async fn probe(&self, member: &Member) {
        let ctx = CallContext::with_timeout_from_now(self.config.probe_timeout);
        let result = member.runner.status(&ctx).await;

        let outcome = match &result {
            Ok(status) if status.is_healthy() => AttemptOutcome::Accepted,
            _ => AttemptOutcome::Failed,
        };
        member.record(outcome);

        let mut probe = member.probe.lock();
        probe.checked_at = Some(Utc::now());
        match result {
            Ok(status) => {
                probe.error = if status.is_healthy() {
                    None
                } else {
                    Some(status.error_str.clone().unwrap_or_else(|| status.details.clone()))
                };
                probe.status = Some(status);
            }
            Err(e) => {
                debug!(runner = %member.runner.address(), error = %e, "Status probe failed");
                probe.error = Some(e.to_string());
            }
        }
    }

    async fn probe_all(&self) -> Vec<RunnerHealth> {
        let snapshot = self.snapshot();
        futures::future::join_all(snapshot.members.values().map(|m| self.probe(m))).await;
        health_of(&snapshot)
    }
}

fn health_of(membership: &Membership) -> Vec<RunnerHealth> {
    membership
        .members
        .iter()
        .map(|(address, member)| member.health(address))
        .collect()
}

/// Runner pool with live membership and hash-ordered candidates
///
/// Candidates for a call are every member, ordered by walking the hash ring
/// from the call's routing key. Members whose circuit is open move to the
/// tail instead of disappearing, so a call can still land when every runner
/// looks unhealthy.
///
/// # Example
///
/// ```ignore
/// let pool = ConsistentHashPool::new(Arc::new(factory), HashPoolConfig::default());
/// pool.set_membership(&["10.0.0.1:9190".into(), "10.0.0.2:9190".into()]).await?;
/// pool.start_health_checks();
///
/// let placer = OrderedPlacer::new(PlacerConfig::default());
/// let placement = placer.place_call(&pool, &ctx, &call).await?;
///
/// pool.shutdown(&CallContext::with_timeout_from_now(Duration::from_secs(30))).await?;
/// ```
pub struct ConsistentHashPool {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    membership_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConsistentHashPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashPool")
            .field("config", &self.shared.config)
            .field("members", &self.addresses())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConsistentHashPool {
    pub fn new(factory: Arc<dyn RunnerFactory>, config: HashPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                membership: RwLock::new(Arc::new(Membership::empty())),
                closed: AtomicBool::new(false),
            }),
            shutdown_tx,
            shutdown_rx,
            health_handle: Mutex::new(None),
            membership_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HashPoolConfig {
        &self.shared.config
    }

    /// Current member addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        self.shared.snapshot().members.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.snapshot().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Build and admit a runner; `Ok(false)` if the address is already a member
    pub async fn add_runner(&self, address: &str) -> Result<bool, PoolError> {
        self.shared.add_runner(address).await
    }

    /// Drop a member; it stops receiving new calls immediately and is closed
    /// in the background once its in-flight attempts drain
    ///
    /// Must be called from within a Tokio runtime.
    pub fn remove_runner(&self, address: &str) -> bool {
        self.shared.remove_runner(address)
    }

    /// Reconcile membership with `addresses`
    ///
    /// Addresses that fail to build are logged and left out.
    #[instrument(skip(self, addresses), fields(desired = addresses.len()))]
    pub async fn set_membership(&self, addresses: &[String]) -> Result<(), PoolError> {
        self.shared.set_membership(addresses).await
    }

    /// Follow a membership source until it closes or the pool shuts down
    pub fn watch_membership(&self, mut updates: watch::Receiver<Vec<String>>) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let addresses = updates.borrow_and_update().clone();
                if let Err(PoolError::Closed) = shared.set_membership(&addresses).await {
                    break;
                }

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            debug!("Membership source closed");
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Membership loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Membership loop exited");
        });

        if let Some(previous) = self.membership_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Probe every member's status on the configured interval
    pub fn start_health_checks(&self) {
        let interval = self.shared.config.health_check_interval;
        if interval.is_zero() {
            warn!("Health check interval is zero, background probes disabled");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = shared.probe_all().await;
                        let open = health.iter().filter(|h| h.circuit == CircuitState::Open).count();
                        debug!(members = health.len(), open, "Health probe round complete");
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Health loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Health loop exited");
        });

        if let Some(previous) = self.health_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Probe every member once and return the resulting health view
    pub async fn probe_all(&self) -> Vec<RunnerHealth> {
        self.shared.probe_all().await
    }

    /// Health view from the latest probes and attempt outcomes
    pub fn health(&self) -> Vec<RunnerHealth> {
        health_of(&self.shared.snapshot())
    }
}

impl Drop for ConsistentHashPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl RunnerPool for ConsistentHashPool {
    async fn runners(&self, call: &dyn RunnerCall) -> Result<Vec<Arc<dyn Runner>>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let snapshot = self.shared.snapshot();
        if snapshot.members.is_empty() {
            return Err(PoolError::NoRunners);
        }

        let mut preferred = Vec::with_capacity(snapshot.members.len());
        let mut demoted = Vec::new();
        for address in snapshot.ring.candidates(call.slot_hash_id()) {
            if let Some(member) = snapshot.members.get(address) {
                if member.breaker.allows_requests() {
                    preferred.push(Arc::clone(&member.runner));
                } else {
                    demoted.push(Arc::clone(&member.runner));
                }
            }
        }

        debug!(
            slot = %call.slot_hash_id(),
            candidates = preferred.len() + demoted.len(),
            demoted = demoted.len(),
            "Ordered candidates"
        );
        preferred.append(&mut demoted);
        Ok(preferred)
    }

    fn record_attempt(&self, address: &str, outcome: AttemptOutcome) {
        if let Some(member) = self.shared.snapshot().members.get(address) {
            member.record(outcome);
        }
    }

    #[instrument(skip(self, ctx))]
    async fn shutdown(&self, ctx: &CallContext) -> Result<(), PoolError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);

        let retired = {
            let mut membership = self.shared.membership.write();
            std::mem::replace(&mut *membership, Arc::new(Membership::empty()))
        };
        let runners: Vec<Arc<dyn Runner>> = retired
            .members
            .values()
            .map(|m| Arc::clone(&m.runner))
            .collect();

        info!(runners = runners.len(), "Shutting down consistent-hash pool");
        close_runners(ctx, runners).await
    }
}
