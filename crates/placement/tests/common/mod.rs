// Scripted runners, pools and factories shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_placement::call::{CallModel, InvocationCall, RunnerCall};
use switchyard_placement::context::CallContext;
use switchyard_placement::pool::{AttemptOutcome, PoolError, RunnerPool};
use switchyard_placement::runner::{
    CallCompletion, FactoryError, InFlightGate, Runner, RunnerError, RunnerFactory, RunnerStatus,
    TryOutcome,
};
use tokio::sync::Notify;

/// What a scripted runner does when offered a call
#[derive(Clone)]
pub enum Behavior {
    Accept,
    Decline,
    Fail,
    /// Decline the first `n` offers, then accept
    DeclineTimes(usize),
    /// Accept, but only finish once the notify fires
    Hold(Arc<Notify>),
    /// Block until the call context ends
    Stall,
}

/// Ordered record of attempts across every runner of a test
#[derive(Default)]
pub struct AttemptLog {
    entries: Mutex<Vec<String>>,
}

impl AttemptLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, address: &str) {
        self.entries.lock().push(address.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

pub struct ScriptedRunner {
    address: String,
    behavior: Behavior,
    log: Arc<AttemptLog>,
    gate: InFlightGate,
    offers: AtomicUsize,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl ScriptedRunner {
    pub fn new(address: &str, behavior: Behavior, log: &Arc<AttemptLog>) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            behavior,
            log: Arc::clone(log),
            gate: InFlightGate::new(),
            offers: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn try_exec(
        &self,
        ctx: &CallContext,
        _call: &dyn RunnerCall,
    ) -> Result<TryOutcome, RunnerError> {
        let _guard = self.gate.enter().ok_or(RunnerError::Closed)?;
        let offer = self.offers.fetch_add(1, Ordering::SeqCst);
        self.log.push(&self.address);

        match &self.behavior {
            Behavior::Accept => Ok(TryOutcome::Accepted(CallCompletion::succeeded("ok"))),
            Behavior::Decline => Ok(TryOutcome::Declined),
            Behavior::Fail => Err(RunnerError::Protocol("scripted failure".to_string())),
            Behavior::DeclineTimes(n) if offer < *n => Ok(TryOutcome::Declined),
            Behavior::DeclineTimes(_) => {
                Ok(TryOutcome::Accepted(CallCompletion::succeeded("ok")))
            }
            Behavior::Hold(release) => {
                release.notified().await;
                Ok(TryOutcome::Accepted(CallCompletion::succeeded("held")))
            }
            Behavior::Stall => Err(RunnerError::Context(ctx.done().await)),
        }
    }

    async fn status(&self, ctx: &CallContext) -> Result<RunnerStatus, RunnerError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let healthy = self.healthy.load(Ordering::SeqCst);
        Ok(RunnerStatus {
            active_request_count: self.gate.in_flight() as u32,
            status_failed: !healthy,
            status_id: format!("{}-status", self.address),
            details: if healthy { "ok".into() } else { "unhealthy".into() },
            ..Default::default()
        })
    }

    async fn close(&self, ctx: &CallContext) -> Result<(), RunnerError> {
        ctx.run(self.gate.close()).await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

pub fn as_runners(runners: &[Arc<ScriptedRunner>]) -> Vec<Arc<dyn Runner>> {
    runners
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn Runner>)
        .collect()
}

/// Pool that returns its runners verbatim and records placement feedback
pub struct ScriptedPool {
    runners: Vec<Arc<dyn Runner>>,
    stall: bool,
    queries: AtomicUsize,
    recorded: Mutex<Vec<(String, AttemptOutcome)>>,
}

impl ScriptedPool {
    pub fn new(runners: &[Arc<ScriptedRunner>]) -> Self {
        Self {
            runners: as_runners(runners),
            stall: false,
            queries: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// A pool whose candidate query never returns
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new(&[])
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<(String, AttemptOutcome)> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl RunnerPool for ScriptedPool {
    async fn runners(&self, _call: &dyn RunnerCall) -> Result<Vec<Arc<dyn Runner>>, PoolError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(self.runners.clone())
    }

    fn record_attempt(&self, address: &str, outcome: AttemptOutcome) {
        self.recorded.lock().push((address.to_string(), outcome));
    }

    async fn shutdown(&self, _ctx: &CallContext) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Factory that builds scripted runners and keeps a handle to each
pub struct ScriptedFactory {
    log: Arc<AttemptLog>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    broken: Mutex<HashSet<String>>,
    built: Mutex<HashMap<String, Arc<ScriptedRunner>>>,
    builds: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(log: &Arc<AttemptLog>) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::clone(log),
            behaviors: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            built: Mutex::new(HashMap::new()),
            builds: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, address: &str, behavior: Behavior) {
        self.behaviors.lock().insert(address.to_string(), behavior);
    }

    /// Builds for `address` fail from now on
    pub fn break_address(&self, address: &str) {
        self.broken.lock().insert(address.to_string());
    }

    pub fn runner(&self, address: &str) -> Option<Arc<ScriptedRunner>> {
        self.built.lock().get(address).cloned()
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerFactory for ScriptedFactory {
    async fn build(&self, address: &str) -> Result<Arc<dyn Runner>, FactoryError> {
        if self.broken.lock().contains(address) {
            return Err(FactoryError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused connection", address),
            )));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .get(address)
            .cloned()
            .unwrap_or(Behavior::Accept);
        let runner = ScriptedRunner::new(address, behavior, &self.log);
        self.built
            .lock()
            .insert(address.to_string(), Arc::clone(&runner));
        Ok(runner as Arc<dyn Runner>)
    }
}

pub fn call() -> InvocationCall {
    InvocationCall::new(CallModel::new("app-1", "fn-1", "registry/fn:1")).with_body(b"{}".to_vec())
}

pub fn call_with_slot(slot: &str) -> InvocationCall {
    call().with_slot_hash_id(slot)
}

pub fn addresses(list: &[&str]) -> Vec<String> {
    list.iter().map(|a| a.to_string()).collect()
}

/// Yield until `condition` holds, panicking after many rounds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
