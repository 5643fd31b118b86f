//! Failover placer that tries candidates strictly in pool order

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{Placement, PlacementError, Placer, PlacerConfig};
use crate::call::RunnerCall;
use crate::context::CallContext;
use crate::pool::{AttemptOutcome, RunnerPool};
use crate::runner::{RunnerError, TryOutcome};

/// Tries each candidate once per round, in the order the pool returned,
/// and stops at the first acceptance
///
/// Acceptance is decided by a single `try_exec`, and nothing is tried after
/// it, so a call is dispatched to at most one runner.
#[derive(Debug, Clone, Default)]
pub struct OrderedPlacer {
    config: PlacerConfig,
}

impl OrderedPlacer {
    pub fn new(config: PlacerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacerConfig {
        &self.config
    }
}

#[async_trait]
impl Placer for OrderedPlacer {
    #[instrument(
        skip_all,
        fields(call_id = %call.model().id, slot = %call.slot_hash_id())
    )]
    async fn place_call(
        &self,
        pool: &dyn RunnerPool,
        ctx: &CallContext,
        call: &dyn RunnerCall,
    ) -> Result<Placement, PlacementError> {
        let ctx = match self.config.placement_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let retry = &self.config.retry;

        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut round = 1u32;

        loop {
            if let Some(err) = ctx.err() {
                return Err(PlacementError::Canceled(err));
            }
            let runners = ctx.run(pool.runners(call)).await??;
            debug!(round, candidates = runners.len(), "Selected candidates");

            for runner in runners {
                if let Some(err) = ctx.err() {
                    debug!(attempts, "Context done, abandoning remaining candidates");
                    return Err(PlacementError::Canceled(err));
                }

                attempts += 1;
                let address = runner.address();
                debug!(runner = %address, attempt = attempts, "Trying runner");

                match runner.try_exec(&ctx, call).await {
                    Ok(TryOutcome::Accepted(completion)) => {
                        pool.record_attempt(address, AttemptOutcome::Accepted);
                        info!(
                            runner = %address,
                            attempts,
                            success = completion.success,
                            "Call placed"
                        );
                        return Ok(Placement {
                            runner: address.to_string(),
                            attempts,
                            completion,
                        });
                    }
                    Ok(TryOutcome::Declined) => {
                        pool.record_attempt(address, AttemptOutcome::Declined);
                        debug!(runner = %address, "Runner declined");
                    }
                    // Not the runner's fault; the next check ends the placement
                    Err(RunnerError::Context(err)) => {
                        debug!(runner = %address, error = %err, "Attempt interrupted by context");
                    }
                    Err(RunnerError::Closed) => {
                        debug!(runner = %address, "Runner is draining, skipping");
                    }
                    Err(e) => {
                        failures += 1;
                        pool.record_attempt(address, AttemptOutcome::Failed);
                        warn!(runner = %address, error = %e, "Runner attempt failed");
                    }
                }
            }

            if let Some(err) = ctx.err() {
                return Err(PlacementError::Canceled(err));
            }
            if !retry.has_attempts_remaining(round) {
                warn!(attempts, failures, rounds = round, "No runner accepted the call");
                return Err(PlacementError::Exhausted { attempts, failures });
            }

            round += 1;
            let delay = retry.delay_for_attempt(round);
            debug!(round, delay_ms = delay.as_millis() as u64, "Backing off before next round");
            ctx.run(tokio::time::sleep(delay)).await?;
        }
    }
}
