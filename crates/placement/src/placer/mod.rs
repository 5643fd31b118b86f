//! Placement strategies
//!
//! A placer walks a pool's candidates for one call until a runner accepts
//! it. Placers borrow runners for the duration of a placement and never
//! close them.
//!
//! # State Machine
//!
//! ```text
//! Selecting ──► Trying(0) ──accepted──► Accepted
//!     │             │
//!     │        declined/error
//!     │             ▼
//!     │         Trying(1) ──► ... ──► Exhausted
//!     │             │
//!     └─────────────┴──── ctx done ──► Canceled
//! ```

mod ordered;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::RunnerCall;
use crate::context::{CallContext, ContextError};
use crate::pool::{PoolError, RunnerPool};
use crate::reliability::option_duration_millis;
use crate::reliability::RetryPolicy;
use crate::runner::CallCompletion;

pub use ordered::OrderedPlacer;

/// Why a call could not be placed
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The pool refused to produce candidates; never retried
    #[error("runner pool unavailable: {0}")]
    Pool(#[from] PoolError),

    /// Every candidate declined or failed
    #[error("no runner accepted the call after {attempts} attempts ({failures} failed)")]
    Exhausted { attempts: u32, failures: u32 },

    /// The caller abandoned the placement
    #[error("placement canceled: {0}")]
    Canceled(#[from] ContextError),
}

impl PlacementError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}

/// A call that a runner accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Address of the accepting runner
    pub runner: String,
    /// Attempts made, including the accepted one
    pub attempts: u32,
    /// Runner's final report for the call
    pub completion: CallCompletion,
}

/// Placer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacerConfig {
    /// Rounds over the candidate list and backoff between them
    pub retry: RetryPolicy,

    /// Upper bound on a whole placement, applied under the caller's context
    #[serde(default, with = "option_duration_millis")]
    pub placement_timeout: Option<Duration>,
}

impl Default for PlacerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::no_retry(),
            placement_timeout: None,
        }
    }
}

impl PlacerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_placement_timeout(mut self, timeout: Duration) -> Self {
        self.placement_timeout = Some(timeout);
        self
    }
}

/// Drives placement of one call onto a pool
#[async_trait]
pub trait Placer: Send + Sync {
    /// Place `call` on the first runner from `pool` that accepts it
    async fn place_call(
        &self,
        pool: &dyn RunnerPool,
        ctx: &CallContext,
        call: &dyn RunnerCall,
    ) -> Result<Placement, PlacementError>;
}
