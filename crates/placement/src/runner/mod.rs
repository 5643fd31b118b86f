//! Runner clients
//!
//! This module provides:
//! - [`Runner`] - the capability a placer invokes on one execution worker
//! - [`GrpcRunner`] - gRPC implementation speaking the runner protocol
//! - [`RunnerFactory`] / [`MtlsRunnerFactory`] - secure channel construction
//!
//! # Try-exec outcomes
//!
//! ```text
//! try_exec ──► Ok(Declined)        runner refused, try the next candidate
//!          ├─► Ok(Accepted(..))    runner owns the call, stop
//!          └─► Err(RunnerError)    not executed, record and try the next
//! ```

mod drain;
mod grpc;
mod mtls;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::RunnerCall;
use crate::context::{CallContext, ContextError};

pub use drain::{InFlightGate, InFlightGuard};
pub use grpc::GrpcRunner;
pub use mtls::{
    build_mtls_runner, FactoryError, InsecureRunnerFactory, MtlsRunnerFactory, PkiData,
    RunnerFactory,
};

/// Runner-local failure before the call was committed
#[derive(Debug, Error)]
pub enum RunnerError {
    /// RPC failed with a gRPC status
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// Channel-level failure
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Runner sent something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Call metadata could not be encoded
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The runner client was closed
    #[error("runner client is closed")]
    Closed,

    /// The call context ended during the attempt
    #[error("{0}")]
    Context(#[from] ContextError),
}

/// Final report of a call the runner committed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCompletion {
    pub success: bool,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_str: Option<String>,
}

impl CallCompletion {
    pub fn succeeded(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            error_code: None,
            error_str: None,
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            error_code: None,
            error_str: None,
        }
    }
}

/// Non-error outcome of a dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryOutcome {
    /// Runner took ownership of the call
    Accepted(CallCompletion),
    /// Runner refused the call; it was not executed
    Declined,
}

impl TryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Point-in-time runner health, as returned by [`Runner::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunnerStatus {
    /// Number of requests running on the runner
    pub active_request_count: u32,
    /// True if the status probe itself failed on the runner
    pub status_failed: bool,
    /// Call ID the runner used for the probe
    pub status_id: String,
    /// General/debug information
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_str: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunnerStatus {
    /// Runner answered and reported itself healthy
    pub fn is_healthy(&self) -> bool {
        !self.status_failed
    }
}

/// One network-addressable execution worker
///
/// Runners are owned by a pool; placers only borrow them for the duration of
/// one placement and never close them.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Offer the call to this runner
    async fn try_exec(
        &self,
        ctx: &CallContext,
        call: &dyn RunnerCall,
    ) -> Result<TryOutcome, RunnerError>;

    /// Query runner health
    async fn status(&self, ctx: &CallContext) -> Result<RunnerStatus, RunnerError>;

    /// Stop admitting work, drain in-flight attempts and release the transport.
    /// Idempotent.
    async fn close(&self, ctx: &CallContext) -> Result<(), RunnerError>;

    /// Stable identity used for pool bookkeeping and logging
    fn address(&self) -> &str;
}
