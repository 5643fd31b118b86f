//! # Switchyard Placement
//!
//! Places function calls onto a changing pool of remote runners.
//!
//! ## Features
//!
//! - **Ordered failover**: candidates are tried strictly in pool order until one accepts
//! - **At-most-one dispatch**: a call that a runner accepted is never offered elsewhere
//! - **Consistent hashing**: calls with the same routing key prefer the same runners
//! - **Live membership**: runners join and leave without blocking placements
//! - **Circuit breakers**: failing runners are demoted behind healthy ones
//! - **Explicit cancellation**: every blocking step honours a [`CallContext`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        OrderedPlacer                         │
//! │  (walks candidates, stops at first acceptance)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ runners(call)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           RunnerPool (static / consistent-hash)              │
//! │  (owns runner lifecycles, orders candidates per call)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ try_exec / status / close
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  GrpcRunner (mutual TLS)                     │
//! │  (Engage stream: offer, ack, body, result, diagnostics)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use switchyard_placement::prelude::*;
//!
//! let pki = PkiData::from_files("ca.pem", "lb.pem", "lb-key.pem").await?;
//! let factory = MtlsRunnerFactory::new("runner.internal", pki);
//! let pool = StaticRunnerPool::from_addresses(&addresses, &factory).await;
//!
//! let call = InvocationCall::new(CallModel::new("app", "fn", "registry/fn:1"))
//!     .with_body(b"{}".to_vec());
//! let ctx = CallContext::with_timeout_from_now(Duration::from_secs(30));
//!
//! let placement = OrderedPlacer::default().place_call(&pool, &ctx, &call).await?;
//! println!("placed on {} after {} attempts", placement.runner, placement.attempts);
//! ```

pub mod call;
pub mod context;
pub mod placer;
pub mod pool;
pub mod reliability;
pub mod runner;

/// Prelude for common imports
pub mod prelude {
    pub use crate::call::{
        BufferedDiagnostics, BufferedResponse, CallModel, CallType, DiagnosticStream,
        InvocationCall, ResponseWriter, RunnerCall,
    };
    pub use crate::context::{CallContext, ContextError};
    pub use crate::placer::{OrderedPlacer, Placement, PlacementError, Placer, PlacerConfig};
    pub use crate::pool::{
        AttemptOutcome, ConsistentHashPool, HashPoolConfig, PoolError, RunnerPool,
        StaticRunnerPool,
    };
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::runner::{
        CallCompletion, FactoryError, InsecureRunnerFactory, MtlsRunnerFactory, PkiData, Runner,
        RunnerError, RunnerFactory, RunnerStatus, TryOutcome,
    };
}

// Re-export key types at crate root
pub use call::{CallModel, InvocationCall, RunnerCall};
pub use context::{CallContext, ContextError};
pub use placer::{OrderedPlacer, Placement, PlacementError, Placer, PlacerConfig};
pub use pool::{
    AttemptOutcome, ConsistentHashPool, HashPoolConfig, PoolError, RunnerHealth, RunnerPool,
    StaticRunnerPool,
};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use runner::{
    build_mtls_runner, CallCompletion, FactoryError, GrpcRunner, InsecureRunnerFactory,
    MtlsRunnerFactory, PkiData, Runner, RunnerError, RunnerFactory, RunnerStatus, TryOutcome,
};
