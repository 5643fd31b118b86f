//! Circuit breaker for runner health

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Failure threshold exceeded - runner is demoted
    Open,

    /// Testing if the runner recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲          failure          │
///      │                               └───────────────────────────┤
///      │              success threshold                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use switchyard_placement::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window required to open the circuit
    pub failure_threshold: u32,

    /// Number of successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            window_size: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// In-process circuit breaker for one runner
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open to HalfOpen once the reset timeout elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// False while the circuit is open
    pub fn allows_requests(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Failures currently counted in the sliding window
    pub fn failure_count(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.prune(&mut inner, now);
        inner.failures.len()
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                self.prune(&mut inner, now);
                inner.failures.push_back(now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    Self::open(&mut inner, now);
                }
            }
            CircuitState::Open | CircuitState::HalfOpen => Self::open(&mut inner, now),
        }
    }

    fn open(inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.half_open_successes = 0;
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) > self.config.window_size {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
