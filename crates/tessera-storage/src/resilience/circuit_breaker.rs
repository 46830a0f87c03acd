//! Three-state circuit breaker
//!
//! ```text
//!  CLOSED ──failure_threshold failures──▶ OPEN
//!    ▲                                     │
//!    │                           recovery_timeout elapsed,
//!  success_threshold                   next call
//!  successes                               │
//!    │                                     ▼
//!    └──────────── HALF_OPEN ◀─────────────┘
//!                     │
//!                  any failure ──▶ OPEN
//! ```
//!
//! All state lives behind one mutex. Timing uses `tokio::time::Instant` so
//! paused-clock tests can drive the recovery timeout.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::ResilienceError;

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time after the last failure before a probe is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Consistent snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Calls rejected while open, since creation
    pub rejected_calls: u64,
    /// Time until a probe is allowed, when open
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    rejected_calls: u64,
}

impl Inner {
    fn remaining(&self, timeout: Duration) -> Duration {
        self.last_failure
            .map(|at| timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Fail-fast guard around a flaky dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                rejected_calls: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission for one call
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and admits the call.
    pub fn acquire(&self) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock();
        if let CircuitState::Open = inner.state {
            let retry_after = inner.remaining(self.config.recovery_timeout);
            if retry_after.is_zero() {
                inner.state = CircuitState::HalfOpen { successes: 0 };
                info!("Circuit half-open, probing");
            } else {
                inner.rejected_calls += 1;
                return Err(ResilienceError::CircuitOpen { retry_after });
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.last_failure = None;
                    info!("Circuit closed");
                } else {
                    inner.state = CircuitState::HalfOpen { successes };
                }
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                inner.state = CircuitState::Open;
                warn!("Probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitStateKind {
        self.status().state
    }

    /// Snapshot taken under the breaker lock
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        let (state, half_open_successes, retry_after) = match inner.state {
            CircuitState::Closed => (CircuitStateKind::Closed, 0, None),
            CircuitState::Open => (
                CircuitStateKind::Open,
                0,
                Some(inner.remaining(self.config.recovery_timeout)),
            ),
            CircuitState::HalfOpen { successes } => (CircuitStateKind::HalfOpen, successes, None),
        };
        CircuitBreakerStatus {
            state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes,
            rejected_calls: inner.rejected_calls,
            retry_after,
        }
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
