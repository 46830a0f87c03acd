//! Retry and circuit breaking for primary writes
//!
//! [`ResilientWriter`] composes a [`CircuitBreaker`] around a [`RetryPolicy`]
//! around any [`RecordSink`](tessera_core::RecordSink).

mod circuit_breaker;
mod coordinator;
mod error;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitStateKind,
};
pub use coordinator::{BatchOutcome, ResilientWriter};
pub use error::ResilienceError;
pub use retry::{RetryOutcome, RetryPolicy};
