//! Circuit breaker around retry around a record sink

use std::sync::Arc;

use tracing::{debug, instrument};

use tessera_core::{RecordSink, StorageRecord, write_guarded};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use super::error::ResilienceError;
use super::retry::RetryPolicy;

/// Records a batch write could not deliver
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: usize,
    pub failed: Vec<(StorageRecord, ResilienceError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fault-tolerant writer over a [`RecordSink`]
///
/// Each record goes through the breaker, then the retry policy. One
/// exhausted retry sequence counts as a single breaker failure.
/// Non-retryable errors are returned without touching the breaker: they
/// describe the record, not the health of the sink.
pub struct ResilientWriter {
    sink: Arc<dyn RecordSink>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientWriter {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            sink,
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    /// The unprotected sink, used by fallback recovery
    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        self.breaker.status()
    }

    /// Write one record
    pub async fn write(&self, record: &StorageRecord) -> Result<(), ResilienceError> {
        self.breaker.acquire()?;

        let outcome = self.retry.execute(|| write_guarded(self.sink.as_ref(), record)).await;
        match &outcome.result {
            Ok(()) => self.breaker.record_success(),
            Err(ResilienceError::RetryExhausted { .. }) => self.breaker.record_failure(),
            Err(_) => {}
        }
        if let Err(e) = &outcome.result {
            debug!(record_id = %record.id, attempts = outcome.attempts, error = %e, "Protected write failed");
        }
        outcome.result
    }

    /// Write records independently
    ///
    /// Partial success is expected; failures come back in input order.
    #[instrument(skip_all, fields(count = records.len()))]
    pub async fn write_batch(&self, records: &[StorageRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in records {
            match self.write(record).await {
                Ok(()) => outcome.written += 1,
                Err(e) => outcome.failed.push((record.clone(), e)),
            }
        }
        outcome
    }
}

impl std::fmt::Debug for ResilientWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientWriter")
            .field("retry", &self.retry)
            .field("breaker", &self.breaker.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitStateKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tessera_core::{FnSink, LogLevel, StorageError};

    fn writer(sink: Arc<dyn RecordSink>) -> ResilientWriter {
        ResilientWriter::new(
            sink,
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_delays(Duration::from_millis(1), Duration::from_millis(1))
                .with_jitter(false),
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        )
    }

    fn record(message: &str) -> StorageRecord {
        StorageRecord::new("p1", LogLevel::Info, message)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_sequence_counts_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let w = writer(Arc::new(FnSink::new(move |_: &StorageRecord| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::transient("busy"))
        })));

        assert!(matches!(
            w.write(&record("a")).await,
            Err(ResilienceError::RetryExhausted { attempts: 2, .. })
        ));
        assert_eq!(w.status().consecutive_failures, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        w.write(&record("b")).await.unwrap_err();
        assert_eq!(w.status().state, CircuitStateKind::Open);

        // Rejected without calling the sink
        let err = w.write(&record("c")).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_does_not_trip_breaker() {
        let w = writer(Arc::new(FnSink::new(|_: &StorageRecord| {
            Err(StorageError::serialization("bad"))
        })));
        for _ in 0..5 {
            assert!(matches!(
                w.write(&record("x")).await,
                Err(ResilienceError::Rejected(_))
            ));
        }
        assert_eq!(w.status().state, CircuitStateKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sink_counts_as_failure() {
        let w = writer(Arc::new(FnSink::new(|r: &StorageRecord| {
            if r.message == "3" {
                panic!("host sink bug");
            }
            Ok(())
        })));

        let outcome = w
            .write_batch(&[record("1"), record("2"), record("3"), record("4")])
            .await;
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.message, "3");
        assert!(matches!(
            outcome.failed[0].1,
            ResilienceError::RetryExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_partial_success() {
        let w = writer(Arc::new(FnSink::new(|r: &StorageRecord| {
            if r.message == "bad" {
                Err(StorageError::unavailable("nope"))
            } else {
                Ok(())
            }
        })));

        let outcome = w
            .write_batch(&[record("ok1"), record("bad"), record("ok2")])
            .await;
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.message, "bad");
        assert!(!outcome.is_complete());
        // The success after the failure reset the closed counter
        assert_eq!(w.status().consecutive_failures, 0);
    }
}
