//! Collaborator traits
//!
//! The ingestion pipeline is agnostic to where records end up. The hosting
//! application supplies a [`RecordSink`] that writes one record durably.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::StorageError;
use crate::record::StorageRecord;

/// Durable destination for log records
///
/// Implementations must be safe to call from the background worker thread.
/// A returned error is classified by [`StorageError::is_retryable`].
pub trait RecordSink: Send + Sync {
    /// Write a single record
    fn write(&self, record: &StorageRecord) -> Result<(), StorageError>;

    /// Write several records
    ///
    /// The default writes them one by one and stops at the first failure;
    /// transactional stores override this to commit the batch atomically.
    fn write_batch(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        for record in records {
            self.write(record)?;
        }
        Ok(())
    }
}

impl<T: RecordSink + ?Sized> RecordSink for Arc<T> {
    fn write(&self, record: &StorageRecord) -> Result<(), StorageError> {
        (**self).write(record)
    }

    fn write_batch(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        (**self).write_batch(records)
    }
}

/// Write through a host-supplied sink, turning a panic into an error
///
/// A panicking sink is reported as [`StorageError::Unavailable`], so it is
/// retried and counts against the circuit breaker like any other outage.
pub fn write_guarded(sink: &dyn RecordSink, record: &StorageRecord) -> Result<(), StorageError> {
    catch_unwind(AssertUnwindSafe(|| sink.write(record))).unwrap_or_else(|payload| {
        Err(StorageError::unavailable(format!(
            "sink panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

/// Adapts a closure into a [`RecordSink`]
///
/// ```ignore
/// let sink = FnSink::new(|record: &StorageRecord| {
///     warehouse.insert(record).map_err(|e| StorageError::transient(e.to_string()))
/// });
/// ```
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(&StorageRecord) -> Result<(), StorageError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> RecordSink for FnSink<F>
where
    F: Fn(&StorageRecord) -> Result<(), StorageError> + Send + Sync,
{
    fn write(&self, record: &StorageRecord) -> Result<(), StorageError> {
        (self.f)(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LogLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// The trait must stay object-safe: the pipeline holds `Arc<dyn RecordSink>`
    fn _assert_object_safe(_: &dyn RecordSink) {}

    #[test]
    fn test_default_batch_stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sink = FnSink::new(move |record: &StorageRecord| {
            counter.fetch_add(1, Ordering::SeqCst);
            if record.message == "bad" {
                Err(StorageError::transient("rejected"))
            } else {
                Ok(())
            }
        });

        let batch = vec![
            StorageRecord::new("o", LogLevel::Info, "ok"),
            StorageRecord::new("o", LogLevel::Info, "bad"),
            StorageRecord::new("o", LogLevel::Info, "never"),
        ];
        assert!(sink.write_batch(&batch).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_arc_dyn_sink() {
        let sink: Arc<dyn RecordSink> = Arc::new(FnSink::new(|_: &StorageRecord| Ok(())));
        assert!(sink.write(&StorageRecord::new("o", LogLevel::Info, "m")).is_ok());
    }

    #[test]
    fn test_guarded_write_contains_panics() {
        let sink = FnSink::new(|record: &StorageRecord| {
            if record.message == "boom" {
                panic!("sink exploded on {}", record.message);
            }
            Ok(())
        });

        assert!(write_guarded(&sink, &StorageRecord::new("o", LogLevel::Info, "fine")).is_ok());
        let err = write_guarded(&sink, &StorageRecord::new("o", LogLevel::Info, "boom")).unwrap_err();
        assert_eq!(err, StorageError::unavailable("sink panicked: sink exploded on boom"));
        assert!(err.is_retryable());
    }
}
