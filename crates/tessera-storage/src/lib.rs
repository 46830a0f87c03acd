//! # Tessera Storage
//!
//! Durable destinations for Tessera log records.
//!
//! ## Features
//!
//! - **RedbLogStore**: Queryable redb store with retention and statistics,
//!   usable directly as the primary [`RecordSink`](tessera_core::RecordSink)
//! - **FallbackStore**: Rotating JSONL files for records the primary could
//!   not accept, with recovery back into the primary
//! - **ResilientWriter**: Circuit breaker around bounded retry around a sink
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_core::{LogLevel, QueryFilter, StorageRecord};
//! use tessera_storage::{
//!     CircuitBreakerConfig, RedbLogStore, RedbLogStoreConfig, ResilientWriter, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(RedbLogStore::open(RedbLogStoreConfig::default()).unwrap());
//!     let writer = ResilientWriter::new(
//!         store.clone(),
//!         RetryPolicy::default(),
//!         CircuitBreakerConfig::default(),
//!     );
//!
//!     writer
//!         .write(&StorageRecord::new("pipeline-1", LogLevel::Info, "started"))
//!         .await
//!         .unwrap();
//!
//!     let records = store.query(&QueryFilter::new().owner("pipeline-1")).unwrap();
//!     assert_eq!(records.len(), 1);
//! }
//! ```

pub mod fallback;
pub mod persistent;
pub mod resilience;

// Re-exports
pub use fallback::{FallbackConfig, FallbackEntry, FallbackStore, RecoveryReport};
pub use persistent::{LogStatistics, RedbLogStore, RedbLogStoreConfig};
pub use resilience::{
    BatchOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitStateKind,
    ResilienceError, ResilientWriter, RetryOutcome, RetryPolicy,
};

// Re-export the error type from tessera-core for convenience
pub use tessera_core::StorageError;
