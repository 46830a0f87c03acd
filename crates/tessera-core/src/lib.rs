//! # Tessera Core
//!
//! Core record types, query filters, and errors shared by the Tessera
//! ingestion pipeline and its storage backends.
//!
//! ## Key Types
//!
//! - [`LogEvent`]: Raw event captured at the call site
//! - [`ExecutionContext`]: Scope-bound identity of a pipeline run or request
//! - [`EnrichedRecord`]: Event merged with its context, level normalized
//! - [`StorageRecord`]: Persistence-ready record
//! - [`QueryFilter`]: Conjunctive predicates plus pagination
//!
//! ## Key Traits
//!
//! - [`RecordSink`]: "Write one record durably", supplied by the host

pub mod diagnostic;
pub mod error;
pub mod filter;
pub mod level;
pub mod record;
pub mod traits;

pub use error::{FilterError, StorageError};
pub use filter::{DEFAULT_LIMIT, MAX_LIMIT, QueryFilter, SortOrder, days_ago, hours_ago};
pub use level::LogLevel;
pub use record::{
    EnrichedRecord, ExecutionContext, FieldValue, LogEvent, SERIALIZATION_ERRORS_KEY, StorageRecord,
    new_correlation_id,
};
pub use traits::{FnSink, RecordSink, write_guarded};
