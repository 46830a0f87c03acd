//! Persistent log storage using redb
//!
//! - [`RedbLogStore`]: records plus an owner index, queried with
//!   [`QueryFilter`](tessera_core::QueryFilter)
//! - Retention by age or per-owner count
//! - [`LogStatistics`] over a trailing window

mod retention;
mod stats;
mod store;
pub mod tables;

pub use stats::LogStatistics;
pub use store::{RedbLogStore, RedbLogStoreConfig};
