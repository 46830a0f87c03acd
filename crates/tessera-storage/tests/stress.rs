//! Stress tests for tessera-storage
//!
//! These tests verify storage behavior under high load, concurrent access,
//! and retention at realistic sizes.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tessera_core::{LogLevel, QueryFilter, StorageRecord};
use tessera_storage::{
    CircuitBreakerConfig, FallbackConfig, FallbackStore, RedbLogStore, RedbLogStoreConfig,
    ResilientWriter, RetryPolicy,
};

fn open_store() -> (Arc<RedbLogStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = RedbLogStoreConfig::new(temp_dir.path().join("stress.redb"));
    (Arc::new(RedbLogStore::open(config).unwrap()), temp_dir)
}

// ============================================================================
// Throughput Tests
// ============================================================================

/// N records through the resilient writer come back exactly once by owner
#[tokio::test]
async fn test_resilient_writes_no_loss_no_duplicates() {
    let (store, _temp) = open_store();
    let writer = ResilientWriter::new(
        store.clone(),
        RetryPolicy::default(),
        CircuitBreakerConfig::default(),
    );
    let record_count = 500;

    let start = Instant::now();
    let records: Vec<_> = (0..record_count)
        .map(|i| StorageRecord::new("pipeline-a", LogLevel::Info, format!("step {i}")))
        .collect();
    let outcome = writer.write_batch(&records).await;
    let duration = start.elapsed();
    println!(
        "Wrote {} records in {:?} ({:.2} records/sec)",
        record_count,
        duration,
        record_count as f64 / duration.as_secs_f64()
    );

    assert!(outcome.is_complete());
    assert_eq!(outcome.written, record_count);

    let stored = store
        .query(&QueryFilter::new().owner("pipeline-a").limit(10_000))
        .unwrap();
    assert_eq!(stored.len(), record_count);
    let ids: HashSet<_> = stored.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), record_count);
}

/// Large transactional batches keep their order
#[test]
fn test_batch_throughput_preserves_order() {
    let (store, _temp) = open_store();
    let ts = Utc::now();
    let batch: Vec<_> = (0..5_000)
        .map(|i| {
            StorageRecord::new("pipeline-b", LogLevel::Debug, format!("{i}"))
                .with_timestamp(ts)
                .with_execution_id("exec-b")
        })
        .collect();

    let start = Instant::now();
    for chunk in batch.chunks(500) {
        store.store_batch(chunk).unwrap();
    }
    println!("Stored 5000 records in {:?}", start.elapsed());

    // Same timestamp everywhere, so order comes from the sequence alone
    let timeline = store.timeline("exec-b").unwrap();
    assert_eq!(timeline.len(), 5_000);
    for (i, record) in timeline.iter().enumerate() {
        assert_eq!(record.message, i.to_string());
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

/// Concurrent writers from several threads
#[test]
fn test_concurrent_store_writers() {
    let (store, _temp) = open_store();
    let per_thread = 100;

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let record =
                        StorageRecord::new(format!("owner-{t}"), LogLevel::Info, format!("{i}"));
                    store.store(&record).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count().unwrap(), 8 * per_thread as u64);
    for t in 0..8 {
        let owned = store.by_owner(&format!("owner-{t}"), 1_000).unwrap();
        assert_eq!(owned.len(), per_thread);
    }
}

/// Concurrent fallback appends never interleave lines
#[test]
fn test_concurrent_fallback_appends() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(
        FallbackStore::new(FallbackConfig::new(temp_dir.path()).with_max_file_bytes(16 * 1024))
            .unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..200 {
                    let record =
                        StorageRecord::new("p", LogLevel::Error, format!("thread {t} record {i}"));
                    assert!(store.store(&record));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let records = store.list().unwrap();
    assert_eq!(records.len(), 800);
    assert!(store.file_count() > 1);
}

// ============================================================================
// Retention Tests
// ============================================================================

/// Retention by age deletes exactly the records past the cutoff
#[test]
fn test_cleanup_by_age_boundary() {
    let (store, _temp) = open_store();
    let now = Utc::now();
    let batch: Vec<_> = (0..60)
        .map(|day| {
            StorageRecord::new("p", LogLevel::Info, format!("day {day}"))
                .with_timestamp(now - Duration::days(day) - Duration::minutes(1))
        })
        .collect();
    store.store_batch(&batch).unwrap();

    // Days 30..59 are older than the cutoff
    let deleted = store.cleanup_by_age(30, None).unwrap();
    assert_eq!(deleted, 30);

    let cutoff = Utc::now() - Duration::days(30);
    let remaining = store.query(&QueryFilter::new().limit(1_000)).unwrap();
    assert_eq!(remaining.len(), 30);
    assert!(remaining.iter().all(|r| r.timestamp >= cutoff));
}

/// Retention by count leaves min(limit, existing) newest per owner
#[test]
fn test_cleanup_by_count_many_owners() {
    let (store, _temp) = open_store();
    let base = Utc::now() - Duration::hours(1);
    let sizes = [("big", 250), ("medium", 100), ("small", 40)];
    for (owner, size) in sizes {
        let batch: Vec<_> = (0..size)
            .map(|i| {
                StorageRecord::new(owner, LogLevel::Info, format!("{i}"))
                    .with_timestamp(base + Duration::seconds(i))
            })
            .collect();
        store.store_batch(&batch).unwrap();
    }

    let deleted = store.cleanup_by_count(100, None).unwrap();
    assert_eq!(deleted, 150);

    for (owner, size) in sizes {
        let kept = store.by_owner(owner, 1_000).unwrap();
        assert_eq!(kept.len(), size.min(100) as usize);
        // Newest first, and the newest survived
        assert_eq!(kept[0].message, (size - 1).to_string());
    }
}
