//! redb-backed log store
//!
//! Durable, queryable home for [`StorageRecord`]s. Writes through this type
//! are not fault-tolerant on their own: a batch is one transaction that
//! either commits entirely or not at all. Wrap the store in a
//! [`ResilientWriter`](crate::resilience::ResilientWriter) for retry and
//! circuit breaking.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata};
use tracing::{debug, info, instrument};

use tessera_core::{QueryFilter, RecordSink, SortOrder, StorageError, StorageRecord};

use super::tables::{
    META, NEXT_SEQUENCE, OWNER_INDEX, RECORDS, db_err, owner_key, owner_prefix,
    owner_prefix_end, record_key,
};

/// Raw `(key, value)` pairs pulled out of a range scan
type RawEntry = Result<(Vec<u8>, Vec<u8>), redb::StorageError>;

/// Configuration for the redb log store
#[derive(Debug, Clone)]
pub struct RedbLogStoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
}

impl Default for RedbLogStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/tessera-logs.redb"),
        }
    }
}

impl RedbLogStoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

/// Persistent log store
#[derive(Clone)]
pub struct RedbLogStore {
    db: Arc<Database>,
    config: RedbLogStoreConfig,
}

impl RedbLogStore {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbLogStoreConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&config.db_path).map_err(db_err)?;
        info!("Opened log database");

        let store = Self {
            db: Arc::new(db),
            config,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create tables if they don't exist
    ///
    /// Safe to call any number of times.
    pub fn initialize(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        write_txn.open_table(RECORDS).map_err(db_err)?;
        write_txn.open_table(OWNER_INDEX).map_err(db_err)?;
        write_txn.open_table(META).map_err(db_err)?;
        write_txn.commit().map_err(db_err)?;

        debug!("Initialized log tables");
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &RedbLogStoreConfig {
        &self.config
    }

    /// Store one record
    pub fn store(&self, record: &StorageRecord) -> Result<(), StorageError> {
        self.store_batch(std::slice::from_ref(record)).map(|_| ())
    }

    /// Store records in a single transaction
    ///
    /// Records keep their slice order among entries with equal timestamps.
    pub fn store_batch(&self, records: &[StorageRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut meta = write_txn.open_table(META).map_err(db_err)?;
            let mut table = write_txn.open_table(RECORDS).map_err(db_err)?;
            let mut index = write_txn.open_table(OWNER_INDEX).map_err(db_err)?;

            let mut sequence = meta
                .get(NEXT_SEQUENCE)
                .map_err(db_err)?
                .map(|v| v.value())
                .unwrap_or(0);

            for record in records {
                let key = record_key(record.timestamp_micros(), sequence);
                sequence += 1;

                let value = postcard::to_allocvec(record)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(db_err)?;

                let index_key = owner_key(&record.owner_id, &key)?;
                index
                    .insert(index_key.as_slice(), key.as_slice())
                    .map_err(db_err)?;
            }

            meta.insert(NEXT_SEQUENCE, sequence).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        debug!(count = records.len(), "Stored log records");
        Ok(records.len())
    }

    /// Query records matching a filter
    ///
    /// An owner filter is served from the owner index; everything else scans
    /// the primary table within the filter's time window.
    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<StorageRecord>, StorageError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let records = read_txn.open_table(RECORDS).map_err(db_err)?;

        let lower = filter.start_time.map(|t| record_key(t.timestamp_micros(), 0));
        let upper = filter.end_time.map(|t| record_key(t.timestamp_micros(), 0));
        let newest_first = filter.order == SortOrder::NewestFirst;
        if let (Some(lower), Some(upper)) = (&lower, &upper) {
            if lower >= upper {
                return Ok(Vec::new());
            }
        }

        if let Some(owner) = &filter.owner_id {
            let index = read_txn.open_table(OWNER_INDEX).map_err(db_err)?;
            let prefix = owner_prefix(owner)?;
            let start = match &lower {
                Some(key) => [prefix.as_slice(), key.as_slice()].concat(),
                None => prefix.clone(),
            };
            let end = match &upper {
                Some(key) => [prefix.as_slice(), key.as_slice()].concat(),
                None => owner_prefix_end(&prefix),
            };

            let range = index
                .range(start.as_slice()..end.as_slice())
                .map_err(db_err)?;
            let resolve = |key: &[u8]| -> Result<Option<StorageRecord>, StorageError> {
                match records.get(key).map_err(db_err)? {
                    Some(value) => decode(value.value()).map(Some),
                    None => Ok(None),
                }
            };

            if newest_first {
                collect_page(range.rev().map(to_owned_entry), filter, resolve)
            } else {
                collect_page(range.map(to_owned_entry), filter, resolve)
            }
        } else {
            let bounds = (
                lower
                    .as_ref()
                    .map_or(Bound::Unbounded, |k| Bound::Included(k.as_slice())),
                upper
                    .as_ref()
                    .map_or(Bound::Unbounded, |k| Bound::Excluded(k.as_slice())),
            );
            let range = records.range::<&[u8]>(bounds).map_err(db_err)?;
            let resolve = |value: &[u8]| decode(value).map(Some);

            if newest_first {
                collect_page(range.rev().map(to_owned_entry), filter, resolve)
            } else {
                collect_page(range.map(to_owned_entry), filter, resolve)
            }
        }
    }

    /// Newest records of one owner
    pub fn by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<StorageRecord>, StorageError> {
        self.query(&QueryFilter::new().owner(owner_id).limit(limit))
    }

    /// Records sharing a correlation id, in emission order
    pub fn by_correlation_id(
        &self,
        correlation_id: &str,
        limit: usize,
    ) -> Result<Vec<StorageRecord>, StorageError> {
        self.query(
            &QueryFilter::new()
                .correlation(correlation_id)
                .limit(limit)
                .chronological(),
        )
    }

    /// Records from the trailing number of hours, newest first
    pub fn recent(&self, hours: u32, limit: usize) -> Result<Vec<StorageRecord>, StorageError> {
        self.query(&QueryFilter::new().last_hours(hours).limit(limit))
    }

    /// Case-insensitive message search
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<StorageRecord>, StorageError> {
        self.query(&QueryFilter::new().message_contains(text).limit(limit))
    }

    /// Every record of one execution, in emission order
    pub fn timeline(&self, execution_id: &str) -> Result<Vec<StorageRecord>, StorageError> {
        self.query(
            &QueryFilter::new()
                .execution(execution_id)
                .limit(tessera_core::MAX_LIMIT)
                .chronological(),
        )
    }

    /// Total number of stored records
    pub fn count(&self) -> Result<u64, StorageError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(RECORDS).map_err(db_err)?;
        table.len().map_err(db_err)
    }
}

impl RecordSink for RedbLogStore {
    fn write(&self, record: &StorageRecord) -> Result<(), StorageError> {
        self.store(record)
    }

    fn write_batch(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        self.store_batch(records).map(|_| ())
    }
}

impl std::fmt::Debug for RedbLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLogStore")
            .field("db_path", &self.config.db_path)
            .finish()
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Result<StorageRecord, StorageError> {
    postcard::from_bytes(bytes).map_err(|e| StorageError::Corrupted(e.to_string()))
}

fn to_owned_entry(
    entry: Result<
        (
            redb::AccessGuard<'_, &'static [u8]>,
            redb::AccessGuard<'_, &'static [u8]>,
        ),
        redb::StorageError,
    >,
) -> RawEntry {
    entry.map(|(k, v)| (k.value().to_vec(), v.value().to_vec()))
}

/// Apply the filter, offset and limit to a stream of raw entries
///
/// `resolve` turns an entry value into a record; `None` skips the entry.
fn collect_page<I, F>(
    entries: I,
    filter: &QueryFilter,
    mut resolve: F,
) -> Result<Vec<StorageRecord>, StorageError>
where
    I: Iterator<Item = RawEntry>,
    F: FnMut(&[u8]) -> Result<Option<StorageRecord>, StorageError>,
{
    let limit = filter.page_limit();
    let mut skipped = 0;
    let mut page = Vec::new();

    for entry in entries {
        let (_key, value) = entry.map_err(db_err)?;
        let Some(record) = resolve(&value)? else {
            continue;
        };
        if !filter.matches(&record) {
            continue;
        }
        if skipped < filter.page_offset() {
            skipped += 1;
            continue;
        }
        page.push(record);
        if page.len() >= limit {
            break;
        }
    }

    Ok(page)
}
