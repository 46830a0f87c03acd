//! Aggregate statistics over stored records

use std::collections::BTreeMap;

use redb::ReadableTableMetadata;
use serde::{Deserialize, Serialize};

use tessera_core::{LogLevel, StorageError, StorageRecord, hours_ago};

use super::store::{RedbLogStore, decode};
use super::tables::{OWNER_INDEX, RECORDS, db_err, owner_prefix, owner_prefix_end, record_key};

/// Record counts for the whole store and for a trailing window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStatistics {
    /// All records in scope, regardless of age
    pub total: u64,
    /// Width of the trailing window
    pub window_hours: u32,
    /// Records inside the window
    pub window_total: u64,
    /// Window records per level
    pub by_level: BTreeMap<LogLevel, u64>,
    /// Window records per owner
    pub by_owner: BTreeMap<String, u64>,
}

impl LogStatistics {
    fn tally(&mut self, record: &StorageRecord) {
        self.window_total += 1;
        *self.by_level.entry(record.level).or_default() += 1;
        *self.by_owner.entry(record.owner_id.clone()).or_default() += 1;
    }

    /// Share of window records at `ERROR` or above
    pub fn error_rate(&self) -> f64 {
        if self.window_total == 0 {
            return 0.0;
        }
        let errors: u64 = self
            .by_level
            .iter()
            .filter(|(level, _)| **level >= LogLevel::Error)
            .map(|(_, count)| count)
            .sum();
        errors as f64 / self.window_total as f64
    }
}

impl RedbLogStore {
    /// Counts over the trailing `hours`, optionally for one owner
    pub fn statistics(
        &self,
        owner_id: Option<&str>,
        hours: u32,
    ) -> Result<LogStatistics, StorageError> {
        let window_start = hours_ago(hours);
        let window_key = record_key(window_start.timestamp_micros(), 0);

        let read_txn = self.db().begin_read().map_err(db_err)?;
        let records = read_txn.open_table(RECORDS).map_err(db_err)?;

        let mut stats = LogStatistics {
            window_hours: hours,
            ..Default::default()
        };

        match owner_id {
            Some(owner) => {
                let index = read_txn.open_table(OWNER_INDEX).map_err(db_err)?;
                let prefix = owner_prefix(owner)?;
                let end = owner_prefix_end(&prefix);
                let start = [prefix.as_slice(), window_key.as_slice()].concat();

                for entry in index.range(prefix.as_slice()..end.as_slice()).map_err(db_err)? {
                    let (index_key, key) = entry.map_err(db_err)?;
                    stats.total += 1;
                    if index_key.value() < start.as_slice() {
                        continue;
                    }
                    if let Some(value) = records.get(key.value()).map_err(db_err)? {
                        stats.tally(&decode(value.value())?);
                    }
                }
            }
            None => {
                stats.total = records.len().map_err(db_err)?;
                for entry in records.range(window_key.as_slice()..).map_err(db_err)? {
                    let (_, value) = entry.map_err(db_err)?;
                    stats.tally(&decode(value.value())?);
                }
            }
        }

        Ok(stats)
    }
}
