//! Retention for the persistent store
//!
//! Both policies delete from the primary table and the owner index in one
//! write transaction, so a crash never leaves half a cleanup behind.

use redb::ReadableTable;
use tracing::{info, instrument, warn};

use tessera_core::{StorageError, days_ago};

use super::store::{RedbLogStore, decode};
use super::tables::{
    OWNER_INDEX, RECORDS, db_err, owner_from_index_key, owner_key, owner_prefix,
    owner_prefix_end, record_key,
};

/// `(index key, record key)` of a record scheduled for deletion
///
/// The index key is missing when the record could not be decoded.
type Doomed = (Option<Vec<u8>>, Vec<u8>);

impl RedbLogStore {
    /// Delete records older than `days`, optionally for one owner only
    ///
    /// Returns the number of records deleted.
    #[instrument(skip(self))]
    pub fn cleanup_by_age(&self, days: u32, owner_id: Option<&str>) -> Result<usize, StorageError> {
        let cutoff = days_ago(days);
        let cutoff_key = record_key(cutoff.timestamp_micros(), 0);

        let write_txn = self.db().begin_write().map_err(db_err)?;
        let deleted = {
            let mut records = write_txn.open_table(RECORDS).map_err(db_err)?;
            let mut index = write_txn.open_table(OWNER_INDEX).map_err(db_err)?;

            let mut doomed: Vec<Doomed> = Vec::new();
            match owner_id {
                Some(owner) => {
                    let prefix = owner_prefix(owner)?;
                    let end = [prefix.as_slice(), cutoff_key.as_slice()].concat();
                    for entry in index.range(prefix.as_slice()..end.as_slice()).map_err(db_err)? {
                        let (key, value) = entry.map_err(db_err)?;
                        doomed.push((Some(key.value().to_vec()), value.value().to_vec()));
                    }
                }
                None => {
                    for entry in records.range(..cutoff_key.as_slice()).map_err(db_err)? {
                        let (key, value) = entry.map_err(db_err)?;
                        let key = key.value().to_vec();
                        let index_key = match decode(value.value()) {
                            Ok(record) => Some(owner_key(&record.owner_id, &key)?),
                            Err(e) => {
                                warn!(error = %e, "Deleting undecodable record");
                                None
                            }
                        };
                        doomed.push((index_key, key));
                    }
                }
            }

            remove_all(&mut records, &mut index, &doomed)?
        };
        write_txn.commit().map_err(db_err)?;

        info!(deleted, days, "Cleaned up records by age");
        Ok(deleted)
    }

    /// Keep only the newest `max_per_owner` records of each owner
    ///
    /// With `owner_id` set only that owner is trimmed. Returns the number of
    /// records deleted.
    #[instrument(skip(self))]
    pub fn cleanup_by_count(
        &self,
        max_per_owner: usize,
        owner_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let write_txn = self.db().begin_write().map_err(db_err)?;
        let deleted = {
            let mut records = write_txn.open_table(RECORDS).map_err(db_err)?;
            let mut index = write_txn.open_table(OWNER_INDEX).map_err(db_err)?;

            // Index entries come grouped by owner, oldest first within a group.
            let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            match owner_id {
                Some(owner) => {
                    let prefix = owner_prefix(owner)?;
                    let end = owner_prefix_end(&prefix);
                    for entry in index.range(prefix.as_slice()..end.as_slice()).map_err(db_err)? {
                        let (key, value) = entry.map_err(db_err)?;
                        entries.push((key.value().to_vec(), value.value().to_vec()));
                    }
                }
                None => {
                    for entry in index.iter().map_err(db_err)? {
                        let (key, value) = entry.map_err(db_err)?;
                        entries.push((key.value().to_vec(), value.value().to_vec()));
                    }
                }
            }

            let doomed: Vec<Doomed> = entries
                .chunk_by(|a, b| owner_from_index_key(&a.0) == owner_from_index_key(&b.0))
                .flat_map(|group| {
                    let excess = group.len().saturating_sub(max_per_owner);
                    group[..excess]
                        .iter()
                        .map(|(index_key, key)| (Some(index_key.clone()), key.clone()))
                })
                .collect();

            remove_all(&mut records, &mut index, &doomed)?
        };
        write_txn.commit().map_err(db_err)?;

        info!(deleted, max_per_owner, "Cleaned up records by count");
        Ok(deleted)
    }
}

fn remove_all(
    records: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    index: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    doomed: &[Doomed],
) -> Result<usize, StorageError> {
    for (index_key, key) in doomed {
        if let Some(index_key) = index_key {
            index.remove(index_key.as_slice()).map_err(db_err)?;
        }
        records.remove(key.as_slice()).map_err(db_err)?;
    }
    Ok(doomed.len())
}
