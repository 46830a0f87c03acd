//! redb table definitions and key encoding
//!
//! Records are keyed by `(timestamp_micros, sequence)` so a forward range
//! scan is chronological and a reverse scan is newest-first. The sequence
//! breaks ties between records stamped in the same microsecond and keeps
//! them in arrival order.
//!
//! ```text
//! log_records       [ts: 8 BE, sign-flipped][seq: 8 BE]                 -> postcard StorageRecord
//! log_owner_index   [owner_len: 2 BE][owner bytes][ts: 8][seq: 8]       -> record key
//! log_meta          "next_sequence"                                     -> u64
//! ```

use redb::TableDefinition;

use tessera_core::StorageError;

// Key: record key, Value: postcard-serialized StorageRecord
pub const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("log_records");

// Key: owner prefix + record key, Value: record key
pub const OWNER_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("log_owner_index");

// Key: counter name, Value: counter
pub const META: TableDefinition<&str, u64> = TableDefinition::new("log_meta");

pub const NEXT_SEQUENCE: &str = "next_sequence";

/// Length of an encoded record key
pub const RECORD_KEY_LEN: usize = 16;

/// Encode a record key
pub fn record_key(timestamp_micros: i64, sequence: u64) -> [u8; RECORD_KEY_LEN] {
    let mut key = [0u8; RECORD_KEY_LEN];
    // Flipping the sign bit makes negative timestamps sort before positive ones.
    let ts = (timestamp_micros as u64) ^ (1 << 63);
    key[..8].copy_from_slice(&ts.to_be_bytes());
    key[8..].copy_from_slice(&sequence.to_be_bytes());
    key
}

/// Decode a record key into `(timestamp_micros, sequence)`
pub fn decode_record_key(key: &[u8]) -> Option<(i64, u64)> {
    if key.len() != RECORD_KEY_LEN {
        return None;
    }
    let ts = u64::from_be_bytes(key[..8].try_into().ok()?) ^ (1 << 63);
    let seq = u64::from_be_bytes(key[8..].try_into().ok()?);
    Some((ts as i64, seq))
}

/// Index prefix shared by every record of one owner
pub fn owner_prefix(owner_id: &str) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(owner_id.len()).map_err(|_| {
        StorageError::serialization(format!(
            "owner id of {} bytes exceeds the index limit",
            owner_id.len()
        ))
    })?;
    let mut prefix = Vec::with_capacity(2 + owner_id.len() + RECORD_KEY_LEN);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(owner_id.as_bytes());
    Ok(prefix)
}

/// Owner index key for a record
pub fn owner_key(owner_id: &str, record_key: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut key = owner_prefix(owner_id)?;
    key.extend_from_slice(record_key);
    Ok(key)
}

/// Exclusive upper bound for every index key under `prefix`
///
/// Owner keys are the prefix plus a fixed-length record key, so one extra
/// byte of `0xFF` past that length sorts after all of them.
pub fn owner_prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = Vec::with_capacity(prefix.len() + RECORD_KEY_LEN + 1);
    end.extend_from_slice(prefix);
    end.extend_from_slice(&[0xFF; RECORD_KEY_LEN + 1]);
    end
}

/// Owner id stored in an owner index key
pub fn owner_from_index_key(key: &[u8]) -> Option<&str> {
    let len = u16::from_be_bytes(key.get(..2)?.try_into().ok()?) as usize;
    std::str::from_utf8(key.get(2..2 + len)?).ok()
}

/// Map any redb error into a storage error
///
/// redb failures (lock contention, commit errors) are treated as database
/// errors and therefore retryable.
pub(crate) fn db_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Database(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_ordering() {
        let a = record_key(-5, 9);
        let b = record_key(0, 0);
        let c = record_key(1_700_000_000_000_000, 0);
        let d = record_key(1_700_000_000_000_000, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_record_key_decoding() {
        let key = record_key(-1_234, 42);
        assert_eq!(decode_record_key(&key), Some((-1_234, 42)));
        assert_eq!(decode_record_key(&key[..4]), None);
    }

    #[test]
    fn test_owner_key() {
        let rk = record_key(10, 1);
        let key = owner_key("pipeline-7", &rk).unwrap();
        assert!(key.starts_with(&owner_prefix("pipeline-7").unwrap()));
        assert_eq!(owner_from_index_key(&key), Some("pipeline-7"));
        assert!(key.ends_with(&rk));
    }

    #[test]
    fn test_owner_prefixes_do_not_collide() {
        // "ab" must not be a prefix of "abc" once length-prefixed
        let ab = owner_prefix("ab").unwrap();
        let abc = owner_prefix("abc").unwrap();
        assert!(!abc.starts_with(&ab));
    }

    #[test]
    fn test_prefix_end_bounds_all_keys() {
        let prefix = owner_prefix("p").unwrap();
        let end = owner_prefix_end(&prefix);
        let last = owner_key("p", &record_key(i64::MAX, u64::MAX)).unwrap();
        assert!(last.as_slice() < end.as_slice());
        let other = owner_key("q", &record_key(i64::MIN, 0)).unwrap();
        assert!(other.as_slice() > end.as_slice());
    }
}
