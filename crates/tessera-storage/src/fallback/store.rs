//! Rotating JSONL fallback store
//!
//! Records that could not reach the primary sink are appended here, one
//! self-contained JSON line each, and replayed later with
//! [`FallbackStore::recover`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use tessera_core::{RecordSink, StorageError, StorageRecord, diagnostic, write_guarded};

/// Configuration for the fallback store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Directory holding the rotation files
    pub dir: PathBuf,
    /// File name prefix
    pub file_prefix: String,
    /// Size at which the current file is rotated
    pub max_file_bytes: u64,
    /// Number of rotation files kept; older ones are pruned
    pub max_files: usize,
    /// Whether to sync each append to disk
    pub sync_on_write: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/fallback"),
            file_prefix: "fallback".to_string(),
            max_file_bytes: 10 * 1024 * 1024, // 10MB
            max_files: 10,
            sync_on_write: true,
        }
    }
}

impl FallbackConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_max_files(mut self, files: usize) -> Self {
        self.max_files = files.max(1);
        self
    }
}

/// One line of a rotation file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    /// When the record entered the fallback store
    pub stored_at: DateTime<Utc>,
    pub record: StorageRecord,
}

/// Result of replaying the fallback store into a sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub failed: usize,
    pub files_processed: usize,
}

pub(super) struct CurrentFile {
    pub(super) path: PathBuf,
    file: File,
    size: u64,
}

pub(super) struct WriterState {
    pub(super) current: Option<CurrentFile>,
    next_file_seq: u64,
}

/// Local append-only store for undeliverable records
pub struct FallbackStore {
    config: FallbackConfig,
    pub(super) state: Mutex<WriterState>,
}

impl FallbackStore {
    /// Create the store, creating its directory if needed
    #[instrument(skip_all, fields(dir = %config.dir.display()))]
    pub fn new(config: FallbackConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.dir)?;
        info!("Opened fallback store");
        Ok(Self {
            config,
            state: Mutex::new(WriterState {
                current: None,
                next_file_seq: 0,
            }),
        })
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Append a record, reporting any failure on stderr
    ///
    /// Returns whether the record was stored.
    pub fn store(&self, record: &StorageRecord) -> bool {
        match self.try_store(record) {
            Ok(()) => true,
            Err(e) => {
                diagnostic::report(
                    "fallback",
                    format_args!("dropping record {}: {}", record.id, e),
                );
                false
            }
        }
    }

    /// Append a record
    pub fn try_store(&self, record: &StorageRecord) -> Result<(), StorageError> {
        let line = encode_line(record)?;
        let mut state = self.state.lock();
        self.append_locked(&mut state, &line)
    }

    /// All stored records, oldest file first
    ///
    /// Lines that fail to parse are skipped.
    pub fn list(&self) -> Result<Vec<StorageRecord>, StorageError> {
        let _state = self.state.lock();
        let mut records = Vec::new();
        for path in self.rotation_files()? {
            records.extend(read_file(&path)?);
        }
        Ok(records)
    }

    /// Number of rotation files on disk
    pub fn file_count(&self) -> usize {
        self.rotation_files().map(|files| files.len()).unwrap_or(0)
    }

    /// Number of records awaiting recovery
    pub fn pending_count(&self) -> usize {
        self.list().map(|records| records.len()).unwrap_or(0)
    }

    /// Replay every stored record through `sink`
    ///
    /// Files present when recovery starts are processed; records stored
    /// meanwhile land in new files and wait for the next pass. When every
    /// record is written the processed files are removed. Otherwise the
    /// failed records are first written to a fresh file and only then are
    /// the processed files removed, so a crash at any point leaves at least
    /// every unrecovered record on disk.
    #[instrument(skip_all)]
    pub fn recover(&self, sink: &dyn RecordSink) -> Result<RecoveryReport, StorageError> {
        let files = {
            let mut state = self.state.lock();
            state.current = None;
            self.rotation_files()?
        };

        let mut report = RecoveryReport::default();
        let mut failed = Vec::new();

        for path in &files {
            for record in read_file(path)? {
                match write_guarded(sink, &record) {
                    Ok(()) => report.recovered += 1,
                    Err(e) => {
                        debug!(record_id = %record.id, error = %e, "Recovery write failed");
                        failed.push(record);
                    }
                }
            }
            report.files_processed += 1;
        }
        report.failed = failed.len();

        if !failed.is_empty() {
            let lines = failed
                .iter()
                .map(encode_line)
                .collect::<Result<Vec<_>, _>>()?;
            let mut state = self.state.lock();
            state.current = None;
            for line in &lines {
                self.append_locked(&mut state, line)?;
            }
            state.current = None;
        }

        for path in &files {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove recovered file");
            }
        }

        info!(
            recovered = report.recovered,
            failed = report.failed,
            files = report.files_processed,
            "Fallback recovery finished"
        );
        Ok(report)
    }

    /// Rotation files sorted by creation
    pub(crate) fn rotation_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let prefix = format!("{}-", self.config.file_prefix);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.config.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect();
        // Names embed a fixed-width timestamp and sequence
        files.sort();
        Ok(files)
    }

    fn append_locked(&self, state: &mut WriterState, line: &[u8]) -> Result<(), StorageError> {
        let needs_rotation = match &state.current {
            Some(current) => current.size >= self.config.max_file_bytes,
            None => true,
        };
        if needs_rotation {
            self.rotate_locked(state)?;
        }

        let Some(current) = state.current.as_mut() else {
            return Err(StorageError::io("no fallback file open"));
        };
        current.file.write_all(line)?;
        if self.config.sync_on_write {
            current.file.sync_data()?;
        }
        current.size += line.len() as u64;
        Ok(())
    }

    fn rotate_locked(&self, state: &mut WriterState) -> Result<(), StorageError> {
        let name = format!(
            "{}-{}-{:06}.jsonl",
            self.config.file_prefix,
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            state.next_file_seq
        );
        state.next_file_seq += 1;

        let path = self.config.dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), "Rotated fallback file");

        state.current = Some(CurrentFile { path, file, size });
        self.prune_locked(state);
        Ok(())
    }
}

fn encode_line(record: &StorageRecord) -> Result<Vec<u8>, StorageError> {
    let entry = FallbackEntry {
        stored_at: Utc::now(),
        record: record.clone(),
    };
    let mut line = serde_json::to_vec(&entry)?;
    line.push(b'\n');
    Ok(line)
}

fn read_file(path: &Path) -> Result<Vec<StorageRecord>, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        // Pruned or recovered concurrently
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FallbackEntry>(&line) {
            Ok(entry) => records.push(entry.record),
            Err(e) => {
                warn!(path = %path.display(), line = number + 1, error = %e, "Skipping unparseable fallback line");
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tessera_core::{FnSink, LogLevel};

    fn create_test_store(config: impl FnOnce(FallbackConfig) -> FallbackConfig) -> (FallbackStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FallbackStore::new(config(FallbackConfig::new(temp_dir.path()))).unwrap();
        (store, temp_dir)
    }

    fn record(message: &str) -> StorageRecord {
        StorageRecord::new("p1", LogLevel::Error, message)
    }

    #[test]
    fn test_store_and_list_verbatim() {
        let (store, _temp) = create_test_store(|c| c);
        let originals: Vec<_> = (0..3).map(|i| record(&format!("m{i}"))).collect();
        for r in &originals {
            assert!(store.store(r));
        }
        assert_eq!(store.list().unwrap(), originals);
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.pending_count(), 3);
    }

    #[test]
    fn test_rotation_by_size() {
        let (store, _temp) = create_test_store(|c| c.with_max_file_bytes(1));
        for i in 0..4 {
            store.try_store(&record(&format!("m{i}"))).unwrap();
        }
        assert_eq!(store.file_count(), 4);
        let messages: Vec<_> = store.list().unwrap().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn test_pruning_keeps_newest_files() {
        let (store, _temp) = create_test_store(|c| c.with_max_file_bytes(1).with_max_files(2));
        for i in 0..5 {
            store.try_store(&record(&format!("m{i}"))).unwrap();
        }
        assert_eq!(store.file_count(), 2);
        let messages: Vec<_> = store.list().unwrap().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["m3", "m4"]);
        assert_eq!(store.prune(), 0);
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let (store, _temp) = create_test_store(|c| c);
        store.try_store(&record("good")).unwrap();
        let path = store.rotation_files().unwrap().remove(0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        drop(file);
        store.try_store(&record("after")).unwrap();

        let messages: Vec<_> = store.list().unwrap().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["good", "after"]);
    }

    #[test]
    fn test_recover_all() {
        let (store, _temp) = create_test_store(|c| c.with_max_file_bytes(1));
        for i in 0..3 {
            store.try_store(&record(&format!("m{i}"))).unwrap();
        }

        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_written = Arc::clone(&written);
        let sink = FnSink::new(move |r: &StorageRecord| {
            sink_written.lock().push(r.message.clone());
            Ok(())
        });

        let report = store.recover(&sink).unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered: 3,
                failed: 0,
                files_processed: 3
            }
        );
        assert_eq!(*written.lock(), vec!["m0", "m1", "m2"]);
        assert_eq!(store.file_count(), 0);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_recover_retains_failures() {
        let (store, _temp) = create_test_store(|c| c);
        for i in 0..4 {
            store.try_store(&record(&format!("m{i}"))).unwrap();
        }

        let sink = FnSink::new(|r: &StorageRecord| {
            if r.message == "m2" {
                Err(StorageError::unavailable("primary down"))
            } else {
                Ok(())
            }
        });

        let report = store.recover(&sink).unwrap();
        assert_eq!(report.recovered, 3);
        assert_eq!(report.failed, 1);

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "m2");

        // Writes after recovery still work
        assert!(store.store(&record("later")));
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn test_recover_empty_store() {
        let (store, _temp) = create_test_store(|c| c);
        let sink = FnSink::new(|_: &StorageRecord| Ok(()));
        assert_eq!(store.recover(&sink).unwrap(), RecoveryReport::default());
    }

    #[test]
    fn test_store_failure_returns_false() {
        let (store, temp) = create_test_store(|c| c);
        let dir = temp.path().to_path_buf();
        drop(temp);
        // Directory is gone, so opening a rotation file fails
        assert!(!store.store(&record("lost")));
        assert!(!dir.exists());
    }
}
