//! Configuration types for the ingestion pipeline and subscriber output

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_core::LogLevel;
use tessera_storage::{CircuitBreakerConfig, FallbackConfig, RedbLogStoreConfig, RetryPolicy};

use crate::error::{PipelineError, Result};

/// Where the process's own diagnostics are written
///
/// This only shapes console and file output of `tracing`. What reaches the
/// record store is decided by [`PipelineConfig::capture_level`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub default_level: String,
    pub console: ConsoleConfig,
    /// Rolling file sink; `None` writes nothing to disk
    pub file: Option<FileConfig>,
    /// Shape of JSON lines on both sinks
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Debug level, human-readable colored console
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Default::default()
        }
    }

    /// Console off; JSON lines into daily files under `log_dir`
    pub fn production(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig {
                enabled: false,
                pretty: false,
                ansi: false,
            },
            file: Some(FileConfig::new(log_dir)),
            jsonl: JsonlConfig::default(),
        }
    }

    /// Quiet console so test output stays readable
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            ..Default::default()
        }
    }
}

/// Stdout sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Multi-line human format instead of JSON lines
    pub pretty: bool,
    /// Color escapes; only honored with `pretty`
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
        }
    }
}

/// Rolling file sink fed through a non-blocking writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// Leading part of every file name, e.g. `tessera.2026-10-18`
    pub prefix: String,
    pub rotation: RotationStrategy,
}

impl FileConfig {
    /// Daily files named `tessera.*` under `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "tessera".to_string(),
            rotation: RotationStrategy::Daily,
        }
    }
}

/// How often the file sink starts a new file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One `<prefix>.log`, truncated when the subscriber is built
    Never,
}

/// Field layout of emitted JSON lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlConfig {
    /// Put event fields at the top level instead of under `fields`
    pub flatten_events: bool,
    /// Add the list of entered spans
    pub include_spans: bool,
    /// Add source file and line
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_location: true,
        }
    }
}

/// Retry settings in serializable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker settings in serializable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// Longest accepted `batch_timeout_ms`; larger values are capped
pub const MAX_BATCH_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per size-triggered flush
    pub batch_size: usize,
    /// Maximum time between flushes, capped at [`MAX_BATCH_TIMEOUT_MS`]
    pub batch_timeout_ms: u64,
    /// How long `flush()` waits by default
    pub flush_timeout_ms: u64,
    /// Deadline for draining the queue at shutdown
    pub shutdown_timeout_ms: u64,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub fallback: FallbackConfig,
    /// Primary redb database file
    pub store_path: PathBuf,
    /// Owner attached when no execution context is active
    pub default_owner: String,
    /// Namespace attached when no execution context is active
    pub default_namespace: String,
    /// Events below this level are not captured, whichever entry point
    /// they come through
    pub capture_level: LogLevel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 5_000,
            flush_timeout_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            fallback: FallbackConfig::default(),
            store_path: PathBuf::from("./data/tessera-logs.redb"),
            default_owner: "system".to_string(),
            default_namespace: "default".to_string(),
            capture_level: LogLevel::Info,
        }
    }
}

impl PipelineConfig {
    /// Small batches and short timeouts, capturing debug events
    pub fn development() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 1_000,
            capture_level: LogLevel::Debug,
            ..Default::default()
        }
    }

    /// Store and fallback under one data directory
    pub fn production(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            batch_size: 500,
            fallback: FallbackConfig::new(data_dir.join("fallback"))
                .with_max_file_bytes(50 * 1024 * 1024),
            store_path: data_dir.join("tessera-logs.redb"),
            ..Default::default()
        }
    }

    /// Fast timings for tests; paths still need to point at a temp dir
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 100,
            flush_timeout_ms: 2_000,
            shutdown_timeout_ms: 2_000,
            retry: RetrySettings {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            breaker: BreakerSettings {
                failure_threshold: 3,
                success_threshold: 1,
                recovery_timeout_ms: 200,
            },
            capture_level: LogLevel::Trace,
            ..Default::default()
        }
    }

    /// Place the store and fallback directory under `data_dir`
    pub fn with_data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        self.store_path = data_dir.join("tessera-logs.redb");
        self.fallback.dir = data_dir.join("fallback");
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = duration_ms(timeout).min(MAX_BATCH_TIMEOUT_MS);
        self
    }

    pub fn with_default_owner(mut self, owner: impl Into<String>) -> Self {
        self.default_owner = owner.into();
        self
    }

    pub fn with_capture_level(mut self, level: LogLevel) -> Self {
        self.capture_level = level;
        self
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.min(MAX_BATCH_TIMEOUT_MS))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_delays(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
            .with_multiplier(self.retry.backoff_multiplier)
            .with_jitter(self.retry.jitter)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            success_threshold: self.breaker.success_threshold,
            recovery_timeout: Duration::from_millis(self.breaker.recovery_timeout_ms),
        }
    }

    pub fn store_config(&self) -> RedbLogStoreConfig {
        RedbLogStoreConfig::new(&self.store_path)
    }

    /// Defaults overridden by `TESSERA_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup
    ///
    /// Recognized keys: `TESSERA_BATCH_SIZE`, `TESSERA_BATCH_TIMEOUT_MS`,
    /// `TESSERA_FLUSH_TIMEOUT_MS`, `TESSERA_SHUTDOWN_TIMEOUT_MS`,
    /// `TESSERA_RETRY_MAX_ATTEMPTS`, `TESSERA_RETRY_BASE_DELAY_MS`,
    /// `TESSERA_RETRY_MAX_DELAY_MS`, `TESSERA_RETRY_JITTER`,
    /// `TESSERA_BREAKER_FAILURE_THRESHOLD`, `TESSERA_BREAKER_SUCCESS_THRESHOLD`,
    /// `TESSERA_BREAKER_RECOVERY_TIMEOUT_MS`, `TESSERA_FALLBACK_DIR`,
    /// `TESSERA_FALLBACK_MAX_FILES`, `TESSERA_FALLBACK_MAX_FILE_BYTES`,
    /// `TESSERA_STORE_PATH`, `TESSERA_DEFAULT_OWNER`,
    /// `TESSERA_DEFAULT_NAMESPACE`, `TESSERA_CAPTURE_LEVEL`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };

        if let Some(v) = env.parse::<usize>("TESSERA_BATCH_SIZE")? {
            self.batch_size = v.max(1);
        }
        if let Some(v) = env.parse::<u64>("TESSERA_BATCH_TIMEOUT_MS")? {
            self.batch_timeout_ms = v.min(MAX_BATCH_TIMEOUT_MS);
        }
        if let Some(v) = env.parse("TESSERA_FLUSH_TIMEOUT_MS")? {
            self.flush_timeout_ms = v;
        }
        if let Some(v) = env.parse("TESSERA_SHUTDOWN_TIMEOUT_MS")? {
            self.shutdown_timeout_ms = v;
        }
        if let Some(v) = env.parse("TESSERA_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env.parse("TESSERA_RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = env.parse("TESSERA_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = env.parse("TESSERA_RETRY_JITTER")? {
            self.retry.jitter = v;
        }
        if let Some(v) = env.parse("TESSERA_BREAKER_FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env.parse("TESSERA_BREAKER_SUCCESS_THRESHOLD")? {
            self.breaker.success_threshold = v;
        }
        if let Some(v) = env.parse("TESSERA_BREAKER_RECOVERY_TIMEOUT_MS")? {
            self.breaker.recovery_timeout_ms = v;
        }
        if let Some(v) = env.get("TESSERA_FALLBACK_DIR") {
            self.fallback.dir = PathBuf::from(v);
        }
        if let Some(v) = env.parse::<usize>("TESSERA_FALLBACK_MAX_FILES")? {
            self.fallback.max_files = v.max(1);
        }
        if let Some(v) = env.parse("TESSERA_FALLBACK_MAX_FILE_BYTES")? {
            self.fallback.max_file_bytes = v;
        }
        if let Some(v) = env.get("TESSERA_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("TESSERA_DEFAULT_OWNER") {
            self.default_owner = v;
        }
        if let Some(v) = env.get("TESSERA_DEFAULT_NAMESPACE") {
            self.default_namespace = v;
        }
        if let Some(v) = env.parse("TESSERA_CAPTURE_LEVEL")? {
            self.capture_level = v;
        }

        Ok(self)
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let parsed = raw.trim().parse::<T>();
                parsed
                    .map(Some)
                    .map_err(|e| PipelineError::invalid_config(key, raw, e))
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.default_level, "info");
        assert!(config.console.enabled);
        assert!(!config.console.pretty); // JSONL by default
        assert!(config.file.is_none());
    }

    #[test]
    fn test_development_config() {
        let config = LogConfig::development();
        assert_eq!(config.default_level, "debug");
        assert!(config.console.pretty);
        assert!(config.console.ansi);
    }

    #[test]
    fn test_production_config() {
        let config = LogConfig::production("/var/log/tessera");
        assert!(!config.console.enabled);
        let file = config.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/tessera"));
        assert_eq!(file.prefix, "tessera");
        assert_eq!(file.rotation, RotationStrategy::Daily);
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_owner, "system");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.breaker_config(), CircuitBreakerConfig::default());
    }

    #[test]
    fn test_production_paths_share_data_dir() {
        let config = PipelineConfig::production("/srv/tessera");
        assert_eq!(config.store_path, PathBuf::from("/srv/tessera/tessera-logs.redb"));
        assert_eq!(config.fallback.dir, PathBuf::from("/srv/tessera/fallback"));
    }

    #[test]
    fn test_overrides_apply() {
        let config = PipelineConfig::default()
            .with_overrides(lookup(&[
                ("TESSERA_BATCH_SIZE", "25"),
                ("TESSERA_BATCH_TIMEOUT_MS", "250"),
                ("TESSERA_RETRY_JITTER", "false"),
                ("TESSERA_BREAKER_FAILURE_THRESHOLD", "7"),
                ("TESSERA_FALLBACK_DIR", "/tmp/fb"),
                ("TESSERA_DEFAULT_OWNER", "api"),
                ("TESSERA_CAPTURE_LEVEL", "warn"),
            ]))
            .unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_timeout(), Duration::from_millis(250));
        assert!(!config.retry.jitter);
        assert_eq!(config.breaker_config().failure_threshold, 7);
        assert_eq!(config.fallback.dir, PathBuf::from("/tmp/fb"));
        assert_eq!(config.default_owner, "api");
        assert_eq!(config.capture_level, LogLevel::Warning);
    }

    #[test]
    fn test_batch_timeout_is_capped() {
        let day = Duration::from_millis(MAX_BATCH_TIMEOUT_MS);
        let config = PipelineConfig::default()
            .with_overrides(lookup(&[("TESSERA_BATCH_TIMEOUT_MS", "18446744073709551615")]))
            .unwrap();
        assert_eq!(config.batch_timeout(), day);

        let config = PipelineConfig::default().with_batch_timeout(Duration::MAX);
        assert_eq!(config.batch_timeout_ms, MAX_BATCH_TIMEOUT_MS);

        let config = PipelineConfig {
            batch_timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.batch_timeout(), day);
    }

    #[test]
    fn test_overrides_reject_garbage() {
        let err = PipelineConfig::default()
            .with_overrides(lookup(&[("TESSERA_BATCH_SIZE", "lots")]))
            .unwrap_err();
        match err {
            PipelineError::InvalidConfig { key, value, .. } => {
                assert_eq!(key, "TESSERA_BATCH_SIZE");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_override_ignored() {
        let config = PipelineConfig::default()
            .with_overrides(lookup(&[("TESSERA_BATCH_SIZE", "  ")]))
            .unwrap();
        assert_eq!(config.batch_size, 100);
    }
}
