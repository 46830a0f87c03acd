//! Pipeline registry object
//!
//! A [`LogPipeline`] owns every moving part of ingestion: the primary
//! sink, the resilient writer around it, the fallback store, the batch
//! worker and the capture handler. The process root constructs one at
//! startup, passes it by reference, and shuts it down explicitly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use tessera_core::{ExecutionContext, LogEvent, RecordSink};
use tessera_storage::{
    CircuitStateKind, FallbackStore, RecoveryReport, RedbLogStore, ResilientWriter,
};

use crate::capture::{CaptureHandler, CaptureLayer};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::scheduler::{BatchScheduler, SchedulerHandle, SchedulerStats};

/// Point-in-time view of pipeline health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub breaker_state: CircuitStateKind,
    pub consecutive_failures: u32,
    /// True while the breaker is not closed
    pub degraded: bool,
    pub queue_depth: usize,
    pub fallback_files: usize,
    pub scheduler: SchedulerStats,
}

/// Ingestion pipeline
pub struct LogPipeline {
    config: PipelineConfig,
    store: Option<Arc<RedbLogStore>>,
    writer: Arc<ResilientWriter>,
    fallback: Arc<FallbackStore>,
    scheduler: SchedulerHandle,
    handler: CaptureHandler,
}

impl LogPipeline {
    /// Pipeline writing into a redb store at `config.store_path`
    #[instrument(skip_all, fields(store = %config.store_path.display()))]
    pub fn open(config: PipelineConfig) -> Result<Self> {
        let store = Arc::new(RedbLogStore::open(config.store_config())?);
        let sink: Arc<dyn RecordSink> = store.clone();
        Self::build(config, sink, Some(store))
    }

    /// Pipeline writing into a caller-supplied primary sink
    pub fn with_sink(config: PipelineConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        Self::build(config, sink, None)
    }

    fn build(
        config: PipelineConfig,
        sink: Arc<dyn RecordSink>,
        store: Option<Arc<RedbLogStore>>,
    ) -> Result<Self> {
        let fallback = Arc::new(FallbackStore::new(config.fallback.clone())?);
        let writer = Arc::new(ResilientWriter::new(
            sink,
            config.retry_policy(),
            config.breaker_config(),
        ));
        let scheduler = BatchScheduler::spawn(&config, Arc::clone(&writer), Arc::clone(&fallback))?;
        let handler = CaptureHandler::new(
            scheduler.clone(),
            ExecutionContext::fallback(&config.default_owner, &config.default_namespace),
            config.capture_level,
        );

        let pending = fallback.pending_count();
        if pending > 0 {
            warn!(pending, "Fallback store holds records from a previous run");
        }
        info!(
            default_owner = %config.default_owner,
            capture_level = %config.capture_level,
            "Log pipeline started"
        );

        Ok(Self {
            config,
            store,
            writer,
            fallback,
            scheduler,
            handler,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The redb store, when the pipeline was opened over one
    pub fn store(&self) -> Option<&RedbLogStore> {
        self.store.as_deref()
    }

    pub fn fallback(&self) -> &FallbackStore {
        &self.fallback
    }

    pub fn handler(&self) -> &CaptureHandler {
        &self.handler
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// `tracing` layer feeding this pipeline
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer::new(self.handler.clone())
    }

    /// Ingest an event under an explicit context; never fails
    pub fn submit(&self, event: LogEvent, context: &ExecutionContext) {
        self.handler.emit_with(event, context);
    }

    /// Ingest an event under the ambient context; never fails
    pub fn emit(&self, event: LogEvent) {
        self.handler.emit(event);
    }

    /// Wait for queued records using the configured flush timeout
    pub fn flush(&self) -> bool {
        self.flush_timeout(self.config.flush_timeout())
    }

    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        self.scheduler.flush(timeout)
    }

    pub fn health(&self) -> HealthReport {
        let status = self.writer.status();
        HealthReport {
            degraded: status.state != CircuitStateKind::Closed,
            breaker_state: status.state,
            consecutive_failures: status.consecutive_failures,
            queue_depth: self.scheduler.queue_depth(),
            fallback_files: self.fallback.file_count(),
            scheduler: self.scheduler.stats(),
        }
    }

    /// Replay the fallback store straight into the primary sink
    ///
    /// Bypasses retry and the breaker so a failed replay cannot land back
    /// in the fallback store.
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<RecoveryReport> {
        Ok(self.fallback.recover(self.writer.sink().as_ref())?)
    }

    /// Drain and stop the worker within the configured shutdown deadline
    ///
    /// Events emitted afterwards go straight to the fallback store.
    pub fn shutdown(&self) -> SchedulerStats {
        self.scheduler.stop(self.config.shutdown_timeout())
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline")
            .field("store", &self.store)
            .field("writer", &self.writer)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tessera_core::{FnSink, LogLevel, QueryFilter, StorageError, StorageRecord};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};

    /// Counts events whose message equals `needle`
    struct MessageCounter {
        needle: &'static str,
        hits: Arc<AtomicUsize>,
    }

    struct MessageMatch<'a> {
        needle: &'a str,
        found: bool,
    }

    impl Visit for MessageMatch<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.found |= field.name() == "message" && value == self.needle;
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.found |= field.name() == "message" && format!("{value:?}") == self.needle;
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for MessageCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageMatch {
                needle: self.needle,
                found: false,
            };
            event.record(&mut visitor);
            if visitor.found {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn config(temp: &TempDir) -> PipelineConfig {
        PipelineConfig::testing().with_data_dir(temp.path())
    }

    #[test]
    fn test_submit_and_query() {
        let temp = TempDir::new().unwrap();
        let pipeline = LogPipeline::open(config(&temp)).unwrap();
        let ctx = ExecutionContext::new("pipeline-1");

        for i in 0..3 {
            pipeline.submit(LogEvent::new("info", "app", format!("step {i}")), &ctx);
        }
        assert!(pipeline.flush());

        let store = pipeline.store().unwrap();
        let records = store
            .query(&QueryFilter::new().owner("pipeline-1"))
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.execution_id == ctx.execution_id));
        assert!(!pipeline.health().degraded);
    }

    #[test]
    fn test_degraded_then_recovered() {
        let temp = TempDir::new().unwrap();
        let failing = Arc::new(FnSink::new(|_: &StorageRecord| {
            Err(StorageError::unavailable("primary down"))
        }));
        let pipeline = LogPipeline::with_sink(config(&temp), failing).unwrap();

        for i in 0..5 {
            pipeline.emit(LogEvent::new("error", "app", format!("{i}")));
        }
        assert!(pipeline.flush());

        let health = pipeline.health();
        assert!(health.degraded);
        assert_eq!(health.breaker_state, CircuitStateKind::Open);
        assert_eq!(health.scheduler.records_fallback, 5);
        assert_eq!(health.fallback_files, 1);
        assert_eq!(pipeline.fallback().pending_count(), 5);

        // The sink is still down, so nothing is lost by recovering now
        let report = pipeline.recover().unwrap();
        assert_eq!(report.failed, 5);
        assert_eq!(pipeline.fallback().pending_count(), 5);
    }

    #[test]
    fn test_shutdown_diverts_late_events() {
        let temp = TempDir::new().unwrap();
        let pipeline = LogPipeline::open(config(&temp)).unwrap();
        pipeline.emit(LogEvent::new("info", "app", "before"));
        let stats = pipeline.shutdown();
        assert_eq!(stats.records_written, 1);

        pipeline.emit(LogEvent::new("info", "app", "after"));
        assert_eq!(pipeline.fallback().pending_count(), 1);

        let report = pipeline.recover().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(pipeline.store().unwrap().count().unwrap(), 2);
    }

    #[test]
    fn test_capture_level_respected() {
        let temp = TempDir::new().unwrap();
        let pipeline = LogPipeline::open(config(&temp).with_capture_level(LogLevel::Warning)).unwrap();
        assert!(!pipeline.handler().accepts("app", LogLevel::Info));
        assert!(pipeline.handler().accepts("app", LogLevel::Error));
    }

    #[test]
    fn test_recovery_logged_once() {
        let temp = TempDir::new().unwrap();
        let pipeline = LogPipeline::open(config(&temp)).unwrap();
        pipeline.shutdown();
        pipeline.emit(LogEvent::new("info", "app", "late"));

        let hits = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(MessageCounter {
            needle: "Fallback recovery finished",
            hits: Arc::clone(&hits),
        });
        let report = tracing::subscriber::with_default(subscriber, || pipeline.recover()).unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
