//! Context capture, enrichment and batched fault-tolerant ingestion
//!
//! This crate turns application log events into durable, queryable records
//! without ever blocking or failing the code that emits them.
//!
//! # Features
//!
//! - **Ambient Context**: Attach execution id, owner and correlation id to
//!   every event emitted inside a scope, for threads and tokio tasks
//! - **Capture Layer**: `tracing_subscriber` layer feeding the pipeline
//! - **Batching**: One background worker flushing by size or by time
//! - **Resilience**: Retry with backoff inside a circuit breaker, with a
//!   local JSONL fallback and on-demand recovery
//! - **Subscriber Setup**: Console and rolling file output via
//!   tracing-appender alongside capture
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera_core::ExecutionContext;
//! use tessera_logging::{context, LogConfig, LogPipeline, PipelineConfig, TesseraSubscriberBuilder};
//!
//! let pipeline = LogPipeline::open(PipelineConfig::production("/var/lib/tessera"))?;
//! let _guard = TesseraSubscriberBuilder::new()
//!     .with_config(LogConfig::production("/var/log/tessera"))
//!     .with_pipeline(&pipeline)
//!     .init();
//!
//! context::with_context(ExecutionContext::new("pipeline-42"), || {
//!     tracing::info!(rows = 120, "Step finished");
//! });
//!
//! pipeline.flush();
//! pipeline.shutdown();
//! ```
//!
//! # Async Scopes
//!
//! ```ignore
//! context::scope(ExecutionContext::new("request-7"), async {
//!     tracing::warn!("Upstream slow");
//! })
//! .await;
//! ```

pub mod capture;
pub mod config;
pub mod context;
pub mod correlation;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod scheduler;

pub use capture::{CaptureHandler, CaptureLayer, is_internal_target};
pub use config::{
    BreakerSettings, ConsoleConfig, FileConfig, JsonlConfig, LogConfig, MAX_BATCH_TIMEOUT_MS,
    PipelineConfig, RetrySettings, RotationStrategy,
};
pub use context::{ExecutionContextGuard, clear_context, current, scope, set_context, with_context};
pub use correlation::{CorrelationExt, correlation_from_traceparent, fields, to_traceparent};
pub use enrich::enrich;
pub use error::{PipelineError, Result};
pub use pipeline::{HealthReport, LogPipeline};
pub use scheduler::{BatchScheduler, SchedulerHandle, SchedulerStats};
pub use tessera_core::diagnostic;

use std::fs::{self, File};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use tessera_core::LogLevel;

/// Type-erased layer over the base registry
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Subscriber produced by [`TesseraSubscriberBuilder::build`]
pub type TesseraSubscriber = Layered<Vec<BoxedLayer>, Registry>;

/// Builder for the process's `tracing` subscriber
///
/// Console and file output are filtered by `RUST_LOG` (or the configured
/// default level). The capture layer is filtered only by the pipeline's
/// own capture level, so a quiet console does not starve the store.
pub struct TesseraSubscriberBuilder {
    config: LogConfig,
    capture: Option<CaptureLayer>,
}

impl TesseraSubscriberBuilder {
    /// Default: JSONL output to console, no capture
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
            capture: None,
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default filter directive
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Feed events into a pipeline
    pub fn with_pipeline(self, pipeline: &LogPipeline) -> Self {
        self.with_capture(pipeline.layer())
    }

    /// Feed events into a capture layer
    pub fn with_capture(mut self, layer: CaptureLayer) -> Self {
        self.capture = Some(layer);
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.default_level))
    }

    fn file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard)> {
        let rotation = match file_config.rotation {
            RotationStrategy::Never => {
                fs::create_dir_all(&file_config.directory).map_err(|e| {
                    PipelineError::Subscriber(format!(
                        "cannot create {}: {e}",
                        file_config.directory.display()
                    ))
                })?;
                let path = file_config
                    .directory
                    .join(format!("{}.log", file_config.prefix));
                let file = File::create(&path).map_err(|e| {
                    PipelineError::Subscriber(format!("cannot create {}: {e}", path.display()))
                })?;
                return Ok(tracing_appender::non_blocking(file));
            }
            RotationStrategy::Daily => Rotation::DAILY,
            RotationStrategy::Hourly => Rotation::HOURLY,
        };
        let appender =
            RollingFileAppender::new(rotation, &file_config.directory, &file_config.prefix);
        Ok(tracing_appender::non_blocking(appender))
    }

    /// Assemble the subscriber without installing it
    ///
    /// The returned guard must be kept alive while file output is in use.
    pub fn build(self) -> Result<(TesseraSubscriber, Option<WorkerGuard>)> {
        let jsonl = &self.config.jsonl;
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            let layer: BoxedLayer = if self.config.console.pretty {
                tracing_subscriber::fmt::layer()
                    .with_ansi(self.config.console.ansi)
                    .with_target(true)
                    .with_filter(self.env_filter())
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(jsonl.include_spans)
                    .flatten_event(jsonl.flatten_events)
                    .with_file(jsonl.include_location)
                    .with_line_number(jsonl.include_location)
                    .with_filter(self.env_filter())
                    .boxed()
            };
            layers.push(layer);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = Self::file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(jsonl.include_spans)
                    .flatten_event(jsonl.flatten_events)
                    .with_file(jsonl.include_location)
                    .with_line_number(jsonl.include_location)
                    .with_writer(writer)
                    .with_filter(self.env_filter())
                    .boxed(),
            );
        }

        if let Some(capture) = self.capture {
            let handler = capture.handler().clone();
            layers.push(
                capture
                    .with_filter(filter_fn(move |metadata| {
                        handler.accepts(metadata.target(), LogLevel::from(*metadata.level()))
                    }))
                    .boxed(),
            );
        }

        Ok((Registry::default().with(layers), guard))
    }

    /// Install the subscriber globally
    ///
    /// Fails if a global subscriber is already set or a log file cannot
    /// be created.
    pub fn try_init(self) -> Result<Option<WorkerGuard>> {
        let (subscriber, guard) = self.build()?;
        subscriber
            .try_init()
            .map_err(|e| PipelineError::Subscriber(e.to_string()))?;
        Ok(guard)
    }

    /// Install the subscriber globally, reporting failure on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                diagnostic::report("subscriber", e);
                None
            }
        }
    }
}

impl Default for TesseraSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() -> Option<WorkerGuard> {
    TesseraSubscriberBuilder::new().init()
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Option<WorkerGuard> {
    TesseraSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for testing (warnings only), ignoring a subscriber
/// that is already installed
pub fn init_testing() {
    let _ = TesseraSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
