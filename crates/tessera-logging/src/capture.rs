//! Capture of application log events
//!
//! [`CaptureHandler`] is the single entry point into the pipeline: it
//! attaches the ambient execution context, enriches the event and queues
//! the result. [`CaptureLayer`] feeds it from `tracing`.
//!
//! Two guards keep the pipeline from feeding on itself:
//!
//! - events whose target is one of the tessera crates are dropped
//! - a thread-local flag drops events emitted while a capture is already
//!   running on the same thread

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use tessera_core::{ExecutionContext, FieldValue, LogEvent, LogLevel, diagnostic};

use crate::context;
use crate::correlation::fields;
use crate::enrich::enrich;
use crate::scheduler::SchedulerHandle;

thread_local! {
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as capturing until dropped
struct ReentrancyGuard;

impl ReentrancyGuard {
    /// `None` if this thread is already inside a capture
    fn enter() -> Option<Self> {
        let already_inside = IN_CAPTURE.try_with(|flag| flag.replace(true)).unwrap_or(true);
        if already_inside { None } else { Some(ReentrancyGuard) }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_CAPTURE.try_with(|flag| flag.set(false));
    }
}

/// Whether a logger name belongs to the pipeline's own crates
pub fn is_internal_target(target: &str) -> bool {
    target == "tessera" || target.starts_with("tessera_") || target.starts_with("tessera::")
}

/// Entry point turning raw events into queued storage records
#[derive(Debug, Clone)]
pub struct CaptureHandler {
    scheduler: SchedulerHandle,
    default_context: ExecutionContext,
    min_level: LogLevel,
}

impl CaptureHandler {
    /// `default_context` is attached when no scope is active
    pub fn new(
        scheduler: SchedulerHandle,
        default_context: ExecutionContext,
        min_level: LogLevel,
    ) -> Self {
        Self {
            scheduler,
            default_context,
            min_level,
        }
    }

    pub fn default_context(&self) -> &ExecutionContext {
        &self.default_context
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Whether an event from `target` at `level` would be captured
    pub fn accepts(&self, target: &str, level: LogLevel) -> bool {
        level >= self.min_level && !is_internal_target(target)
    }

    /// Capture an event under the ambient context
    ///
    /// Never blocks beyond queue insertion, never panics, never fails.
    pub fn emit(&self, event: LogEvent) {
        self.capture(event, None, false);
    }

    /// Capture an event under an explicit context
    pub fn emit_with(&self, event: LogEvent, context: &ExecutionContext) {
        self.capture(event, Some(context), false);
    }

    /// Capture an event and write it without waiting for a batch
    pub fn emit_immediate(&self, event: LogEvent) {
        self.capture(event, None, true);
    }

    fn capture(&self, event: LogEvent, context: Option<&ExecutionContext>, immediate: bool) {
        if !self.accepts(&event.logger, LogLevel::normalize(&event.level)) {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            let ambient;
            let context = match context {
                Some(context) => context,
                None => {
                    ambient = context::current();
                    ambient.as_ref().unwrap_or(&self.default_context)
                }
            };
            let record = enrich(event, context).into_storage_record();
            if immediate {
                self.scheduler.submit_immediate(record);
            } else {
                self.scheduler.submit(record);
            }
        }));
        if result.is_err() {
            diagnostic::report("capture", "event dropped after a panic during capture");
        }
    }
}

/// `tracing` layer forwarding events to a [`CaptureHandler`]
///
/// The message becomes the record message, `error`/`exception` fields the
/// exception text, a `correlation_id` field the event correlation id, and
/// every other field an extra. The enclosing span's name fills the
/// function slot.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    handler: CaptureHandler,
}

impl CaptureLayer {
    pub fn new(handler: CaptureHandler) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &CaptureHandler {
        &self.handler
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self
            .handler
            .accepts(metadata.target(), LogLevel::from(*metadata.level()))
        {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let mut log_event = LogEvent::new(
            metadata.level().as_str(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        log_event.module = metadata.module_path().map(str::to_string);
        log_event.function = ctx.event_span(event).map(|span| span.name().to_string());
        log_event.file = metadata.file().map(str::to_string);
        log_event.line = metadata.line();
        log_event.exception = visitor.exception;
        log_event.correlation_id = visitor.correlation_id;
        log_event.extra = visitor.fields;

        self.handler.emit(log_event);
    }
}

/// Collects event fields into typed values
#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    exception: Option<String>,
    correlation_id: Option<String>,
    fields: BTreeMap<String, FieldValue>,
}

impl EventVisitor {
    fn record_value(&mut self, field: &Field, value: FieldValue) {
        match field.name() {
            fields::MESSAGE => self.message = Some(value.to_string()),
            fields::ERROR | fields::EXCEPTION => self.exception = Some(value.to_string()),
            fields::CORRELATION_ID => self.correlation_id = Some(value.to_string()),
            name => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for EventVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, FieldValue::F64(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, FieldValue::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, FieldValue::U64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, FieldValue::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, FieldValue::Str(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut text = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            text.push_str("\nCaused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.record_value(field, FieldValue::Str(text));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, FieldValue::Str(format!("{value:?}")));
    }
}
