//! Correlation identifiers across process boundaries
//!
//! Correlation ids are UUIDs. An incoming W3C `traceparent` header carries
//! its trace id as 32 hex characters, which maps one-to-one onto a UUID, so
//! a request handler can adopt the caller's trace as its correlation id and
//! hand the same id to downstream calls.

use uuid::Uuid;

use tessera_core::ExecutionContext;

/// Trace id of a W3C `traceparent` header, as a correlation id
///
/// Format: `{version}-{trace_id}-{parent_id}-{flags}`. Returns `None` for
/// malformed headers and for the all-zero trace id, which W3C defines as
/// invalid.
pub fn correlation_from_traceparent(traceparent: &str) -> Option<String> {
    let parts: Vec<&str> = traceparent.trim().split('-').collect();
    if parts.len() != 4 || parts[1].len() != 32 || parts[2].len() != 16 {
        return None;
    }
    let trace_id = Uuid::parse_str(parts[1]).ok()?;
    if trace_id.is_nil() {
        return None;
    }
    Some(trace_id.to_string())
}

/// Build a `traceparent` header for an outgoing call
///
/// Returns `None` when the correlation id is not a UUID. The parent id is
/// the first 8 bytes of `span_id`.
pub fn to_traceparent(correlation_id: &str, span_id: Uuid) -> Option<String> {
    let trace_id = Uuid::parse_str(correlation_id).ok()?;
    let span_hex = span_id.as_simple().to_string();
    Some(format!("00-{}-{}-01", trace_id.as_simple(), &span_hex[..16]))
}

/// Helper trait to thread correlation through an execution context
pub trait CorrelationExt: Sized {
    /// Adopt the trace id of an incoming header, keeping the current
    /// correlation id if the header is malformed
    fn with_traceparent(self, traceparent: &str) -> Self;

    /// Header to send downstream, if the context has a UUID correlation id
    fn traceparent(&self) -> Option<String>;
}

impl CorrelationExt for ExecutionContext {
    fn with_traceparent(self, traceparent: &str) -> Self {
        match correlation_from_traceparent(traceparent) {
            Some(id) => self.with_correlation_id(id),
            None => self,
        }
    }

    fn traceparent(&self) -> Option<String> {
        let span_id = Uuid::parse_str(&self.execution_id).unwrap_or_else(|_| Uuid::new_v4());
        to_traceparent(self.correlation_id.as_deref()?, span_id)
    }
}

/// Field names the capture layer gives special meaning
pub mod fields {
    /// Rendered message
    pub const MESSAGE: &str = "message";
    /// Error value; becomes the record's exception text
    pub const ERROR: &str = "error";
    /// Exception or stack text
    pub const EXCEPTION: &str = "exception";
    /// Event-level correlation id, overriding the context's
    pub const CORRELATION_ID: &str = "correlation_id";
}
