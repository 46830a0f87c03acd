//! Log record data model
//!
//! A record moves through three shapes on its way to storage:
//!
//! ```text
//! LogEvent (raw, per call) + ExecutionContext (per scope)
//!   └─ enrich ─→ EnrichedRecord (immutable, normalized)
//!        └─ serialize extras ─→ StorageRecord (persistence-ready)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::level::LogLevel;

/// Generate a fresh correlation identifier
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single extra key-value attached to a log event
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
}

impl FieldValue {
    /// Convert to a JSON value
    ///
    /// Fails for values JSON cannot represent (NaN and infinities).
    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        Ok(match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::I64(i) => serde_json::Value::from(*i),
            FieldValue::U64(u) => serde_json::Value::from(*u),
            FieldValue::F64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| format!("non-finite float {f} has no JSON representation"))?,
            FieldValue::Str(s) => serde_json::Value::String(s.clone()),
        })
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::I64(i) => write!(f, "{i}"),
            FieldValue::U64(u) => write!(f, "{u}"),
            FieldValue::F64(x) => write!(f, "{x}"),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I64(v.into())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Raw log event as produced at the call site
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Level as the producer named it (normalized during enrichment)
    pub level: String,
    /// Logger or target name
    pub logger: String,
    /// Rendered message
    pub message: String,
    /// Call-site module path
    pub module: Option<String>,
    /// Call-site function or enclosing span
    pub function: Option<String>,
    /// Call-site source file
    pub file: Option<String>,
    /// Call-site line number
    pub line: Option<u32>,
    /// Emitting thread id
    pub thread_id: String,
    /// Emitting thread name
    pub thread_name: Option<String>,
    /// Emitting process id
    pub process_id: u32,
    /// Exception or error chain text
    pub exception: Option<String>,
    /// Correlation id carried by the event itself
    pub correlation_id: Option<String>,
    /// Arbitrary structured fields
    pub extra: BTreeMap<String, FieldValue>,
}

impl LogEvent {
    /// Create an event stamped with the current time and thread
    pub fn new(
        level: impl Into<String>,
        logger: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let thread = std::thread::current();
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            logger: logger.into(),
            message: message.into(),
            module: None,
            function: None,
            file: None,
            line: None,
            thread_id: format!("{:?}", thread.id()),
            thread_name: thread.name().map(str::to_string),
            process_id: std::process::id(),
            exception: None,
            correlation_id: None,
            extra: BTreeMap::new(),
        }
    }

    /// Override the emission timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the call-site location
    pub fn with_location(
        mut self,
        module: impl Into<String>,
        function: impl Into<String>,
        line: u32,
    ) -> Self {
        self.module = Some(module.into());
        self.function = Some(function.into());
        self.line = Some(line);
        self
    }

    /// Attach exception text
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Attach an event-level correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Scope-bound identity of a logical unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique id of this execution
    pub execution_id: String,
    /// Owning pipeline or request id
    pub owner_id: String,
    /// Tenant or project namespace
    pub namespace: String,
    /// Correlation id shared by every record of the execution
    pub correlation_id: Option<String>,
    /// When the unit of work started
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Start a new execution for an owner
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            namespace: "default".to_string(),
            correlation_id: Some(new_correlation_id()),
            started_at: Utc::now(),
        }
    }

    /// Context used when no scope is active
    ///
    /// It carries no correlation id, so every record logged under it gets
    /// a fresh one.
    pub fn fallback(owner_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        Self {
            execution_id: owner_id.clone(),
            owner_id,
            namespace: namespace.into(),
            correlation_id: None,
            started_at: Utc::now(),
        }
    }

    /// Use a specific execution id
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Use a specific correlation id (e.g. from an incoming request)
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Log event merged with its execution context
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
    pub module: Option<String>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub thread_id: String,
    pub thread_name: Option<String>,
    pub process_id: u32,
    pub exception: Option<String>,
    pub execution_id: String,
    pub owner_id: String,
    pub namespace: String,
    /// Never empty
    pub correlation_id: String,
    pub context_started_at: DateTime<Utc>,
    pub extra: BTreeMap<String, FieldValue>,
}

/// Marker key listing extra fields that had to be stringified
pub const SERIALIZATION_ERRORS_KEY: &str = "_serialization_errors";

impl EnrichedRecord {
    /// Serialize extras and stamp `created_at`
    ///
    /// Values JSON cannot hold are stored as their display string and
    /// their keys listed under [`SERIALIZATION_ERRORS_KEY`].
    pub fn into_storage_record(self) -> StorageRecord {
        let mut extra = serde_json::Map::new();
        let mut degraded = Vec::new();
        for (key, value) in self.extra {
            let json = value.to_json().unwrap_or_else(|_| {
                degraded.push(serde_json::Value::String(key.clone()));
                serde_json::Value::String(value.to_string())
            });
            extra.insert(key, json);
        }
        if !degraded.is_empty() {
            extra.insert(
                SERIALIZATION_ERRORS_KEY.to_string(),
                serde_json::Value::Array(degraded),
            );
        }

        StorageRecord {
            id: self.id,
            timestamp: self.timestamp,
            created_at: Utc::now().max(self.timestamp),
            level: self.level,
            logger: self.logger,
            message: self.message,
            module: self.module,
            function: self.function,
            file: self.file,
            line: self.line,
            thread_id: self.thread_id,
            thread_name: self.thread_name,
            process_id: self.process_id,
            exception: self.exception,
            execution_id: self.execution_id,
            owner_id: self.owner_id,
            namespace: self.namespace,
            correlation_id: self.correlation_id,
            extra: serde_json::Value::Object(extra).to_string(),
        }
    }
}

/// Persistence-ready record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Storage-assigned creation time, never before `timestamp`
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
    pub module: Option<String>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub thread_id: String,
    pub thread_name: Option<String>,
    pub process_id: u32,
    pub exception: Option<String>,
    pub execution_id: String,
    pub owner_id: String,
    pub namespace: String,
    pub correlation_id: String,
    /// Extra fields as a JSON object
    pub extra: String,
}

impl StorageRecord {
    /// Minimal record for an owner, stamped now
    ///
    /// Hosts that bypass the capture pipeline (imports, tests) build
    /// records with this.
    pub fn new(
        owner_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        let owner_id = owner_id.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            created_at: now,
            level,
            logger: "external".to_string(),
            message: message.into(),
            module: None,
            function: None,
            file: None,
            line: None,
            thread_id: String::new(),
            thread_name: None,
            process_id: std::process::id(),
            exception: None,
            execution_id: owner_id.clone(),
            owner_id,
            namespace: "default".to_string(),
            correlation_id: new_correlation_id(),
            extra: "{}".to_string(),
        }
    }

    /// Override the event timestamp, keeping `created_at >= timestamp`
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.created_at = self.created_at.max(timestamp);
        self
    }

    /// Set the execution id
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Event timestamp as microseconds since the Unix epoch
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }

    /// Parse the extra blob back into a JSON object
    ///
    /// Returns an empty map if the blob is not a JSON object.
    pub fn extra_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::from_str::<serde_json::Value>(&self.extra) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_field_value_json() {
        assert_eq!(FieldValue::from(3i64).to_json().unwrap(), serde_json::json!(3));
        assert_eq!(FieldValue::from("x").to_json().unwrap(), serde_json::json!("x"));
        assert!(FieldValue::F64(f64::NAN).to_json().is_err());
        assert!(FieldValue::F64(f64::INFINITY).to_json().is_err());
    }

    #[test]
    fn test_new_context_has_correlation() {
        let ctx = ExecutionContext::new("pipeline-1");
        assert_eq!(ctx.owner_id, "pipeline-1");
        assert!(ctx.correlation_id.is_some());
        assert_ne!(ctx.execution_id, ctx.owner_id);
    }

    #[test]
    fn test_fallback_context_has_no_correlation() {
        let ctx = ExecutionContext::fallback("system", "platform");
        assert!(ctx.correlation_id.is_none());
        assert_eq!(ctx.namespace, "platform");
    }

    #[test]
    fn test_storage_record_timestamp_invariant() {
        let future = Utc::now() + Duration::hours(1);
        let record = StorageRecord::new("o", LogLevel::Info, "m").with_timestamp(future);
        assert!(record.created_at >= record.timestamp);

        let past = Utc::now() - Duration::days(3);
        let record = StorageRecord::new("o", LogLevel::Info, "m").with_timestamp(past);
        assert!(record.created_at >= record.timestamp);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let record = StorageRecord::new("owner", LogLevel::Error, "boom")
            .with_correlation_id("corr-1");
        let bytes = postcard::to_allocvec(&record).unwrap();
        let decoded: StorageRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_event_builder() {
        let event = LogEvent::new("warn", "app.http", "slow request")
            .with_field("latency_ms", 812i64)
            .with_correlation_id("abc");
        assert_eq!(event.extra.len(), 1);
        assert_eq!(event.correlation_id.as_deref(), Some("abc"));
        assert_eq!(event.process_id, std::process::id());
    }
}
