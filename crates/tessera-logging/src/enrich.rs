//! Merge raw events with their execution context

use uuid::Uuid;

use tessera_core::{EnrichedRecord, ExecutionContext, LogEvent, LogLevel, new_correlation_id};

/// Combine an event with the context it was emitted under
///
/// Total: every event yields a record. The correlation id is taken from
/// the event, then the context, and generated if neither has one.
pub fn enrich(event: LogEvent, context: &ExecutionContext) -> EnrichedRecord {
    let correlation_id = non_empty(event.correlation_id)
        .or_else(|| non_empty(context.correlation_id.clone()))
        .unwrap_or_else(new_correlation_id);

    EnrichedRecord {
        id: Uuid::new_v4().to_string(),
        timestamp: event.timestamp,
        level: LogLevel::normalize(&event.level),
        logger: event.logger,
        message: event.message,
        module: event.module,
        function: event.function,
        file: event.file,
        line: event.line,
        thread_id: event.thread_id,
        thread_name: event.thread_name,
        process_id: event.process_id,
        exception: event.exception,
        execution_id: context.execution_id.clone(),
        owner_id: context.owner_id.clone(),
        namespace: context.namespace.clone(),
        correlation_id,
        context_started_at: context.started_at,
        extra: event.extra,
    }
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{FieldValue, SERIALIZATION_ERRORS_KEY};

    fn event() -> LogEvent {
        LogEvent::new("warn", "app.step", "slow query")
    }

    #[test]
    fn test_context_fields_attached() {
        let ctx = ExecutionContext::new("pipeline-9").with_namespace("tenant-a");
        let record = enrich(event(), &ctx);

        assert_eq!(record.level, LogLevel::Warning);
        assert_eq!(record.owner_id, "pipeline-9");
        assert_eq!(record.namespace, "tenant-a");
        assert_eq!(record.execution_id, ctx.execution_id);
        assert_eq!(Some(&record.correlation_id), ctx.correlation_id.as_ref());
        assert_eq!(record.context_started_at, ctx.started_at);
    }

    #[test]
    fn test_event_correlation_wins() {
        let ctx = ExecutionContext::new("p").with_correlation_id("from-context");
        let record = enrich(event().with_correlation_id("from-event"), &ctx);
        assert_eq!(record.correlation_id, "from-event");
    }

    #[test]
    fn test_correlation_always_present() {
        let ctx = ExecutionContext::fallback("system", "default");
        let a = enrich(event(), &ctx);
        let b = enrich(event().with_correlation_id("  "), &ctx);
        assert!(!a.correlation_id.is_empty());
        assert!(!b.correlation_id.is_empty());
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_record_ids_unique() {
        let ctx = ExecutionContext::new("p");
        assert_ne!(enrich(event(), &ctx).id, enrich(event(), &ctx).id);
    }

    #[test]
    fn test_storage_record_extras() {
        let ctx = ExecutionContext::new("p");
        let record = enrich(
            event()
                .with_field("rows", 42i64)
                .with_field("ratio", f64::NAN)
                .with_field("table", "orders"),
            &ctx,
        )
        .into_storage_record();

        let extra = record.extra_fields();
        assert_eq!(extra["rows"], serde_json::json!(42));
        assert_eq!(extra["table"], serde_json::json!("orders"));
        assert_eq!(extra["ratio"], serde_json::json!("NaN"));
        assert_eq!(extra[SERIALIZATION_ERRORS_KEY], serde_json::json!(["ratio"]));
        assert!(record.created_at >= record.timestamp);
    }

    #[test]
    fn test_clean_extras_have_no_marker() {
        let ctx = ExecutionContext::new("p");
        let record = enrich(event().with_field("ok", FieldValue::Bool(true)), &ctx)
            .into_storage_record();
        assert!(!record.extra_fields().contains_key(SERIALIZATION_ERRORS_KEY));
    }
}
