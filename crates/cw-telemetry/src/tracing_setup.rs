use uuid::Uuid;

/// Generate a trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Create a named span for a top-level operation, returning the span and its
/// trace ID for log correlation.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = create_child_span(&trace_id, operation);
    (span, trace_id)
}

/// Create a span under an existing trace ID.
pub fn create_child_span(trace_id: &str, operation: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    )
}

/// Span wrapping one firing of a task, including all of its attempts.
pub fn execution_span(task_id: &str) -> tracing::Span {
    let trace_id = generate_trace_id();
    tracing::info_span!("execution", task_id = %task_id, trace_id = %trace_id)
}
