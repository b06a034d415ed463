//! Trace-context propagation for connections that negotiated `otel`.

use ibp_protocol::TraceFields;
use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};
use opentelemetry::Context;

/// Lower-case hex ids of the span active in `cx`. Invalid ids are left out.
pub fn trace_fields(cx: &Context) -> TraceFields {
    let span = cx.span();
    let span_context = span.span_context();

    let trace_id = span_context.trace_id();
    let span_id = span_context.span_id();

    TraceFields {
        trace_id: (trace_id != TraceId::INVALID).then(|| trace_id.to_string()),
        span_id: (span_id != SpanId::INVALID).then(|| span_id.to_string()),
    }
}

pub fn current_trace_fields() -> TraceFields {
    trace_fields(&Context::current())
}
