//! W3C trace context propagation across gRPC calls.
//!
//! With the `otel` feature the global `opentelemetry` propagator extracts the
//! caller's context into the server span and injects the current context into
//! outgoing requests. Without it, the server span still records the caller's
//! trace id for log correlation and nothing is injected.

use http::HeaderMap;

/// W3C trace context header.
pub const TRACEPARENT: &str = "traceparent";

#[must_use]
pub fn get_traceparent(headers: &HeaderMap) -> Option<&str> {
    headers.get(TRACEPARENT)?.to_str().ok()
}

/// Trace id of a version `00` traceparent (`00-{trace_id}-{span_id}-{flags}`).
#[must_use]
pub fn parse_trace_id(traceparent: &str) -> Option<&str> {
    let mut parts = traceparent.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;
    let well_formed = version == "00"
        && trace_id.len() == 32
        && span_id.len() == 16
        && flags.len() == 2
        && trace_id.bytes().all(|b| b.is_ascii_hexdigit());
    well_formed.then_some(trace_id)
}

fn record_trace_id(span: &tracing::Span, headers: &HeaderMap) {
    if let Some(trace_id) = get_traceparent(headers).and_then(parse_trace_id) {
        span.record("trace_id", trace_id);
    }
}

#[cfg(feature = "otel")]
mod imp {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use opentelemetry::propagation::{Extractor, Injector};
    use opentelemetry::{Context, global};
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    struct HeadersExtractor<'a>(&'a HeaderMap);

    impl Extractor for HeadersExtractor<'_> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).and_then(|v| v.to_str().ok())
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(HeaderName::as_str).collect()
        }
    }

    struct HeadersInjector<'a>(&'a mut HeaderMap);

    impl Injector for HeadersInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                self.0.insert(name, value);
            }
        }
    }

    /// Write the current span's context into `headers`.
    pub fn inject_current_span(headers: &mut HeaderMap) {
        let cx = Span::current().context();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut HeadersInjector(headers));
        });
    }

    /// Make the caller's context in `headers` the parent of `span`.
    pub fn set_parent_from_headers(span: &Span, headers: &HeaderMap) {
        let parent: Context =
            global::get_text_map_propagator(|propagator| propagator.extract(&HeadersExtractor(headers)));
        if let Err(e) = span.set_parent(parent) {
            tracing::trace!(error = %e, "trace context not attached");
        }
        super::record_trace_id(span, headers);
    }
}

#[cfg(not(feature = "otel"))]
mod imp {
    use http::HeaderMap;
    use tracing::Span;

    /// No-op without the `otel` feature.
    pub fn inject_current_span(_headers: &mut HeaderMap) {}

    /// Records the caller's trace id; the span keeps its local parent.
    pub fn set_parent_from_headers(span: &Span, headers: &HeaderMap) {
        super::record_trace_id(span, headers);
    }
}

pub use imp::{inject_current_span, set_parent_from_headers};

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn headers_with_parent() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT, PARENT.parse().unwrap());
        headers
    }

    #[test]
    fn test_get_traceparent() {
        assert!(get_traceparent(&HeaderMap::new()).is_none());
        assert_eq!(get_traceparent(&headers_with_parent()), Some(PARENT));
    }

    #[test]
    fn test_parse_trace_id() {
        assert_eq!(parse_trace_id(PARENT), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
        assert!(parse_trace_id("invalid").is_none());
        assert!(parse_trace_id("").is_none());
        assert!(parse_trace_id("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_trace_id("00-xyz-00f067aa0ba902b7-01").is_none());
    }

    #[test]
    fn test_set_parent_without_subscriber_does_not_panic() {
        let span = tracing::info_span!("call", trace_id = tracing::field::Empty);
        set_parent_from_headers(&span, &headers_with_parent());
        set_parent_from_headers(&span, &HeaderMap::new());
    }

    #[test]
    #[cfg(not(feature = "otel"))]
    fn test_inject_is_noop() {
        let mut headers = HeaderMap::new();
        inject_current_span(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    #[cfg(feature = "otel")]
    fn test_parent_context_crosses_the_call() {
        use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
        use opentelemetry_sdk::propagation::TraceContextPropagator;
        use opentelemetry_sdk::trace::SdkTracerProvider;
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        use tracing_subscriber::layer::SubscriberExt;

        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("trace-context-test")));

        tracing::subscriber::with_default(subscriber, || {
            let server_span = tracing::info_span!("call", trace_id = tracing::field::Empty);
            set_parent_from_headers(&server_span, &headers_with_parent());
            let cx = server_span.context();
            assert_eq!(
                cx.span().span_context().trace_id().to_string(),
                "4bf92f3577b34da6a3ce929d0e0e4736"
            );

            let _entered = server_span.enter();
            let mut outgoing = HeaderMap::new();
            inject_current_span(&mut outgoing);
            let forwarded = get_traceparent(&outgoing).unwrap();
            assert_eq!(parse_trace_id(forwarded), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
        });
    }
}
