//! Server-side interceptor chain.
//!
//! Requests flow through the stack from outermost to innermost:
//! `SetRequestId` → `PropagateRequestId` → Trace (span, trace context, call
//! metrics) → `CatchPanic` → routes.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroI32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use http_body_util::Empty;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tower::ServiceBuilder;
use tower::layer::util::{Identity, Stack};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::classify::{
    ClassifiedResponse, ClassifyEos, ClassifyResponse, GrpcFailureClass, MakeClassifier,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::Span;
use tracing::field::Empty as EmptyField;

use crate::trace_context;

const GRPC_STATUS: &str = "grpc-status";
/// `INTERNAL` in the gRPC status code table.
const GRPC_INTERNAL: &str = "13";
const CODE_CANCELLED: i32 = 1;
const CODE_UNKNOWN: i32 = 2;

/// Prometheus collectors for the calls served by one server.
///
/// Series are named after grpc-prometheus and carry the server's logical
/// `service` name as a constant label:
/// - `grpc_server_started_total{grpc_service, grpc_method}`
/// - `grpc_server_handled_total{grpc_service, grpc_method, grpc_code}`
/// - `grpc_server_handling_seconds{grpc_service, grpc_method}`
/// - `grpc_server_in_flight`
///
/// A call whose response is dropped before it completes is counted with
/// `grpc_code="1"` (`CANCELLED`).
#[derive(Debug, Clone)]
pub struct CallMetrics {
    registry: Registry,
    started: IntCounterVec,
    handled: IntCounterVec,
    handling: HistogramVec,
    in_flight: IntGauge,
}

impl CallMetrics {
    /// Create the collectors for `service` and register them in `registry`.
    ///
    /// # Errors
    /// Returns [`prometheus::Error::AlreadyReg`] if `registry` already holds
    /// the collectors of a server with the same `service` name.
    pub fn register(service: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let labels = HashMap::from([("service".to_owned(), service.to_owned())]);
        let started = IntCounterVec::new(
            Opts::new("grpc_server_started_total", "RPCs started on the server.")
                .const_labels(labels.clone()),
            &["grpc_service", "grpc_method"],
        )?;
        let handled = IntCounterVec::new(
            Opts::new(
                "grpc_server_handled_total",
                "RPCs completed on the server, regardless of success or failure.",
            )
            .const_labels(labels.clone()),
            &["grpc_service", "grpc_method", "grpc_code"],
        )?;
        let handling = HistogramVec::new(
            HistogramOpts::new(
                "grpc_server_handling_seconds",
                "Time until the server completed the RPC.",
            )
            .const_labels(labels.clone()),
            &["grpc_service", "grpc_method"],
        )?;
        let in_flight = IntGauge::with_opts(
            Opts::new("grpc_server_in_flight", "RPCs currently being handled.")
                .const_labels(labels),
        )?;

        registry.register(Box::new(started.clone()))?;
        registry.register(Box::new(handled.clone()))?;
        registry.register(Box::new(handling.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            started,
            handled,
            handling,
            in_flight,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Calls started for `path` (`/package.Service/Method`).
    #[must_use]
    pub fn started(&self, path: &str) -> u64 {
        let (service, method) = split_path(path);
        self.started
            .get_metric_with_label_values(&[service, method])
            .map_or(0, |counter| counter.get())
    }

    /// Calls for `path` that completed with gRPC status `code`.
    #[must_use]
    pub fn handled(&self, path: &str, code: i32) -> u64 {
        let (service, method) = split_path(path);
        let code = code.to_string();
        self.handled
            .get_metric_with_label_values(&[service, method, code.as_str()])
            .map_or(0, |counter| counter.get())
    }

    /// Latency observations recorded for `path`.
    #[must_use]
    pub fn handling_count(&self, path: &str) -> u64 {
        let (service, method) = split_path(path);
        self.handling
            .get_metric_with_label_values(&[service, method])
            .map_or(0, |histogram| histogram.get_sample_count())
    }

    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.get()
    }

    /// Every collector of the registry in the Prometheus text format.
    ///
    /// # Errors
    /// Returns an error if a collected family cannot be encoded.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// Split `/package.Service/Method` into its service and method parts.
fn split_path(path: &str) -> (&str, &str) {
    path.strip_prefix('/')
        .and_then(|rest| rest.split_once('/'))
        .filter(|(service, method)| !service.is_empty() && !method.is_empty())
        .unwrap_or(("unknown", "unknown"))
}

fn grpc_code(headers: &HeaderMap) -> Option<i32> {
    headers.get(GRPC_STATUS)?.to_str().ok()?.parse().ok()
}

/// One call's bookkeeping, shared by the classifier copies the trace layer
/// keeps. Whichever copy sees the outcome first records it.
#[derive(Debug)]
struct CallRecord {
    metrics: CallMetrics,
    service: String,
    method: String,
    started: Instant,
    finished: AtomicBool,
}

impl CallRecord {
    fn finish(&self, code: i32) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let code = code.to_string();
        let labels = [self.service.as_str(), self.method.as_str()];
        self.metrics.in_flight.dec();
        if let Ok(counter) = self.metrics.handled.get_metric_with_label_values(&[
            labels[0],
            labels[1],
            code.as_str(),
        ]) {
            counter.inc();
        }
        if let Ok(histogram) = self.metrics.handling.get_metric_with_label_values(&labels) {
            histogram.observe(self.started.elapsed().as_secs_f64());
        }
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        self.finish(CODE_CANCELLED);
    }
}

/// Classifies gRPC outcomes the way `GrpcErrorsAsFailures` does and records
/// each call in [`CallMetrics`] as it completes.
#[derive(Debug, Clone)]
pub struct CallClassifier {
    record: Arc<CallRecord>,
}

impl CallClassifier {
    fn complete(&self, code: i32) -> Result<(), GrpcFailureClass> {
        self.record.finish(code);
        NonZeroI32::new(code).map_or(Ok(()), |code| Err(GrpcFailureClass::Code(code)))
    }

    fn errored(&self, error: &dyn fmt::Display) -> GrpcFailureClass {
        self.record.finish(CODE_UNKNOWN);
        GrpcFailureClass::Error(error.to_string())
    }
}

impl MakeClassifier for CallMetrics {
    type Classifier = CallClassifier;
    type FailureClass = GrpcFailureClass;
    type ClassifyEos = CallClassifier;

    fn make_classifier<B>(&self, request: &http::Request<B>) -> CallClassifier {
        let (service, method) = split_path(request.uri().path());
        if let Ok(counter) = self.started.get_metric_with_label_values(&[service, method]) {
            counter.inc();
        }
        self.in_flight.inc();
        CallClassifier {
            record: Arc::new(CallRecord {
                metrics: self.clone(),
                service: service.to_owned(),
                method: method.to_owned(),
                started: Instant::now(),
                finished: AtomicBool::new(false),
            }),
        }
    }
}

impl ClassifyResponse for CallClassifier {
    type FailureClass = GrpcFailureClass;
    type ClassifyEos = Self;

    fn classify_response<B>(
        self,
        response: &http::Response<B>,
    ) -> ClassifiedResponse<GrpcFailureClass, Self> {
        // Trailers-only responses carry the status in the headers.
        match grpc_code(response.headers()) {
            Some(code) => ClassifiedResponse::Ready(self.complete(code)),
            None => ClassifiedResponse::RequiresEos(self),
        }
    }

    fn classify_error<E>(self, error: &E) -> GrpcFailureClass
    where
        E: fmt::Display + 'static,
    {
        self.errored(error)
    }
}

impl ClassifyEos for CallClassifier {
    type FailureClass = GrpcFailureClass;

    fn classify_eos(self, trailers: Option<&HeaderMap>) -> Result<(), GrpcFailureClass> {
        // A stream that ends without a status is treated as `OK`.
        self.complete(trailers.and_then(grpc_code).unwrap_or(0))
    }

    fn classify_error<E>(self, error: &E) -> GrpcFailureClass
    where
        E: fmt::Display + 'static,
    {
        self.errored(error)
    }
}

/// Span factory and call logger plugged into the trace layer.
#[derive(Debug, Clone)]
pub struct CallObserver {
    service: Arc<str>,
}

impl CallObserver {
    #[must_use]
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
        }
    }
}

impl<B> MakeSpan<B> for CallObserver {
    fn make_span(&mut self, request: &http::Request<B>) -> Span {
        let headers = request.headers();
        let span = tracing::info_span!(
            "grpc_request",
            service = %self.service,
            method = %request.uri().path(),
            request_id = headers
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("n/a"),
            trace_id = EmptyField,
            grpc_status = EmptyField,
            latency_ms = EmptyField,
        );
        trace_context::set_parent_from_headers(&span, headers);
        span
    }
}

impl<B> OnRequest<B> for CallObserver {
    fn on_request(&mut self, _request: &http::Request<B>, span: &Span) {
        tracing::trace!(parent: span, "gRPC call started");
    }
}

impl<B> OnResponse<B> for CallObserver {
    fn on_response(self, response: &http::Response<B>, latency: Duration, span: &Span) {
        span.record("latency_ms", u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        if let Some(code) = grpc_code(response.headers()) {
            span.record("grpc_status", code);
        }
        tracing::debug!(parent: span, "gRPC call finished");
    }
}

impl OnFailure<GrpcFailureClass> for CallObserver {
    fn on_failure(&mut self, failure: GrpcFailureClass, _latency: Duration, span: &Span) {
        tracing::warn!(parent: span, %failure, "gRPC call failed");
    }
}

/// Turn a handler panic into a trailers-only `INTERNAL` response.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> http::Response<Empty<Bytes>> {
    let detail = match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => panic
            .downcast::<&str>()
            .map_or_else(|_| "unknown panic payload".to_owned(), |message| (*message).to_owned()),
    };
    tracing::error!(panic = %detail, "gRPC handler panicked");

    let mut response = http::Response::new(Empty::new());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert(GRPC_STATUS, HeaderValue::from_static(GRPC_INTERNAL));
    headers.insert("grpc-message", HeaderValue::from_static("handler%20panicked"));
    response
}

type PanicHandler = fn(Box<dyn Any + Send + 'static>) -> http::Response<Empty<Bytes>>;

/// The layer stack returned by [`interceptors`].
pub type InterceptorStack = Stack<
    CatchPanicLayer<PanicHandler>,
    Stack<
        TraceLayer<
            CallMetrics,
            CallObserver,
            CallObserver,
            CallObserver,
            DefaultOnBodyChunk,
            DefaultOnEos,
            CallObserver,
        >,
        Stack<PropagateRequestIdLayer, Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>>,
    >,
>;

/// Build the interceptor chain for a server named `service`.
#[must_use]
pub fn interceptors(service: &str, metrics: CallMetrics) -> ServiceBuilder<InterceptorStack> {
    let observer = CallObserver::new(service);
    ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new(metrics)
                .make_span_with(observer.clone())
                .on_request(observer.clone())
                .on_response(observer.clone())
                .on_failure(observer),
        )
        .layer(CatchPanicLayer::custom(panic_response as PanicHandler))
}
