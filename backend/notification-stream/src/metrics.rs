use std::rc::Rc;
use std::time::{Duration, Instant};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "notification_stream_http_requests_total",
            "Total HTTP requests handled by notification-stream",
        ),
        &["method", "route", "status"],
    )
    .expect("failed to create notification_stream_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register notification_stream_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "notification_stream_http_request_duration_seconds",
            "HTTP request latency for notification-stream",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "route", "status"],
    )
    .expect("failed to create notification_stream_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register notification_stream_http_request_duration_seconds");
    histogram
});

static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "notification_stream_active_connections",
        "Client streams currently registered",
    )
    .expect("failed to create notification_stream_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register notification_stream_active_connections");
    gauge
});

static EVENTS_DELIVERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "notification_stream_events_delivered_total",
            "Stream events successfully written to a client sink",
        ),
        &["event_type"],
    )
    .expect("failed to create notification_stream_events_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register notification_stream_events_delivered_total");
    counter
});

static DELIVERY_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "notification_stream_delivery_failures_total",
            "Stream event writes rejected by a client sink",
        ),
        &["event_type"],
    )
    .expect("failed to create notification_stream_delivery_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register notification_stream_delivery_failures_total");
    counter
});

static EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "notification_stream_evictions_total",
        "Connections evicted by the liveness monitor",
    )
    .expect("failed to create notification_stream_evictions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register notification_stream_evictions_total");
    counter
});

static ENCODE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "notification_stream_encode_failures_total",
        "Stream events replaced by an error envelope at the codec boundary",
    )
    .expect("failed to create notification_stream_encode_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register notification_stream_encode_failures_total");
    counter
});

pub fn observe_http_request(method: &str, route: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, route, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, route, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn set_active_connections(count: usize) {
    ACTIVE_CONNECTIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn active_connections() -> i64 {
    ACTIVE_CONNECTIONS.get()
}

pub fn record_deliveries(event_type: &str, delivered: usize, failed: usize) {
    if delivered > 0 {
        EVENTS_DELIVERED_TOTAL
            .with_label_values(&[event_type])
            .inc_by(delivered as u64);
    }
    if failed > 0 {
        DELIVERY_FAILURES_TOTAL
            .with_label_values(&[event_type])
            .inc_by(failed as u64);
    }
}

pub fn record_evictions(count: usize) {
    EVICTIONS_TOTAL.inc_by(count as u64);
}

pub fn record_encode_failure() {
    ENCODE_FAILURES_TOTAL.inc();
}

/// Prometheus text exposition of the default registry
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Label used for requests that matched no route
const UNMATCHED_ROUTE: &str = "unmatched";

/// Records request count and latency per route pattern
///
/// Requests to paths in `skip` are passed through unrecorded.
/// Stream requests are timed until the response head is produced, not for
/// the lifetime of the body.
#[derive(Clone)]
pub struct MetricsMiddleware {
    skip: Rc<[&'static str]>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::skipping(&["/health", "/metrics"])
    }

    pub fn skipping(paths: &[&'static str]) -> Self {
        Self {
            skip: paths.into(),
        }
    }
}

impl Default for MetricsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
            skip: self.skip.clone(),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
    skip: Rc<[&'static str]>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        if self.skip.iter().any(|path| *path == req.path()) {
            return Box::pin(async move { service.call(req).await });
        }

        // Per-user paths collapse into their pattern
        let route = req
            .match_pattern()
            .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.as_response_error().status_code(),
            };
            observe_http_request(&method, &route, status.as_u16(), start.elapsed());
            result
        })
    }
}
