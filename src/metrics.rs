//! Prometheus metrics for the LightRAG engine and CLI.
//!
//! Exposes:
//! - `lightrag_llm_request_duration_seconds` (histogram) and
//!   `lightrag_llm_requests_total` (counter with status, `cached` for cache hits)
//! - `lightrag_insert_duration_seconds`, `lightrag_insert_total`,
//!   `lightrag_inserted_chunks_total`
//! - `lightrag_query_duration_seconds`, `lightrag_query_total` (by mode and status)
//! - `lightrag_command_*` for CLI subcommands
//! - process metrics via `process` collector

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec, Encoder, Histogram, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

// Exponential buckets from 50ms up to ~3 minutes.
fn duration_buckets() -> Vec<f64> {
    prometheus::exponential_buckets(0.05, 2.0, 14).expect("failed to create histogram buckets")
}

static LLM_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "lightrag_llm_request_duration_seconds",
        "LLM completion latency in seconds, retries included",
        duration_buckets()
    )
    .expect("failed to register llm duration histogram")
});

static LLM_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_llm_requests_total",
        "LLM completions by status",
        &["status"]
    )
    .expect("failed to register llm counter")
});

static INSERT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "lightrag_insert_duration_seconds",
        "Document insert duration in seconds",
        duration_buckets()
    )
    .expect("failed to register insert duration histogram")
});

static INSERT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_insert_total",
        "Insert calls by status",
        &["status"]
    )
    .expect("failed to register insert counter")
});

static INSERTED_CHUNKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lightrag_inserted_chunks_total",
        "Text chunks committed by insert"
    )
    .expect("failed to register inserted chunks counter")
});

static QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "lightrag_query_duration_seconds",
        "Query duration in seconds",
        &["mode"],
        duration_buckets()
    )
    .expect("failed to register query duration histogram")
});

static QUERY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_query_total",
        "Queries by mode and status",
        &["mode", "status"]
    )
    .expect("failed to register query counter")
});

static COMMAND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "lightrag_command_duration_seconds",
        "CLI command duration in seconds",
        &["command"],
        duration_buckets()
    )
    .expect("failed to register command duration histogram")
});

static COMMAND_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_command_total",
        "Total command executions by status",
        &["command", "status"]
    )
    .expect("failed to register command counter")
});

static COMMAND_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "lightrag_command_inflight",
        "Number of in-flight commands",
        &["command"]
    )
    .expect("failed to register inflight gauge")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&LLM_DURATION);
    Lazy::force(&LLM_TOTAL);
    Lazy::force(&INSERT_DURATION);
    Lazy::force(&INSERT_TOTAL);
    Lazy::force(&INSERTED_CHUNKS);
    Lazy::force(&QUERY_DURATION);
    Lazy::force(&QUERY_TOTAL);
    Lazy::force(&COMMAND_DURATION);
    Lazy::force(&COMMAND_TOTAL);
    Lazy::force(&COMMAND_INFLIGHT);
}

fn status_label(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "error"
    }
}

/// Record one LLM completion that went to the network.
pub fn record_llm_call(duration: Duration, success: bool) {
    init_collectors();
    LLM_DURATION.observe(duration.as_secs_f64());
    LLM_TOTAL.with_label_values(&[status_label(success)]).inc();
}

/// Record a completion answered from the response cache.
pub fn record_llm_cache_hit() {
    init_collectors();
    LLM_TOTAL.with_label_values(&["cached"]).inc();
}

/// Record an insert call and the chunks it committed.
pub fn record_insert(chunks: usize, duration: Duration, success: bool) {
    init_collectors();
    INSERT_DURATION.observe(duration.as_secs_f64());
    INSERT_TOTAL.with_label_values(&[status_label(success)]).inc();
    INSERTED_CHUNKS.inc_by(chunks as u64);
}

pub fn record_query(mode: &str, duration: Duration, success: bool) {
    init_collectors();
    QUERY_DURATION
        .with_label_values(&[mode])
        .observe(duration.as_secs_f64());
    QUERY_TOTAL
        .with_label_values(&[mode, status_label(success)])
        .inc();
}

/// Increment inflight gauge for a command.
pub fn record_command_start(command: &'static str) {
    init_collectors();
    COMMAND_INFLIGHT.with_label_values(&[command]).inc();
}

/// Record command completion with duration and status.
pub fn record_command_result(command: &'static str, duration: Duration, success: bool) {
    init_collectors();
    COMMAND_INFLIGHT.with_label_values(&[command]).dec();
    COMMAND_DURATION
        .with_label_values(&[command])
        .observe(duration.as_secs_f64());
    COMMAND_TOTAL
        .with_label_values(&[command, status_label(success)])
        .inc();
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn metrics_response() -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        return Ok(response(StatusCode::INTERNAL_SERVER_ERROR, "encode error"));
    }

    let mut ok = response(StatusCode::OK, buffer);
    if let Ok(content_type) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        ok.headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    Ok(ok)
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => metrics_response().await,
        _ => Ok(response(StatusCode::NOT_FOUND, Bytes::new())),
    }
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service_fn(handle_request);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(?peer, "Metrics connection error: {}", err);
            }
        });
    }
}

/// Spawn the metrics HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    init_collectors();
    tokio::spawn(async move {
        if let Err(err) = serve(addr).await {
            error!(%addr, "Metrics server failed: {}", err);
        }
    });
}
