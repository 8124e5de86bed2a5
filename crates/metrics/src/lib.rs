//! Metrics and tracing setup for silo serving nodes.
//!
//! Provides a global [`ServerMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<ServerMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static ServerMetrics {
    METRICS.get_or_init(ServerMetrics::new)
}

/// All Prometheus metrics for a silo node.
pub struct ServerMetrics {
    pub registry: Registry,

    // ── Request counters ──
    pub requests_received: IntCounter,
    pub requests_by_api: IntCounterVec,
    pub request_latency_secs: HistogramVec,

    // ── Cache ──
    pub cache_key_hits: IntCounter,
    pub cache_key_misses: IntCounter,

    // ── Data loading ──
    pub delta_files_loaded: IntCounter,
    pub delta_records_loaded: IntCounter,
    pub delta_callback_failures: IntCounter,
    pub delta_corrupt_regions: IntCounter,

    // ── Lookup fabric ──
    pub remote_lookups_sent: IntCounter,
    pub remote_lookup_failures: IntCounter,
    pub sharded_lookup_keys: IntCounterVec,

    // ── UDF ──
    pub udf_executions: IntCounter,
    pub udf_execution_failures: IntCounter,
    pub udf_timeouts: IntCounter,
    pub udf_code_updates: IntCounter,
    pub udf_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for request/UDF latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 60.0];

impl ServerMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let requests_received = IntCounter::with_opts(Opts::new(
            "silo_requests_received_total",
            "Total inbound requests received",
        ))
        .expect("requests_received counter");

        let requests_by_api = IntCounterVec::new(
            Opts::new("silo_requests_by_api_total", "Inbound requests, by API"),
            &["api"],
        )
        .expect("requests_by_api counter vec");

        let request_latency_secs = HistogramVec::new(
            HistogramOpts::new("silo_request_latency_seconds", "Request latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["api"],
        )
        .expect("request_latency_secs histogram");

        let cache_key_hits = IntCounter::with_opts(Opts::new(
            "silo_cache_key_hits_total",
            "Cache lookups that found at least one key",
        ))
        .expect("cache_key_hits counter");
        let cache_key_misses = IntCounter::with_opts(Opts::new(
            "silo_cache_key_misses_total",
            "Cache lookups that found no keys",
        ))
        .expect("cache_key_misses counter");

        let delta_files_loaded = IntCounter::with_opts(Opts::new(
            "silo_delta_files_loaded_total",
            "Delta files fully ingested",
        ))
        .expect("delta_files_loaded counter");
        let delta_records_loaded = IntCounter::with_opts(Opts::new(
            "silo_delta_records_loaded_total",
            "Delta records applied to the cache",
        ))
        .expect("delta_records_loaded counter");
        let delta_callback_failures = IntCounter::with_opts(Opts::new(
            "silo_delta_callback_failures_total",
            "Record callbacks that returned an error during ingest",
        ))
        .expect("delta_callback_failures counter");
        let delta_corrupt_regions = IntCounter::with_opts(Opts::new(
            "silo_delta_corrupt_regions_total",
            "Corrupted delta file regions skipped during reading",
        ))
        .expect("delta_corrupt_regions counter");

        let remote_lookups_sent = IntCounter::with_opts(Opts::new(
            "silo_remote_lookups_sent_total",
            "Remote lookup RPCs sent to peer shards",
        ))
        .expect("remote_lookups_sent counter");
        let remote_lookup_failures = IntCounter::with_opts(Opts::new(
            "silo_remote_lookup_failures_total",
            "Remote lookup RPCs that failed",
        ))
        .expect("remote_lookup_failures counter");

        let sharded_lookup_keys = IntCounterVec::new(
            Opts::new(
                "silo_sharded_lookup_keys_total",
                "Keys routed by the sharded lookup, by destination",
            ),
            &["destination"],
        )
        .expect("sharded_lookup_keys counter vec");

        let udf_executions = IntCounter::with_opts(Opts::new(
            "silo_udf_executions_total",
            "UDF invocations submitted",
        ))
        .expect("udf_executions counter");
        let udf_execution_failures = IntCounter::with_opts(Opts::new(
            "silo_udf_execution_failures_total",
            "UDF invocations that returned an error",
        ))
        .expect("udf_execution_failures counter");
        let udf_timeouts = IntCounter::with_opts(Opts::new(
            "silo_udf_timeouts_total",
            "UDF invocations that exceeded the execution timeout",
        ))
        .expect("udf_timeouts counter");
        let udf_code_updates = IntCounter::with_opts(Opts::new(
            "silo_udf_code_updates_total",
            "UDF code objects accepted",
        ))
        .expect("udf_code_updates counter");

        let udf_latency_secs = HistogramVec::new(
            HistogramOpts::new("silo_udf_latency_seconds", "UDF execution latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["outcome"],
        )
        .expect("udf_latency_secs histogram");

        // Register all metrics
        registry
            .register(Box::new(requests_received.clone()))
            .expect("register requests_received");
        registry
            .register(Box::new(requests_by_api.clone()))
            .expect("register requests_by_api");
        registry
            .register(Box::new(request_latency_secs.clone()))
            .expect("register request_latency_secs");
        registry
            .register(Box::new(cache_key_hits.clone()))
            .expect("register cache_key_hits");
        registry
            .register(Box::new(cache_key_misses.clone()))
            .expect("register cache_key_misses");
        registry
            .register(Box::new(delta_files_loaded.clone()))
            .expect("register delta_files_loaded");
        registry
            .register(Box::new(delta_records_loaded.clone()))
            .expect("register delta_records_loaded");
        registry
            .register(Box::new(delta_callback_failures.clone()))
            .expect("register delta_callback_failures");
        registry
            .register(Box::new(delta_corrupt_regions.clone()))
            .expect("register delta_corrupt_regions");
        registry
            .register(Box::new(remote_lookups_sent.clone()))
            .expect("register remote_lookups_sent");
        registry
            .register(Box::new(remote_lookup_failures.clone()))
            .expect("register remote_lookup_failures");
        registry
            .register(Box::new(sharded_lookup_keys.clone()))
            .expect("register sharded_lookup_keys");
        registry
            .register(Box::new(udf_executions.clone()))
            .expect("register udf_executions");
        registry
            .register(Box::new(udf_execution_failures.clone()))
            .expect("register udf_execution_failures");
        registry
            .register(Box::new(udf_timeouts.clone()))
            .expect("register udf_timeouts");
        registry
            .register(Box::new(udf_code_updates.clone()))
            .expect("register udf_code_updates");
        registry
            .register(Box::new(udf_latency_secs.clone()))
            .expect("register udf_latency_secs");

        Self {
            registry,
            requests_received,
            requests_by_api,
            request_latency_secs,
            cache_key_hits,
            cache_key_misses,
            delta_files_loaded,
            delta_records_loaded,
            delta_callback_failures,
            delta_corrupt_regions,
            remote_lookups_sent,
            remote_lookup_failures,
            sharded_lookup_keys,
            udf_executions,
            udf_execution_failures,
            udf_timeouts,
            udf_code_updates,
            udf_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a request latency timer for an API. Returns a guard that
/// records elapsed time on drop.
pub fn start_api_timer(api: &str) -> prometheus::HistogramTimer {
    metrics()
        .request_latency_secs
        .with_label_values(&[api])
        .start_timer()
}

/// Helper: count one inbound request for an API.
pub fn count_request(api: &str) {
    let m = metrics();
    m.requests_received.inc();
    m.requests_by_api.with_label_values(&[api]).inc();
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.requests_received.get();
        count_request("v1_get_values");
        count_request("v2_get_values");
        assert_eq!(m.requests_received.get(), before + 2);

        m.cache_key_hits.inc();
        m.delta_records_loaded.inc();
        m.udf_executions.inc();

        m.sharded_lookup_keys.with_label_values(&["local"]).inc();
        m.sharded_lookup_keys.with_label_values(&["remote"]).inc();
    }

    #[test]
    fn test_encode_metrics_format() {
        // Ensure at least one counter is incremented
        metrics().delta_files_loaded.inc();

        let output = encode_metrics();
        assert!(output.contains("silo_requests_received_total"));
        assert!(output.contains("silo_delta_files_loaded_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_latency_timer_records() {
        let m = metrics();
        {
            let _timer = start_api_timer("test_api");
        }
        let h = m.request_latency_secs.with_label_values(&["test_api"]);
        assert!(h.get_sample_count() >= 1);
    }
}
