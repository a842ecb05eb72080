//! Prometheus metrics for the k2mm node.
//!
//! This module provides:
//! - Metrics registry with counters and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k2mm_core::{EngineStats, LatencySample};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Round-trip time buckets (in seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1,
];

/// Engine tick buckets.
const TICK_BUCKETS: &[f64] = &[8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 4096.0];

/// Prometheus metrics for the k2mm node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Datagrams received from the socket.
    pub frames_rx_total: IntCounter,
    /// Datagrams sent to the socket.
    pub frames_tx_total: IntCounter,
    /// Frames dropped, by reason.
    pub frames_dropped_total: CounterVec,
    /// Probe responses received.
    pub probe_replies_total: IntCounter,
    /// Test frames that failed the pattern check.
    pub test_errors_total: IntCounter,
    /// Latency tests whose frame never returned.
    pub tests_lost_total: IntCounter,
    /// Latency test round trips in engine ticks.
    pub latency_ticks: Histogram,
    /// Latency test round trips in wall-clock seconds.
    pub latency_seconds: Histogram,
    /// Bytes received.
    pub bytes_rx_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_rx_total = IntCounter::with_opts(Opts::new(
            "k2mm_frames_rx_total",
            "Total datagrams received",
        ))?;
        registry.register(Box::new(frames_rx_total.clone()))?;

        let frames_tx_total = IntCounter::with_opts(Opts::new(
            "k2mm_frames_tx_total",
            "Total datagrams sent",
        ))?;
        registry.register(Box::new(frames_tx_total.clone()))?;

        let frames_dropped_total = CounterVec::new(
            Opts::new("k2mm_frames_dropped_total", "Total frames dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        let probe_replies_total = IntCounter::with_opts(Opts::new(
            "k2mm_probe_replies_total",
            "Total probe responses received",
        ))?;
        registry.register(Box::new(probe_replies_total.clone()))?;

        let test_errors_total = IntCounter::with_opts(Opts::new(
            "k2mm_test_errors_total",
            "Total test frames failing the pattern check",
        ))?;
        registry.register(Box::new(test_errors_total.clone()))?;

        let tests_lost_total = IntCounter::with_opts(Opts::new(
            "k2mm_tests_lost_total",
            "Total latency tests abandoned without a returned frame",
        ))?;
        registry.register(Box::new(tests_lost_total.clone()))?;

        let latency_ticks = Histogram::with_opts(
            HistogramOpts::new("k2mm_latency_ticks", "Latency test round trip in engine ticks")
                .buckets(TICK_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(latency_ticks.clone()))?;

        let latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "k2mm_latency_seconds",
                "Latency test round trip in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        let bytes_rx_total = Counter::with_opts(Opts::new(
            "k2mm_bytes_rx_total",
            "Total bytes received",
        ))?;
        registry.register(Box::new(bytes_rx_total.clone()))?;

        Ok(Self {
            registry,
            frames_rx_total,
            frames_tx_total,
            frames_dropped_total,
            probe_replies_total,
            test_errors_total,
            tests_lost_total,
            latency_ticks,
            latency_seconds,
            bytes_rx_total,
        })
    }

    /// Records one latency sample; `elapsed` is the wall-clock round trip.
    pub fn observe_latency(&self, sample: &LatencySample, elapsed: std::time::Duration) {
        if sample.is_lost() {
            self.tests_lost_total.inc();
            return;
        }
        self.latency_ticks.observe(sample.elapsed_ticks as f64);
        self.latency_seconds.observe(elapsed.as_secs_f64());
        if sample.error {
            self.test_errors_total.inc();
        }
    }

    /// Brings the drop counters up to date with an engine snapshot.
    pub fn sync_engine(&self, previous: &EngineStats, current: &EngineStats) {
        let deltas = [
            (
                "ingress_full",
                current.datagrams_dropped - previous.datagrams_dropped,
            ),
            (
                "bad_magic",
                current.framing.frames_dropped - previous.framing.frames_dropped,
            ),
            (
                "truncated",
                current.framing.frames_truncated - previous.framing.frames_truncated,
            ),
            (
                "empty",
                current.framing.frames_empty - previous.framing.frames_empty,
            ),
            (
                "unroutable",
                current.frames_discarded - previous.frames_discarded,
            ),
            (
                "bad_record",
                current.bridge.records_dropped - previous.bridge.records_dropped,
            ),
        ];
        for (reason, delta) in deltas {
            if delta > 0 {
                self.frames_dropped_total
                    .with_label_values(&[reason])
                    .inc_by(delta as f64);
            }
        }

        let replies = current.probe.replies_received - previous.probe.replies_received;
        self.probe_replies_total.inc_by(replies);
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
