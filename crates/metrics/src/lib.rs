//! Metrics and tracing setup for junta.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ---------------------------------------------------------------------------
// Prometheus metrics
// ---------------------------------------------------------------------------

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a junta node.
pub struct NodeMetrics {
    pub registry: Registry,

    // Peer messages
    pub messages_sent: IntCounter,
    pub messages_received: IntCounter,
    pub messages_sent_by_type: IntCounterVec,
    pub messages_received_by_type: IntCounterVec,
    pub messages_dropped: IntCounterVec,

    // Consensus
    pub proposals: IntCounter,
    pub decisions: IntCounter,
    pub ballot_retries: IntCounter,
    pub forwarded_proposals: IntCounter,
    pub decision_latency_secs: Histogram,

    // Store
    pub applied: IntCounter,
    pub applied_seqn: IntGauge,
    pub rejected_mutations: IntCounterVec,
    pub watch_events_delivered: IntCounter,
    pub watch_subscribers_dropped: IntCounter,

    // Client writes
    pub write_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for consensus and write latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("counter opts")
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &[label]).expect("counter vec opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let messages_sent = counter("junta_messages_sent_total", "Peer messages sent");
        let messages_received = counter("junta_messages_received_total", "Peer messages received");
        let messages_sent_by_type = counter_vec(
            "junta_messages_sent_by_type_total",
            "Peer messages sent, by type",
            "msg_type",
        );
        let messages_received_by_type = counter_vec(
            "junta_messages_received_by_type_total",
            "Peer messages received, by type",
            "msg_type",
        );
        let messages_dropped = counter_vec(
            "junta_messages_dropped_total",
            "Peer messages dropped before delivery, by reason",
            "reason",
        );

        let proposals = counter("junta_proposals_total", "Values submitted for consensus");
        let decisions = counter("junta_decisions_total", "Seqns decided");
        let ballot_retries = counter(
            "junta_ballot_retries_total",
            "Prepare rounds started with a higher ballot",
        );
        let forwarded_proposals = counter(
            "junta_forwarded_proposals_total",
            "Proposals forwarded to the leader",
        );
        let decision_latency_secs = Histogram::with_opts(
            HistogramOpts::new(
                "junta_decision_latency_seconds",
                "Time from opening an instance to its decision",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("decision_latency_secs histogram");

        let applied = counter("junta_applied_total", "Seqns applied to the store");
        let applied_seqn = IntGauge::with_opts(Opts::new(
            "junta_applied_seqn",
            "Highest seqn applied to the store",
        ))
        .expect("applied_seqn gauge");
        let rejected_mutations = counter_vec(
            "junta_rejected_mutations_total",
            "Decided mutations rejected at apply time, by reason",
            "reason",
        );
        let watch_events_delivered = counter(
            "junta_watch_events_delivered_total",
            "Events handed to watch subscribers",
        );
        let watch_subscribers_dropped = counter(
            "junta_watch_subscribers_dropped_total",
            "Watch subscribers disconnected for lagging or closing",
        );

        let write_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "junta_write_latency_seconds",
                "Client write latency from submit to apply, in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("write_latency_secs histogram");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(messages_sent.clone()),
            Box::new(messages_received.clone()),
            Box::new(messages_sent_by_type.clone()),
            Box::new(messages_received_by_type.clone()),
            Box::new(messages_dropped.clone()),
            Box::new(proposals.clone()),
            Box::new(decisions.clone()),
            Box::new(ballot_retries.clone()),
            Box::new(forwarded_proposals.clone()),
            Box::new(decision_latency_secs.clone()),
            Box::new(applied.clone()),
            Box::new(applied_seqn.clone()),
            Box::new(rejected_mutations.clone()),
            Box::new(watch_events_delivered.clone()),
            Box::new(watch_subscribers_dropped.clone()),
            Box::new(write_latency_secs.clone()),
        ];
        for c in collectors {
            registry.register(c).expect("register metric");
        }

        Self {
            registry,
            messages_sent,
            messages_received,
            messages_sent_by_type,
            messages_received_by_type,
            messages_dropped,
            proposals,
            decisions,
            ballot_retries,
            forwarded_proposals,
            decision_latency_secs,
            applied,
            applied_seqn,
            rejected_mutations,
            watch_events_delivered,
            watch_subscribers_dropped,
            write_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("prometheus encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Helper: start a client write latency timer. Returns a guard that
/// records elapsed time on drop.
pub fn start_write_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .write_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

/// Helper: count one peer message in the given direction.
pub fn record_message(msg_type: &str, outbound: bool) {
    let m = metrics();
    if outbound {
        m.messages_sent.inc();
        m.messages_sent_by_type.with_label_values(&[msg_type]).inc();
    } else {
        m.messages_received.inc();
        m.messages_received_by_type
            .with_label_values(&[msg_type])
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Metrics HTTP server
// ---------------------------------------------------------------------------

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")));
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(encode_metrics())))
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
