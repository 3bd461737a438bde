//! Metrics and tracing setup for keel.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping.

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

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a keel node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Coordinator operation counters ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,
    pub kv_latency_secs: HistogramVec,

    // ── Replication RPC ──
    pub replications_sent: IntCounter,
    pub replications_received: IntCounter,

    // ── Gossip ──
    pub gossip_sent: IntCounter,
    pub gossip_received: IntCounter,
    pub membership_transitions: IntCounterVec,

    // ── Hinted handoff ──
    pub hints_stored: IntCounter,
    pub hints_delivered: IntCounter,
    pub hints_dropped: IntCounter,

    // ── Read repair ──
    pub read_repairs: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kv_puts = IntCounter::with_opts(Opts::new("keel_kv_puts_total", "KV PUT operations"))
            .expect("kv_puts counter");
        let kv_gets = IntCounter::with_opts(Opts::new("keel_kv_gets_total", "KV GET operations"))
            .expect("kv_gets counter");
        let kv_deletes =
            IntCounter::with_opts(Opts::new("keel_kv_deletes_total", "KV DELETE operations"))
                .expect("kv_deletes counter");

        let kv_latency_secs = HistogramVec::new(
            HistogramOpts::new("keel_kv_latency_seconds", "KV operation latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("kv_latency_secs histogram");

        let replications_sent = IntCounter::with_opts(Opts::new(
            "keel_replications_sent_total",
            "Outbound replica RPCs sent",
        ))
        .expect("replications_sent counter");
        let replications_received = IntCounter::with_opts(Opts::new(
            "keel_replications_received_total",
            "Inbound replica RPCs received",
        ))
        .expect("replications_received counter");

        let gossip_sent = IntCounter::with_opts(Opts::new(
            "keel_gossip_sent_total",
            "Gossip datagrams sent",
        ))
        .expect("gossip_sent counter");
        let gossip_received = IntCounter::with_opts(Opts::new(
            "keel_gossip_received_total",
            "Gossip datagrams received",
        ))
        .expect("gossip_received counter");

        let membership_transitions = IntCounterVec::new(
            Opts::new(
                "keel_membership_transitions_total",
                "Membership state transitions, by resulting state",
            ),
            &["to_state"],
        )
        .expect("membership_transitions counter vec");

        let hints_stored = IntCounter::with_opts(Opts::new(
            "keel_hints_stored_total",
            "Hints stored for hinted handoff",
        ))
        .expect("hints_stored counter");
        let hints_delivered = IntCounter::with_opts(Opts::new(
            "keel_hints_delivered_total",
            "Hints successfully delivered",
        ))
        .expect("hints_delivered counter");
        let hints_dropped = IntCounter::with_opts(Opts::new(
            "keel_hints_dropped_total",
            "Hints dropped by age, eviction, or attempt cap",
        ))
        .expect("hints_dropped counter");

        let read_repairs = IntCounter::with_opts(Opts::new(
            "keel_read_repairs_total",
            "Read repair passes triggered",
        ))
        .expect("read_repairs counter");

        registry
            .register(Box::new(kv_puts.clone()))
            .expect("register kv_puts");
        registry
            .register(Box::new(kv_gets.clone()))
            .expect("register kv_gets");
        registry
            .register(Box::new(kv_deletes.clone()))
            .expect("register kv_deletes");
        registry
            .register(Box::new(kv_latency_secs.clone()))
            .expect("register kv_latency_secs");
        registry
            .register(Box::new(replications_sent.clone()))
            .expect("register replications_sent");
        registry
            .register(Box::new(replications_received.clone()))
            .expect("register replications_received");
        registry
            .register(Box::new(gossip_sent.clone()))
            .expect("register gossip_sent");
        registry
            .register(Box::new(gossip_received.clone()))
            .expect("register gossip_received");
        registry
            .register(Box::new(membership_transitions.clone()))
            .expect("register membership_transitions");
        registry
            .register(Box::new(hints_stored.clone()))
            .expect("register hints_stored");
        registry
            .register(Box::new(hints_delivered.clone()))
            .expect("register hints_delivered");
        registry
            .register(Box::new(hints_dropped.clone()))
            .expect("register hints_dropped");
        registry
            .register(Box::new(read_repairs.clone()))
            .expect("register read_repairs");

        Self {
            registry,
            kv_puts,
            kv_gets,
            kv_deletes,
            kv_latency_secs,
            replications_sent,
            replications_received,
            gossip_sent,
            gossip_received,
            membership_transitions,
            hints_stored,
            hints_delivered,
            hints_dropped,
            read_repairs,
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

/// Helper: start a KV operation latency timer. Records on drop.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
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

        let before = m.kv_puts.get();
        m.kv_puts.inc();
        m.kv_puts.inc();
        assert_eq!(m.kv_puts.get(), before + 2);

        m.hints_stored.inc();
        m.read_repairs.inc();
        m.membership_transitions
            .with_label_values(&["suspect"])
            .inc();
        m.membership_transitions.with_label_values(&["dead"]).inc();
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().hints_delivered.inc();

        let output = encode_metrics();
        assert!(output.contains("keel_kv_puts_total"));
        assert!(output.contains("keel_hints_delivered_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_kv_timer_records() {
        let timer = start_kv_timer("test_op");
        drop(timer);

        let h = metrics().kv_latency_secs.with_label_values(&["test_op"]);
        assert!(h.get_sample_count() >= 1);
    }
}
