//! Prometheus-compatible metrics for hctunnel.
//!
//! The registry is hand-rolled: plain atomics and mutex-guarded label maps
//! rendered into the text exposition format by [`Metrics::to_prometheus`].
//! Every recording call is cheap and safe for concurrent use; components
//! take an `Option<Arc<Metrics>>` and skip recording when metrics are
//! disabled.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::bridge::{bridge, BridgeStats};
use crate::dial::{dial_with_timeout, WsConn};

const NAMESPACE: &str = "hctunnel";

/// Target label used once the unique-target cap is exceeded.
pub const OVERFLOW_TARGET: &str = "__other__";

pub const REASON_DIAL_FAILED: &str = "dial_failed";
pub const REASON_DIAL_TIMEOUT: &str = "dial_timeout";
pub const REASON_RELAY_FAILED: &str = "relay_failed";
pub const REASON_ENVELOPE_ERROR: &str = "envelope_error";
pub const REASON_ALLOWLIST_REJECTED: &str = "allowlist_rejected";

const CONNECTION_DURATION_BUCKETS: &[f64] =
    &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];
const DIAL_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

struct Histogram {
    buckets: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, v: f64) {
        for (i, b) in self.buckets.iter().enumerate() {
            if v <= *b {
                self.counts[i] += 1;
            }
        }
        self.sum += v;
        self.count += 1;
    }
}

/// Metric registry for one process.
pub struct Metrics {
    /// Maximum number of unique target label values; zero means unlimited.
    max_targets: usize,

    connections_total: Mutex<BTreeMap<(String, String, String), u64>>,
    connection_errors: Mutex<BTreeMap<(String, String), u64>>,
    bytes_total: Mutex<BTreeMap<(String, String, String), u64>>,
    active_connections: Mutex<BTreeMap<(String, String), i64>>,
    control_channel_up: AtomicU64,
    connection_duration: Mutex<BTreeMap<(String, String), Histogram>>,
    dial_duration: Mutex<BTreeMap<String, Histogram>>,
    dial_retries_total: Mutex<BTreeMap<String, u64>>,

    targets: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Metrics {
    pub fn new(max_targets: usize) -> Arc<Self> {
        Arc::new(Self {
            max_targets,
            connections_total: Mutex::new(BTreeMap::new()),
            connection_errors: Mutex::new(BTreeMap::new()),
            bytes_total: Mutex::new(BTreeMap::new()),
            active_connections: Mutex::new(BTreeMap::new()),
            control_channel_up: AtomicU64::new(0),
            connection_duration: Mutex::new(BTreeMap::new()),
            dial_duration: Mutex::new(BTreeMap::new()),
            dial_retries_total: Mutex::new(BTreeMap::new()),
            targets: Mutex::new(HashSet::new()),
        })
    }

    /// Returns `target` if it fits the cardinality budget, the overflow
    /// sentinel once the cap is reached. Targets seen before the cap always
    /// map to themselves.
    pub fn sanitize_target(&self, target: &str) -> String {
        if self.max_targets == 0 {
            return target.to_string();
        }
        let mut targets = lock(&self.targets);
        if targets.contains(target) {
            return target.to_string();
        }
        if targets.len() >= self.max_targets {
            return OVERFLOW_TARGET.to_string();
        }
        targets.insert(target.to_string());
        target.to_string()
    }

    /// Marks a bridge as started and returns a tracker that records the
    /// outcome when the connection ends.
    pub fn connection_opened(self: &Arc<Self>, role: &str, target: &str) -> ConnectionTracker {
        let target = self.sanitize_target(target);
        *lock(&self.active_connections)
            .entry((role.to_string(), target.clone()))
            .or_insert(0) += 1;
        ConnectionTracker {
            metrics: Arc::clone(self),
            role: role.to_string(),
            target,
        }
    }

    /// Records a connection failure that never reached the bridge.
    pub fn connection_error(&self, role: &str, reason: &str) {
        *lock(&self.connection_errors)
            .entry((role.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    pub fn observe_dial_duration(&self, role: &str, seconds: f64) {
        lock(&self.dial_duration)
            .entry(role.to_string())
            .or_insert_with(|| Histogram::new(DIAL_DURATION_BUCKETS))
            .observe(seconds);
    }

    pub fn incr_dial_retries(&self, role: &str) {
        *lock(&self.dial_retries_total)
            .entry(role.to_string())
            .or_insert(0) += 1;
    }

    pub fn set_control_channel_connected(&self, up: bool) {
        self.control_channel_up
            .store(u64::from(up), Ordering::Relaxed);
    }

    /// Formats all metrics in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        family(
            &mut out,
            "connections_total",
            "counter",
            "Total connections that completed setup and entered bridging.",
        );
        for ((role, target, status), v) in lock(&self.connections_total).iter() {
            sample(
                &mut out,
                "connections_total",
                &[("role", role), ("target", target), ("status", status)],
                &v.to_string(),
            );
        }

        family(
            &mut out,
            "connection_errors_total",
            "counter",
            "Total number of connection errors, by reason.",
        );
        for ((role, reason), v) in lock(&self.connection_errors).iter() {
            sample(
                &mut out,
                "connection_errors_total",
                &[("role", role), ("reason", reason)],
                &v.to_string(),
            );
        }

        family(
            &mut out,
            "bytes_total",
            "counter",
            "Total bytes transferred through the relay tunnel.",
        );
        for ((role, target, direction), v) in lock(&self.bytes_total).iter() {
            sample(
                &mut out,
                "bytes_total",
                &[("role", role), ("target", target), ("direction", direction)],
                &v.to_string(),
            );
        }

        family(
            &mut out,
            "active_connections",
            "gauge",
            "Number of currently active bridged connections.",
        );
        for ((role, target), v) in lock(&self.active_connections).iter() {
            sample(
                &mut out,
                "active_connections",
                &[("role", role), ("target", target)],
                &v.to_string(),
            );
        }

        family(
            &mut out,
            "control_channel_connected",
            "gauge",
            "Whether the listener control channel is connected (1) or not (0).",
        );
        sample(
            &mut out,
            "control_channel_connected",
            &[],
            &self.control_channel_up.load(Ordering::Relaxed).to_string(),
        );

        family(
            &mut out,
            "connection_duration_seconds",
            "histogram",
            "Duration of completed connections in seconds.",
        );
        for ((role, target), h) in lock(&self.connection_duration).iter() {
            histogram_samples(
                &mut out,
                "connection_duration_seconds",
                &[("role", role), ("target", target)],
                h,
            );
        }

        family(
            &mut out,
            "dial_duration_seconds",
            "histogram",
            "Total time spent dialing the relay, including retry backoff, in seconds.",
        );
        for (role, h) in lock(&self.dial_duration).iter() {
            histogram_samples(&mut out, "dial_duration_seconds", &[("role", role)], h);
        }

        family(
            &mut out,
            "dial_retries_total",
            "counter",
            "Total number of relay dial retry attempts.",
        );
        for (role, v) in lock(&self.dial_retries_total).iter() {
            sample(
                &mut out,
                "dial_retries_total",
                &[("role", role)],
                &v.to_string(),
            );
        }

        out
    }
}

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP {NAMESPACE}_{name} {help}\n"));
    out.push_str(&format!("# TYPE {NAMESPACE}_{name} {kind}\n"));
}

fn sample(out: &mut String, name: &str, labels: &[(&str, &str)], value: &str) {
    out.push_str(&format!("{NAMESPACE}_{name}"));
    push_labels(out, labels, None);
    out.push(' ');
    out.push_str(value);
    out.push('\n');
}

fn histogram_samples(out: &mut String, name: &str, labels: &[(&str, &str)], h: &Histogram) {
    for (i, b) in h.buckets.iter().enumerate() {
        out.push_str(&format!("{NAMESPACE}_{name}_bucket"));
        push_labels(out, labels, Some(&b.to_string()));
        out.push_str(&format!(" {}\n", h.counts[i]));
    }
    out.push_str(&format!("{NAMESPACE}_{name}_bucket"));
    push_labels(out, labels, Some("+Inf"));
    out.push_str(&format!(" {}\n", h.count));
    out.push_str(&format!("{NAMESPACE}_{name}_sum"));
    push_labels(out, labels, None);
    out.push_str(&format!(" {}\n", h.sum));
    out.push_str(&format!("{NAMESPACE}_{name}_count"));
    push_labels(out, labels, None);
    out.push_str(&format!(" {}\n", h.count));
}

fn push_labels(out: &mut String, labels: &[(&str, &str)], le: Option<&str>) {
    if labels.is_empty() && le.is_none() {
        return;
    }
    out.push('{');
    let mut first = true;
    for (k, v) in labels {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&format!("{k}=\"{}\"", escape_label(v)));
    }
    if let Some(le) = le {
        if !first {
            out.push(',');
        }
        out.push_str(&format!("le=\"{le}\""));
    }
    out.push('}');
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Records the outcome of a single bridged connection.
pub struct ConnectionTracker {
    metrics: Arc<Metrics>,
    role: String,
    target: String,
}

impl ConnectionTracker {
    /// Records the completion of a connection. `to_relay` is data sent into
    /// the relay (local endpoint → relay); `from_relay` is data received
    /// from it.
    pub fn done(self, duration_secs: f64, to_relay: u64, from_relay: u64, failed: bool) {
        let m = &self.metrics;
        let status = if failed { "error" } else { "success" };
        *lock(&m.active_connections)
            .entry((self.role.clone(), self.target.clone()))
            .or_insert(0) -= 1;
        *lock(&m.connections_total)
            .entry((self.role.clone(), self.target.clone(), status.to_string()))
            .or_insert(0) += 1;
        lock(&m.connection_duration)
            .entry((self.role.clone(), self.target.clone()))
            .or_insert_with(|| Histogram::new(CONNECTION_DURATION_BUCKETS))
            .observe(duration_secs);
        *lock(&m.bytes_total)
            .entry((
                self.role.clone(),
                self.target.clone(),
                "to_relay".to_string(),
            ))
            .or_insert(0) += to_relay;
        *lock(&m.bytes_total)
            .entry((self.role, self.target, "from_relay".to_string()))
            .or_insert(0) += from_relay;
    }
}

/// Categorises a dial error as a timeout or the given fallback reason.
pub fn dial_reason(err: &anyhow::Error, fallback: &'static str) -> &'static str {
    for cause in err.chain() {
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return REASON_DIAL_TIMEOUT;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return REASON_DIAL_TIMEOUT;
            }
        }
    }
    fallback
}

/// Wraps [`bridge`] with connection lifecycle tracking. Metrics are
/// optional; with `None` this is a plain bridge.
pub async fn tracked_bridge<WS, S>(
    metrics: Option<&Arc<Metrics>>,
    cancel: &CancellationToken,
    ws: WebSocketStream<WS>,
    local: S,
    role: &str,
    target: &str,
) -> (BridgeStats, Result<()>)
where
    WS: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tracker = metrics.map(|m| m.connection_opened(role, target));
    let start = Instant::now();
    let (stats, result) = bridge(cancel, ws, local).await;
    if let Some(tracker) = tracker {
        tracker.done(
            start.elapsed().as_secs_f64(),
            stats.tcp_to_ws,
            stats.ws_to_tcp,
            result.is_err(),
        );
    }
    (stats, result)
}

/// Wraps [`dial_with_timeout`] with duration, retry, and error metrics.
pub async fn instrumented_dial(
    metrics: Option<&Arc<Metrics>>,
    endpoint: &str,
    entity_path: &str,
    tp: &dyn TokenProvider,
    role: &'static str,
    dial_budget: Duration,
) -> Result<WsConn> {
    let start = Instant::now();
    let on_retry: Option<Box<dyn Fn() + Send + Sync>> = metrics.map(|m| {
        let m = Arc::clone(m);
        Box::new(move || m.incr_dial_retries(role)) as Box<dyn Fn() + Send + Sync>
    });
    let result = dial_with_timeout(endpoint, entity_path, tp, dial_budget, on_retry.as_deref()).await;
    if let Some(m) = metrics {
        m.observe_dial_duration(role, start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            m.connection_error(role, dial_reason(e, REASON_RELAY_FAILED));
        }
    }
    result
}
