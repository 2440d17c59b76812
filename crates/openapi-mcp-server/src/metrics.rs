//! Prometheus metrics for the gateway. Initialized once; the transport
//! serves the encoded registry at the configured path when enabled.

use std::sync::OnceLock;

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder, histogram_opts, opts,
};

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub struct Metrics {
    pub registry: Registry,
    pub requests_total: IntCounterVec,
    pub tool_calls_total: IntCounterVec,
    pub tool_call_duration_seconds: HistogramVec,
    pub upstream_requests_total: IntCounterVec,
    pub sessions_active: IntGauge,
}

impl Metrics {
    fn new() -> Option<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("mcp_requests_total", "Transport requests by method and status"),
            &["method", "status"],
        )
        .ok()?;
        let tool_calls_total = IntCounterVec::new(
            opts!("mcp_tool_calls_total", "Tool calls by tool and outcome"),
            &["tool", "outcome"],
        )
        .ok()?;
        let tool_call_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "mcp_tool_call_duration_seconds",
                "Tool call duration in seconds"
            ),
            &["tool"],
        )
        .ok()?;
        let upstream_requests_total = IntCounterVec::new(
            opts!("mcp_upstream_requests_total", "Upstream calls by status class"),
            &["status"],
        )
        .ok()?;
        let sessions_active = IntGauge::new("mcp_sessions_active", "Live sessions").ok()?;

        registry.register(Box::new(requests_total.clone())).ok()?;
        registry.register(Box::new(tool_calls_total.clone())).ok()?;
        registry
            .register(Box::new(tool_call_duration_seconds.clone()))
            .ok()?;
        registry
            .register(Box::new(upstream_requests_total.clone()))
            .ok()?;
        registry.register(Box::new(sessions_active.clone())).ok()?;

        Some(Self {
            registry,
            requests_total,
            tool_calls_total,
            tool_call_duration_seconds,
            upstream_requests_total,
            sessions_active,
        })
    }
}

/// The process-wide metrics instance.
pub fn metrics() -> Option<&'static Metrics> {
    if METRICS.get().is_none() {
        if let Some(m) = Metrics::new() {
            let _ = METRICS.set(m);
        }
    }
    METRICS.get()
}

/// Encode the registry in Prometheus text format.
pub fn encode() -> String {
    let Some(metrics) = metrics() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder
        .encode(&metrics.registry.gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_tool_call(tool: &str, ok: bool, duration_secs: f64) {
    if let Some(m) = metrics() {
        let outcome = if ok { "ok" } else { "error" };
        m.tool_calls_total.with_label_values(&[tool, outcome]).inc();
        m.tool_call_duration_seconds
            .with_label_values(&[tool])
            .observe(duration_secs);
    }
}

pub fn record_request(method: &str, status: u16) {
    if let Some(m) = metrics() {
        m.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(m) = metrics() {
        m.sessions_active.set(count as i64);
    }
}
