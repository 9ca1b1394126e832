use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    /// Always `healthy` while the endpoint answers.
    pub status: &'static str,
    /// Connections currently in the table.
    pub connections_active: u64,
    /// Connections admitted since start.
    pub accepted_total: u64,
    /// Connections rejected (capacity or handshake) since start.
    pub rejected_total: u64,
    /// Calls answered since start.
    pub calls_total: u64,
}

#[derive(Default, Debug)]
struct Counters {
    connections_active: AtomicU64,
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
    closed_total: AtomicU64,
    calls_total: AtomicU64,
    dropped_total: AtomicU64,
}

/// Live counters shared between the reactor thread, the health endpoint and
/// tests. Cloning shares the same counters.
#[derive(Clone, Default, Debug)]
pub struct NodeStats {
    inner: Arc<Counters>,
}

impl NodeStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.inner.connections_active.fetch_add(1, Ordering::Relaxed);
        self.inner.accepted_total.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        counters::connections_total("accepted");
    }

    pub(crate) fn connection_closed(&self) {
        self.inner.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.inner.closed_total.fetch_add(1, Ordering::Relaxed);
        gauges::dec_connections_active();
        counters::connections_total("closed");
    }

    pub(crate) fn connection_rejected(&self, status: &'static str) {
        self.inner.rejected_total.fetch_add(1, Ordering::Relaxed);
        counters::connections_total(status);
    }

    pub(crate) fn call_answered(&self, outcome: &'static str) {
        self.inner.calls_total.fetch_add(1, Ordering::Relaxed);
        counters::calls_total(outcome);
    }

    pub(crate) fn frame_dropped(&self, reason: &'static str) {
        self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
        counters::frames_dropped_total(reason);
    }

    /// Connections currently in the table.
    #[must_use]
    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Ordering::Relaxed)
    }

    /// Connections admitted since start.
    #[must_use]
    pub fn accepted_total(&self) -> u64 {
        self.inner.accepted_total.load(Ordering::Relaxed)
    }

    /// Connections refused since start.
    #[must_use]
    pub fn rejected_total(&self) -> u64 {
        self.inner.rejected_total.load(Ordering::Relaxed)
    }

    /// Admitted connections torn down since start.
    #[must_use]
    pub fn closed_total(&self) -> u64 {
        self.inner.closed_total.load(Ordering::Relaxed)
    }

    /// Calls answered since start, including unknown-function replies.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.inner.calls_total.load(Ordering::Relaxed)
    }

    /// Payload frames dropped as undecodable since start.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot served at `/health`.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy",
            connections_active: self.connections_active(),
            accepted_total: self.accepted_total(),
            rejected_total: self.rejected_total(),
            calls_total: self.calls_total(),
        }
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the metrics HTTP
/// server fails.
pub async fn start_metrics_server(addr: SocketAddr, stats: NodeStats) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(move || health_handler(stats.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 with live connection counts.
async fn health_handler(stats: NodeStats) -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(stats.health()))
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("cnode_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("cnode_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a connection lifecycle event with the given status label.
    pub fn connections_total(status: &'static str) {
        metrics::counter!("cnode_connections_total", "status" => status).increment(1);
    }

    /// Record an answered call with the given outcome label.
    pub fn calls_total(outcome: &'static str) {
        metrics::counter!("cnode_calls_total", "outcome" => outcome).increment(1);
    }

    /// Increment the dropped-frames counter with the given reason label.
    pub fn frames_dropped_total(reason: &'static str) {
        metrics::counter!("cnode_frames_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the keepalive counter.
    pub fn ticks_total() {
        metrics::counter!("cnode_ticks_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a handshake duration in seconds.
    pub fn handshake_seconds(value: f64) {
        metrics::histogram!("cnode_handshake_seconds").record(value);
    }
}
