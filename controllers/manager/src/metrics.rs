//! Prometheus metrics endpoint.
//!
//! Passive read-only surface scraped externally. The listener is bound
//! during manager construction so an unbindable address fails the process
//! before the run loop starts.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Counters exported by the orchestration core.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    /// Reconciliations per controller
    pub reconciliations: IntCounterVec,
    /// Reconciliation errors per controller
    pub reconcile_errors: IntCounterVec,
    /// Admission reviews answered per webhook
    pub admission_reviews: IntCounterVec,
    /// Leadership transitions observed by this replica
    pub leadership_changes: IntCounter,
}

impl Metrics {
    /// Build and register all counters on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("metal_reconciliations_total", "Reconciliations per controller"),
            &["controller"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("metal_reconcile_errors_total", "Reconciliation errors per controller"),
            &["controller"],
        )?;
        let admission_reviews = IntCounterVec::new(
            Opts::new("metal_admission_reviews_total", "Admission reviews answered per webhook"),
            &["webhook", "allowed"],
        )?;
        let leadership_changes = IntCounter::new(
            "metal_leadership_changes_total",
            "Leadership transitions observed by this replica",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(admission_reviews.clone()))?;
        registry.register(Box::new(leadership_changes.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_errors,
            admission_reviews,
            leadership_changes,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Serve `/metrics` on an already-bound listener until the shared shutdown
/// signal fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Metrics endpoint listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Result<String, StatusCode> {
    metrics
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
