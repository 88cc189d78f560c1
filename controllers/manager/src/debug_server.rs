//! Debug introspection sidecar.
//!
//! Independent background listener on a fixed local address. Failure to
//! bind or serve is fatal for the whole process: introspection
//! availability is an operational guarantee, not an optional extra.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ManagerError;

/// Fixed local address of the debug listener.
pub const DEBUG_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    9994,
);

/// Read-only snapshot shared with the debug endpoint.
#[derive(Debug)]
pub struct DebugState {
    mode: &'static str,
    started_at: Instant,
    leading: AtomicBool,
}

impl DebugState {
    /// State for a process running in the given mode.
    pub fn new(mode: &'static str) -> Self {
        Self {
            mode,
            started_at: Instant::now(),
            leading: AtomicBool::new(false),
        }
    }

    /// Record whether this replica currently holds the leader lease.
    pub fn set_leading(&self, leading: bool) {
        self.leading.store(leading, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    mode: &'static str,
    uptime_seconds: u64,
    leading: bool,
}

/// Run the debug listener on `addr` until the shared shutdown signal fires.
///
/// Binds eagerly so an address conflict surfaces as an error instead of
/// being silently swallowed.
pub async fn run(
    addr: SocketAddr,
    state: Arc<DebugState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ManagerError> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ManagerError::Sidecar(format!("failed to bind {addr}: {e}")))?;

    info!(addr = %addr, "Debug server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await
        .map_err(|e| ManagerError::Sidecar(e.to_string()))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn status(State(state): State<Arc<DebugState>>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot {
        mode: state.mode,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        leading: state.leading.load(Ordering::SeqCst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        // Occupy an ephemeral port, then ask the debug server for it.
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let state = Arc::new(DebugState::new("reconcile"));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = run(addr, state, shutdown_rx).await;

        match result {
            Err(ManagerError::Sidecar(msg)) => assert!(msg.contains("bind")),
            other => panic!("expected sidecar error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stops_promptly_on_shutdown() {
        let state = Arc::new(DebugState::new("reconcile"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(run("127.0.0.1:0".parse().unwrap(), state, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("debug server did not stop on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn status_reports_mode_and_leadership() {
        let state = Arc::new(DebugState::new("webhook"));
        state.set_leading(true);

        let Json(snapshot) = status(State(state)).await;
        assert_eq!(snapshot.mode, "webhook");
        assert!(snapshot.leading);
    }
}
