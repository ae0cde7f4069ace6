//! Diagnostic HTTP endpoint, enabled with `--prof <addr>`.
//!
//! Serves two read-only routes: `/healthz` for liveness probes and
//! `/status` with the connection pool counters as JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::error::Result;
use crate::nntp::{Pool, PoolStats};

/// Serve the diagnostics endpoint on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, pool: Arc<Pool>) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(pool);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "diagnostics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(pool): State<Arc<Pool>>) -> Json<PoolStats> {
    Json(pool.stats())
}
