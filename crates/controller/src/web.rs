use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{Engine, EngineStatus};
use crate::sensors::SensorSnapshot;

#[derive(Clone)]
pub struct WebState {
    pub farm_id: String,
    pub started_at: Instant,
    pub store_connected: bool,
    pub engine: Engine,
    pub sensors: watch::Receiver<Option<SensorSnapshot>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub farm_id: String,
    pub uptime_secs: u64,
    pub store_connected: bool,
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub sensors: Option<SensorSnapshot>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn api_status(State(state): State<WebState>) -> impl IntoResponse {
    let sensors = *state.sensors.borrow();
    Json(StatusResponse {
        farm_id: state.farm_id.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        store_connected: state.store_connected,
        engine: state.engine.status().await,
        sensors,
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: WebState, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status endpoint listening on http://{addr}/api/status");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
