use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    inventory::{self, InventoryEntry},
    metrics::PrometheusSink,
    scheduler::{CycleStats, Phase, SchedulerHandle},
};

#[derive(Clone, Debug)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub metrics: Arc<PrometheusSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub tracked: usize,
    pub scanned: usize,
    pub open_ports: usize,
    #[serde(flatten)]
    pub cycles: CycleStats,
}

#[derive(Debug, Serialize)]
pub struct InventoryAccepted {
    pub tracked: usize,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .route("/inventory", put(put_inventory).get(get_inventory))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .route("/metrics", get(get_metrics))
        .with_state(state)
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `cancel` fires.
pub async fn serve(bind: &str, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;
    info!("HTTP API listening on {bind}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn ok() -> &'static str {
    "Ok"
}

async fn get_metrics(State(app): State<AppState>) -> impl IntoResponse {
    match app.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("metrics encoding failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let store = app.scheduler.store();
    let snapshot = store.snapshot().await;
    let out = Status {
        phase: app.scheduler.phase(),
        tracked: snapshot.inventory.len(),
        scanned: snapshot.results.len(),
        open_ports: snapshot.open_port_count(),
        cycles: app.scheduler.stats().await,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.scheduler.store().snapshot().await;
    (StatusCode::OK, Json(snapshot))
}

async fn get_inventory(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.scheduler.store().targets().await))
}

async fn put_inventory(
    State(app): State<AppState>,
    Json(entries): Json<Vec<InventoryEntry>>,
) -> impl IntoResponse {
    let targets = match inventory::resolve(entries) {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let tracked = targets.len();
    app.scheduler.set_inventory(targets).await;
    info!(tracked, "inventory replaced");
    (StatusCode::ACCEPTED, Json(InventoryAccepted { tracked })).into_response()
}
