//! `/health` and `/metrics` endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use hub_upload::UploadStatus;
use key_pool::KeyPool;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// What `/health` reports on, per mode.
#[derive(Clone)]
pub enum HealthSource {
    Harvest(Arc<KeyPool>),
    Upload(Arc<UploadStatus>),
}

#[derive(Clone)]
pub struct AppState {
    pub health: HealthSource,
    pub prometheus: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Bind `addr` and serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status endpoint {addr}"))?;
    info!(addr = %addr, "status endpoint listening");

    let app = build_router(state);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "status endpoint failed");
        }
    }))
}

/// 503 once every API key is exhausted, 200 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status_code, body) = match &state.health {
        HealthSource::Harvest(pool) => {
            let mut body = pool.health().await;
            let code = if body["status"] == "unhealthy" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            body["mode"] = serde_json::Value::from("harvest");
            (code, body)
        }
        HealthSource::Upload(status) => (StatusCode::OK, status.health()),
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
