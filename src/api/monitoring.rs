use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::error;
use crate::query;
use crate::sampler::Sampler;
use crate::AppState;

/// Filter for `POST /monitoring`. Every field is optional: an empty filter
/// asks for the live record, bounds select a historical range.
#[derive(Debug, Default, Deserialize)]
pub struct MonitoringRequest {
    pub table_name: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl MonitoringRequest {
    fn is_live(&self) -> bool {
        self.table_name.is_none() && self.from.is_none() && self.to.is_none()
    }
}

/// POST /monitoring — live snapshot or historical series, newest first.
/// The response is always a JSON array; "no data in range" is `[]` with 200.
pub async fn monitoring(
    State(state): State<Arc<AppState>>,
    body: Option<Json<MonitoringRequest>>,
) -> Response {
    let Json(req) = body.unwrap_or_default();

    if req.is_live() {
        return live_record(&state).await;
    }

    let Some(backend) = state.storages.primary() else {
        // History was requested but no storage is configured.
        return Json(serde_json::json!([])).into_response();
    };

    let table = req
        .table_name
        .as_deref()
        .unwrap_or(&state.config.default_table);

    match query::run(
        backend,
        table,
        req.from.as_deref(),
        req.to.as_deref(),
        state.config.downsample_max_points,
    )
    .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error::respond("monitoring:query", e),
    }
}

/// The most recent assembled record; sampled on demand when no tick has
/// completed yet (e.g. right after startup).
async fn live_record(state: &AppState) -> Response {
    if let Some(record) = state.latest.get().await {
        return Json(vec![record]).into_response();
    }

    let sampled = tokio::task::spawn_blocking(|| Sampler::new().sample()).await;
    match sampled {
        Ok(record) => Json(vec![record]).into_response(),
        Err(e) => error::internal_error("monitoring:live_sample", e),
    }
}

/// GET /api/v1/server-config — the topology projection the dashboard needs
/// to label series and draw threshold bands.
pub async fn server_config(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "refresh_interval_seconds": state.config.refresh_interval_seconds,
        "servers": state.config.servers,
        "thresholds": state.config.thresholds,
    }))
    .into_response()
}

/// GET /healthz — liveness for load balancers and peer heartbeat probes.
pub async fn healthz() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}
