use crate::db;
use crate::error::CoreResult;
use crate::services::{ingestion, settings_service};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Serialize)]
pub struct WebhookResponse {
    pub plugin_instance_id: i32,
    pub render_job_id: i32,
    pub merged_data: Value,
}

/// POST /api/custom_plugins/:id
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
    body: Bytes,
) -> CoreResult<Json<WebhookResponse>> {
    let limiter = Arc::clone(&state.rate_limiter);
    let orchestrator = Arc::clone(&state.orchestrator);

    let response = db::with_conn(&state.db, move |conn| {
        let tunables = settings_service::load_tunables(conn)?;
        let merged_data = ingestion::apply_webhook(conn, &limiter, &tunables, instance_id, &body)?;
        let job = orchestrator.enqueue(conn, ingestion::data_changed(instance_id))?;
        Ok(WebhookResponse {
            plugin_instance_id: instance_id,
            render_job_id: job.id,
            merged_data,
        })
    })
    .await?;

    Ok(Json(response))
}
