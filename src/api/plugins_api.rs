use crate::db;
use crate::error::CoreResult;
use crate::models::{NewPluginDefinition, PluginDefinition, PluginInstance, RenderJob};
use crate::services::plugin_service;
use crate::services::render_queue::{EnqueueRequest, PRIORITY_PREVIEW};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    #[serde(default)]
    pub settings: Value,
    pub refresh_interval: Option<i32>,
}

#[derive(Deserialize)]
pub struct ConfigureRequest {
    #[serde(default)]
    pub settings: Value,
    pub refresh_interval: Option<i32>,
}

#[derive(Deserialize, Default)]
pub struct PreviewRequest {
    pub device_id: Option<i32>,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub deleted: i32,
    pub removed_files: usize,
}

pub async fn create_definition(
    State(state): State<AppState>,
    Json(payload): Json<NewPluginDefinition>,
) -> CoreResult<(StatusCode, Json<PluginDefinition>)> {
    let definition =
        db::with_conn(&state.db, move |conn| plugin_service::create_definition(conn, payload)).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

/// Flag every instance of the definition for reconfiguration.
pub async fn mark_definition_changed(
    State(state): State<AppState>,
    Path(definition_id): Path<i32>,
) -> CoreResult<Json<Value>> {
    let flagged = db::with_conn(&state.db, move |conn| {
        plugin_service::mark_definition_changed(conn, definition_id)
    })
    .await?;
    Ok(Json(serde_json::json!({ "instances_flagged": flagged })))
}

pub async fn delete_definition(
    State(state): State<AppState>,
    Path(definition_id): Path<i32>,
) -> CoreResult<Json<DeleteResponse>> {
    let orphaned = db::with_conn(&state.db, move |conn| {
        plugin_service::delete_definition(conn, definition_id)
    })
    .await?;
    Ok(Json(DeleteResponse {
        deleted: definition_id,
        removed_files: remove_files(&state, &orphaned),
    }))
}

pub async fn schedule_definition_purge(
    State(state): State<AppState>,
    Path(definition_id): Path<i32>,
) -> CoreResult<StatusCode> {
    db::with_conn(&state.db, move |conn| {
        plugin_service::schedule_purge_definition(conn, definition_id)
    })
    .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn list_instances(State(state): State<AppState>) -> CoreResult<Json<Vec<PluginInstance>>> {
    let instances = db::with_conn(&state.db, plugin_service::list_instances).await?;
    Ok(Json(instances))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Path(definition_id): Path<i32>,
    Json(payload): Json<InstanceRequest>,
) -> CoreResult<(StatusCode, Json<PluginInstance>)> {
    let instance = db::with_conn(&state.db, move |conn| {
        plugin_service::create_instance(
            conn,
            definition_id,
            &payload.name,
            payload.settings,
            payload.refresh_interval,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn configure_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
    Json(payload): Json<ConfigureRequest>,
) -> CoreResult<Json<PluginInstance>> {
    let instance = db::with_conn(&state.db, move |conn| {
        plugin_service::configure_instance(conn, instance_id, payload.settings, payload.refresh_interval)
    })
    .await?;
    Ok(Json(instance))
}

pub async fn deactivate_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
) -> CoreResult<Json<PluginInstance>> {
    let instance = db::with_conn(&state.db, move |conn| {
        plugin_service::deactivate_instance(conn, instance_id)
    })
    .await?;
    Ok(Json(instance))
}

pub async fn activate_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
) -> CoreResult<Json<PluginInstance>> {
    let instance = db::with_conn(&state.db, move |conn| {
        plugin_service::activate_instance(conn, instance_id)
    })
    .await?;
    Ok(Json(instance))
}

pub async fn schedule_instance_purge(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
) -> CoreResult<Json<PluginInstance>> {
    let instance = db::with_conn(&state.db, move |conn| {
        plugin_service::schedule_purge_instance(conn, instance_id)
    })
    .await?;
    Ok(Json(instance))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
) -> CoreResult<Json<DeleteResponse>> {
    let orphaned = db::with_conn(&state.db, move |conn| {
        plugin_service::delete_instance(conn, instance_id)
    })
    .await?;
    Ok(Json(DeleteResponse {
        deleted: instance_id,
        removed_files: remove_files(&state, &orphaned),
    }))
}

/// Queue a one-off render that jumps ahead of routine refreshes.
pub async fn preview_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<i32>,
    payload: Option<Json<PreviewRequest>>,
) -> CoreResult<(StatusCode, Json<RenderJob>)> {
    let device_id = payload.map(|Json(p)| p.device_id).unwrap_or_default();
    let orchestrator = Arc::clone(&state.orchestrator);

    let job = db::with_conn(&state.db, move |conn| {
        plugin_service::get_instance(conn, instance_id)?;
        orchestrator.enqueue(
            conn,
            EnqueueRequest::one_off(instance_id, device_id, PRIORITY_PREVIEW, Utc::now().naive_utc()),
        )
    })
    .await?;
    tracing::info!("Preview render {} queued for instance {}", job.id, instance_id);
    Ok((StatusCode::ACCEPTED, Json(job)))
}

fn remove_files(state: &AppState, names: &[String]) -> usize {
    let images = state.orchestrator.images();
    names
        .iter()
        .filter(|name| match images.delete(name) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("Failed to delete bitmap {}: {}", name, e);
                false
            }
        })
        .count()
}
