use crate::db;
use crate::error::CoreResult;
use crate::models::{Device, NewDevice, PlaylistItem, Schedule};
use crate::services::playlist_service::{self, ItemOptions, ScheduleInput};
use crate::services::device_service;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub bit_depth: Option<i32>,
}

#[derive(Serialize)]
pub struct CreateDeviceResponse {
    pub device: Device,
    pub api_key: String,
}

#[derive(Deserialize)]
pub struct MoveItemRequest {
    pub position: i32,
}

pub async fn list_devices(State(state): State<AppState>) -> CoreResult<Json<Vec<Device>>> {
    let devices = db::with_conn(&state.db, device_service::list_devices).await?;
    Ok(Json(devices))
}

/// Register a device. The API key is only returned here.
pub async fn create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> CoreResult<(StatusCode, Json<CreateDeviceResponse>)> {
    let defaults = state.config.display.clone();
    let api_key = Uuid::new_v4().to_string();
    let new_device = NewDevice {
        name: req.name,
        api_key: api_key.clone(),
        width: req.width.unwrap_or(defaults.default_width),
        height: req.height.unwrap_or(defaults.default_height),
        bit_depth: req.bit_depth.unwrap_or(defaults.default_bit_depth),
    };

    let device = db::with_conn(&state.db, move |conn| device_service::create_device(conn, new_device)).await?;
    Ok((StatusCode::CREATED, Json(CreateDeviceResponse { device, api_key })))
}

pub async fn list_playlist(
    State(state): State<AppState>,
    Path(device_id): Path<i32>,
) -> CoreResult<Json<Vec<PlaylistItem>>> {
    let items = db::with_conn(&state.db, move |conn| {
        device_service::get_device(conn, device_id)?;
        let playlist = playlist_service::ensure_default_playlist(conn, device_id)?;
        playlist_service::list_items(conn, playlist.id)
    })
    .await?;
    Ok(Json(items))
}

pub async fn add_playlist_item(
    State(state): State<AppState>,
    Path(device_id): Path<i32>,
    Json(options): Json<ItemOptions>,
) -> CoreResult<(StatusCode, Json<PlaylistItem>)> {
    let item = db::with_conn(&state.db, move |conn| {
        device_service::get_device(conn, device_id)?;
        playlist_service::add_item(conn, device_id, options)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn move_playlist_item(
    State(state): State<AppState>,
    Path(item_id): Path<i32>,
    Json(req): Json<MoveItemRequest>,
) -> CoreResult<StatusCode> {
    db::with_conn(&state.db, move |conn| playlist_service::move_item(conn, item_id, req.position)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_playlist_item(
    State(state): State<AppState>,
    Path(item_id): Path<i32>,
) -> CoreResult<StatusCode> {
    db::with_conn(&state.db, move |conn| playlist_service::remove_item(conn, item_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_schedule(
    State(state): State<AppState>,
    Path(item_id): Path<i32>,
    Json(input): Json<ScheduleInput>,
) -> CoreResult<(StatusCode, Json<Schedule>)> {
    let schedule =
        db::with_conn(&state.db, move |conn| playlist_service::add_schedule(conn, item_id, input)).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}
