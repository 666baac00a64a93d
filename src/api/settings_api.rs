use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::models::GlobalSetting;
use crate::services::settings_service::{self, DEFAULT_SETTINGS};
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct UpdateSettingRequest {
    pub value: String,
    pub description: Option<String>,
}

pub async fn list_settings(State(state): State<AppState>) -> CoreResult<Json<Vec<GlobalSetting>>> {
    let settings = db::with_conn(&state.db, settings_service::list_settings).await?;
    Ok(Json(settings))
}

/// Only the known tunables may be written; values must parse as numbers.
pub async fn update_setting(
    State(state): State<AppState>,
    Path(setting_key): Path<String>,
    Json(payload): Json<UpdateSettingRequest>,
) -> CoreResult<Json<GlobalSetting>> {
    if !DEFAULT_SETTINGS.iter().any(|&(known, _, _)| known == setting_key) {
        return Err(CoreError::not_found(format!("setting '{}'", setting_key)));
    }
    if payload.value.trim().parse::<i64>().map_or(true, |v| v < 0) {
        return Err(CoreError::data(format!(
            "setting '{}' needs a non-negative integer, got '{}'",
            setting_key, payload.value
        )));
    }

    let setting = db::with_conn(&state.db, move |conn| {
        settings_service::upsert_setting(conn, &setting_key, payload.value.trim(), payload.description)
    })
    .await?;
    tracing::info!("Setting '{}' updated to '{}'", setting.key, setting.value);
    Ok(Json(setting))
}
