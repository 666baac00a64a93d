use crate::auth::device_token;
use crate::db;
use crate::error::CoreError;
use crate::services::{device_service, display_service};
use crate::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDateTime;
use serde::Serialize;

#[derive(Serialize)]
pub struct DisplayResponse {
    pub status: &'static str,
    pub image_url: Option<String>,
    pub filename: Option<String>,
    pub content_hash: Option<String>,
    pub rendered_at: Option<NaiveDateTime>,
    pub refresh_rate: i32,
    pub stale: bool,
}

fn image_url(public_url: Option<&str>, file_name: &str) -> String {
    match public_url {
        Some(base) => format!("{}/images/{}", base.trim_end_matches('/'), file_name),
        None => format!("/images/{}", file_name),
    }
}

/// GET /api/display: what the polling device should show next.
pub async fn get_display(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = device_token(&headers).map(str::to_string) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let device = match db::with_conn(&state.db, move |conn| {
        device_service::find_by_api_key(conn, &token)
    })
    .await
    {
        Ok(Some(device)) => device,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return e.into_response(),
    };

    let frame = match display_service::serve_poll(
        &state.db,
        &state.orchestrator,
        &state.config.display,
        &device,
    )
    .await
    {
        Ok(frame) => frame,
        Err(e) => return display_error(device.id, e),
    };

    let public_url = state.config.server.public_url.as_deref();
    Json(DisplayResponse {
        status: if frame.image_path.is_some() { "ok" } else { "no_content" },
        image_url: frame.image_path.as_deref().map(|name| image_url(public_url, name)),
        filename: frame.image_path,
        content_hash: frame.content_hash,
        rendered_at: frame.rendered_at,
        refresh_rate: frame.refresh_rate,
        stale: frame.stale,
    })
    .into_response()
}

/// Devices are told to come back later instead of seeing a server error.
fn display_error(device_id: i32, err: CoreError) -> Response {
    tracing::error!("Display poll for device {} failed: {}", device_id, err);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "status": "error",
            "refresh_rate": 60,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_url_joins_public_base() {
        assert_eq!(
            image_url(Some("https://ink.example.com/"), "3_1_ab.png"),
            "https://ink.example.com/images/3_1_ab.png"
        );
        assert_eq!(image_url(None, "3_any_ab.bmp"), "/images/3_any_ab.bmp");
    }
}
