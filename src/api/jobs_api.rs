use crate::db;
use crate::error::CoreResult;
use crate::models::RenderJob;
use crate::services::render_queue;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Jobs that used up their retry budget and need an operator.
pub async fn list_failed(State(state): State<AppState>) -> CoreResult<Json<Vec<RenderJob>>> {
    let max_attempts = state.orchestrator.retry_policy().max_attempts;
    let jobs = db::with_conn(&state.db, move |conn| render_queue::list_failed(conn, max_attempts)).await?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<i32>,
) -> CoreResult<Json<RenderJob>> {
    let job = db::with_conn(&state.db, move |conn| render_queue::get_job(conn, job_id)).await?;
    Ok(Json(job))
}

/// Re-arm a failed job with a fresh attempt budget.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<i32>,
) -> CoreResult<Json<RenderJob>> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let job = db::with_conn(&state.db, move |conn| {
        let job = render_queue::retry_now(conn, job_id, Utc::now().naive_utc())?;
        orchestrator.wake();
        Ok(job)
    })
    .await?;
    tracing::info!("Operator retried render job {}", job_id);
    Ok(Json(job))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<i32>,
) -> CoreResult<Json<RenderJob>> {
    let job = db::with_conn(&state.db, move |conn| {
        render_queue::cancel(conn, job_id, "cancelled by operator")?;
        render_queue::get_job(conn, job_id)
    })
    .await?;
    Ok(Json(job))
}
