use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Failure classes surfaced by the content pipeline.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unknown merge strategy, instance awaiting reconfiguration, bad settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rendering timeout or external service failure. Eligible for retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Malformed payload. Previous state is kept.
    #[error("Data error: {0}")]
    Data(String),

    /// Operation on a cancelled job or a deleted instance.
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Short class name used in logs and job error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config",
            CoreError::Transient(_) => "transient",
            CoreError::Data(_) => "data",
            CoreError::Consistency(_) => "consistency",
            CoreError::NotFound(_) => "not_found",
            CoreError::RateLimited(_) => "rate_limited",
            CoreError::PayloadTooLarge(_) => "payload_too_large",
            CoreError::Database(_) | CoreError::Pool(_) => "storage",
            CoreError::Io(_) => "io",
            CoreError::Json(_) => "serialization",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Data(_) | CoreError::Json(_) => StatusCode::BAD_REQUEST,
            CoreError::Consistency(_) => StatusCode::CONFLICT,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Database(diesel::result::Error::NotFound) => StatusCode::NOT_FOUND,
            CoreError::Database(_) | CoreError::Pool(_) | CoreError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", self.kind(), self);
        }
        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
