mod http_adapter;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoreResult;

pub use http_adapter::HttpRenderer;

/// Everything the rendering service needs to draw one instance.
#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest {
    pub template: String,
    pub data: Value,
    pub settings: Value,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
}

#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

/// Render(template, mergedData) -> (bitmap, contentHash).
///
/// Implementations report service failures as `CoreError::Transient` so the
/// queue retries them.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> CoreResult<RenderedImage>;
}
