use super::{RenderRequest, RenderedImage, Renderer};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::config::RendererConfig;
use crate::error::{CoreError, CoreResult};
use crate::services::image_store;

#[derive(Deserialize)]
struct RenderResponse {
    image_base64: String,
    content_hash: Option<String>,
}

/// Posts render requests to an external rendering service as JSON.
pub struct HttpRenderer {
    client: Client,
    endpoint_url: String,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> CoreResult<Self> {
        url::Url::parse(&config.endpoint_url).map_err(|e| {
            CoreError::config(format!(
                "invalid renderer endpoint '{}': {}",
                config.endpoint_url, e
            ))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoreError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, request: &RenderRequest) -> CoreResult<RenderedImage> {
        let res = self
            .client
            .post(&self.endpoint_url)
            .json(request)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("rendering service unreachable: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            return Err(CoreError::transient(format!(
                "rendering service returned {}: {}",
                status, error_text
            )));
        }

        let raw_text = res
            .text()
            .await
            .map_err(|e| CoreError::transient(format!("failed to read render response: {}", e)))?;

        // Parse JSON while stripping comments
        let stripped = json_comments::StripComments::new(raw_text.as_bytes());
        let body: RenderResponse = serde_json::from_reader(stripped).map_err(|e| {
            CoreError::transient(format!("malformed render response: {}", e))
        })?;

        let bytes = general_purpose::STANDARD
            .decode(body.image_base64.trim())
            .map_err(|e| CoreError::transient(format!("render response is not base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(CoreError::transient("rendering service returned an empty image"));
        }

        let content_hash = image_store::accept_hash(body.content_hash.as_deref(), &bytes);

        Ok(RenderedImage {
            bytes,
            content_hash,
        })
    }
}
