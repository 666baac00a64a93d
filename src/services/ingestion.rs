use crate::error::{CoreError, CoreResult};
use crate::models::DataStrategy;
use crate::services::merge_engine::{self, MergeStrategy};
use crate::services::plugin_service::{self, PluginSettings};
use crate::services::rate_limiter::RateLimiter;
use crate::services::render_queue::{EnqueueRequest, PRIORITY_DATA_CHANGE};
use crate::services::settings_service::Tunables;
use chrono::Utc;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;
use std::time::Duration;

/// A decoded webhook body: the payload itself plus the optional merge
/// overrides carried next to `merge_variables`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Value,
    pub merge_strategy: Option<MergeStrategy>,
    pub stream_limit: Option<i64>,
}

impl Envelope {
    pub fn parse(body: &[u8], max_bytes: usize) -> CoreResult<Self> {
        if body.len() > max_bytes {
            return Err(CoreError::PayloadTooLarge(body.len()));
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| CoreError::data(format!("body is not valid JSON: {}", e)))?;
        if !payload.is_object() {
            return Err(CoreError::data("body must be a JSON object"));
        }
        merge_engine::extract_variables(&payload)?;

        let merge_strategy = match payload.get("merge_strategy") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.parse::<MergeStrategy>()?),
            Some(_) => return Err(CoreError::config("merge_strategy must be a string")),
        };
        let stream_limit = match payload.get("stream_limit") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| CoreError::data("stream_limit must be an integer"))?,
            ),
        };

        Ok(Self {
            payload,
            merge_strategy,
            stream_limit,
        })
    }
}

/// Payload overrides win over the instance settings.
pub fn resolve_strategy(envelope: &Envelope, settings: &PluginSettings) -> (MergeStrategy, Option<i64>) {
    (
        envelope.merge_strategy.unwrap_or_else(|| settings.merge_strategy()),
        envelope.stream_limit.or_else(|| settings.stream_limit()),
    )
}

/// Render request issued after an instance's data changed.
pub fn data_changed(instance_id: i32) -> EnqueueRequest {
    EnqueueRequest {
        priority: PRIORITY_DATA_CHANGE,
        ..EnqueueRequest::routine(instance_id, Utc::now().naive_utc())
    }
}

pub fn check_rate(limiter: &RateLimiter, instance_id: i32, tunables: &Tunables) -> CoreResult<()> {
    let window = Duration::from_secs(tunables.webhook_rate_window_secs.max(1));
    limiter
        .check(&format!("webhook:{}", instance_id), tunables.webhook_rate_limit, window)
        .map_err(|retry_in| {
            tracing::warn!(
                "Webhook rate limit hit for instance {}, retry in {}s",
                instance_id,
                retry_in.as_secs()
            );
            CoreError::RateLimited(format!(
                "instance {} accepts {} updates per {}s, retry in {}s",
                instance_id,
                tunables.webhook_rate_limit,
                window.as_secs(),
                retry_in.as_secs()
            ))
        })
}

/// Validate and merge one webhook delivery. Rate and size are checked
/// before anything is parsed or written.
pub fn apply_webhook(
    conn: &mut SqliteConnection,
    limiter: &RateLimiter,
    tunables: &Tunables,
    instance_id: i32,
    body: &[u8],
) -> CoreResult<Value> {
    check_rate(limiter, instance_id, tunables)?;
    let envelope = Envelope::parse(body, tunables.webhook_max_payload_bytes)?;

    let (instance, definition) = plugin_service::get_instance_with_definition(conn, instance_id)?;
    if definition.strategy() != Some(DataStrategy::Webhook) {
        return Err(CoreError::config(format!(
            "plugin instance {} uses the {} strategy and does not accept webhooks",
            instance_id, definition.data_strategy
        )));
    }
    let settings = PluginSettings::for_instance(&definition, &instance)?;
    let (strategy, requested_limit) = resolve_strategy(&envelope, &settings);

    let merged = merge_engine::merge(
        conn,
        instance_id,
        &envelope.payload,
        strategy,
        tunables.stream_limit(requested_limit),
    )?;
    tracing::info!(
        "Webhook update merged into instance {} ({}, {} bytes)",
        instance_id,
        strategy,
        body.len()
    );
    Ok(merged)
}
