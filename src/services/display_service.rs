use crate::config::DisplayConfig;
use crate::db::{self, DbPool};
use crate::error::CoreResult;
use crate::models::{Device, JobStatus, RenderedContent};
use crate::services::render_orchestrator::RenderOrchestrator;
use crate::services::schedule_resolver::{self, PlaylistEntry};
use crate::services::{content_cache, device_service, settings_service};
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What a device should show until its next poll.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayFrame {
    pub playlist_item_id: Option<i32>,
    pub plugin_instance_id: Option<i32>,
    /// File name under the image store root; `None` when nothing is cached.
    pub image_path: Option<String>,
    pub content_hash: Option<String>,
    pub rendered_at: Option<NaiveDateTime>,
    /// Seconds the device should sleep before polling again.
    pub refresh_rate: i32,
    pub stale: bool,
}

impl DisplayFrame {
    fn empty(refresh_rate: i32) -> Self {
        Self {
            playlist_item_id: None,
            plugin_instance_id: None,
            image_path: None,
            content_hash: None,
            rendered_at: None,
            refresh_rate,
            stale: false,
        }
    }
}

/// Round-robin over the eligible set: the item after the one shown last,
/// or the first item when the last one is no longer eligible.
pub fn pick_next(entries: &[PlaylistEntry], last_shown: Option<i32>) -> Option<&PlaylistEntry> {
    if entries.is_empty() {
        return None;
    }
    let next = last_shown
        .and_then(|shown| entries.iter().position(|e| e.item.id == shown))
        .map(|idx| (idx + 1) % entries.len())
        .unwrap_or(0);
    entries.get(next)
}

struct Selection {
    item_id: i32,
    instance_id: i32,
    refresh_rate: i32,
    cached: Option<RenderedContent>,
}

/// Answer one device poll. Stale or missing content triggers an urgent
/// render that is awaited up to `render_wait_secs`; if that does not
/// produce anything the most recent bitmap is served as-is.
pub async fn serve_poll(
    pool: &DbPool,
    orchestrator: &RenderOrchestrator,
    display: &DisplayConfig,
    device: &Device,
) -> CoreResult<DisplayFrame> {
    let (device_id, last_shown) = (device.id, device.last_playlist_item_id);

    let (selection, default_rate) = db::with_conn(pool, move |conn| {
        let tunables = settings_service::load_tunables(conn)?;
        let active = schedule_resolver::active_items(conn, device_id, Utc::now())?;
        let selection = match pick_next(&active, last_shown) {
            Some(entry) => Some(Selection {
                item_id: entry.item.id,
                instance_id: entry.instance.id,
                refresh_rate: entry
                    .item
                    .duration_override
                    .unwrap_or(tunables.default_refresh_rate_secs),
                cached: content_cache::get_for_device(conn, entry.instance.id, device_id)?,
            }),
            None => None,
        };
        if selection.is_none() {
            device_service::record_poll(conn, device_id, None)?;
        }
        Ok((selection, tunables.default_refresh_rate_secs))
    })
    .await?;

    let Some(selection) = selection else {
        tracing::debug!("Device {} has nothing eligible to show", device_id);
        return Ok(DisplayFrame::empty(default_rate));
    };

    let now = Utc::now().naive_utc();
    let needs_render = match &selection.cached {
        Some(content) => content_cache::is_stale(content, now, display.freshness_secs),
        None => true,
    };

    let mut content = selection.cached;
    if needs_render {
        let wait = Duration::from_secs(display.render_wait_secs);
        let outcome = orchestrator
            .request_render_and_wait(selection.instance_id, Some(device_id), wait)
            .await?;
        tracing::debug!(
            "On-demand render of instance {} for device {} ended as {:?}",
            selection.instance_id,
            device_id,
            outcome
        );
        if outcome == Some(JobStatus::Completed) {
            let instance_id = selection.instance_id;
            if let Some(fresh) = db::with_conn(pool, move |conn| {
                content_cache::get_for_device(conn, instance_id, device_id)
            })
            .await?
            {
                content = Some(fresh);
            }
        }
    }

    let item_id = selection.item_id;
    db::with_conn(pool, move |conn| device_service::record_poll(conn, device_id, Some(item_id))).await?;

    let frame = match content {
        Some(content) => DisplayFrame {
            playlist_item_id: Some(selection.item_id),
            plugin_instance_id: Some(selection.instance_id),
            stale: content_cache::is_stale(&content, Utc::now().naive_utc(), display.freshness_secs),
            image_path: Some(content.image_path),
            content_hash: Some(content.content_hash),
            rendered_at: Some(content.rendered_at),
            refresh_rate: selection.refresh_rate,
        },
        None => {
            tracing::warn!(
                "No bitmap available for instance {} on device {}",
                selection.instance_id,
                device_id
            );
            DisplayFrame {
                playlist_item_id: Some(selection.item_id),
                plugin_instance_id: Some(selection.instance_id),
                ..DisplayFrame::empty(selection.refresh_rate)
            }
        }
    };
    Ok(frame)
}
