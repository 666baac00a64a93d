use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Device models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::devices)]
pub struct Device {
    pub id: i32,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
    pub last_playlist_item_id: Option<i32>,
    pub last_seen_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::devices)]
pub struct NewDevice {
    pub name: String,
    pub api_key: String,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
}

// Plugin definition models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::plugin_definitions)]
pub struct PluginDefinition {
    pub id: i32,
    pub identifier: String,
    pub name: String,
    pub data_strategy: String,
    pub template: String,
    pub version: i32,
    pub lifecycle_state: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PluginDefinition {
    pub fn strategy(&self) -> Option<DataStrategy> {
        self.data_strategy.parse().ok()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle_state.parse().unwrap_or(LifecycleState::Deactivated)
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::plugin_definitions)]
pub struct NewPluginDefinition {
    pub identifier: String,
    pub name: String,
    pub data_strategy: String,
    pub template: String,
}

// Plugin instance models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::plugin_instances)]
pub struct PluginInstance {
    pub id: i32,
    pub definition_id: i32,
    pub name: String,
    pub settings: String,
    pub refresh_interval: i32,
    pub needs_config_update: bool,
    pub lifecycle_state: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PluginInstance {
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle_state.parse().unwrap_or(LifecycleState::Deactivated)
    }

    /// Only active, fully configured instances may be shown or rendered.
    pub fn is_servable(&self) -> bool {
        self.lifecycle() == LifecycleState::Active && !self.needs_config_update
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::plugin_instances)]
pub struct NewPluginInstance {
    pub definition_id: i32,
    pub name: String,
    pub settings: String,
    pub refresh_interval: i32,
}

// Playlist models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::playlists)]
pub struct Playlist {
    pub id: i32,
    pub device_id: i32,
    pub name: String,
    pub is_default: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::playlists)]
pub struct NewPlaylist {
    pub device_id: i32,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize, PartialEq)]
#[diesel(table_name = crate::schema::playlist_items)]
pub struct PlaylistItem {
    pub id: i32,
    pub playlist_id: i32,
    pub plugin_instance_id: i32,
    pub order_index: i32,
    pub is_visible: bool,
    pub importance: bool,
    pub duration_override: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::playlist_items)]
pub struct NewPlaylistItem {
    pub playlist_id: i32,
    pub plugin_instance_id: i32,
    pub order_index: i32,
    pub is_visible: bool,
    pub importance: bool,
    pub duration_override: Option<i32>,
}

// Schedule models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize, PartialEq)]
#[diesel(table_name = crate::schema::schedules)]
pub struct Schedule {
    pub id: i32,
    pub playlist_item_id: i32,
    pub name: String,
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::schedules)]
pub struct NewSchedule {
    pub playlist_item_id: i32,
    pub name: String,
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub is_active: bool,
}

// Merge record
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::plugin_instance_data)]
pub struct PluginInstanceData {
    pub id: i32,
    pub plugin_instance_id: i32,
    pub merged_data: String,
    pub raw_data: String,
    pub merge_strategy: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::plugin_instance_data)]
pub struct NewPluginInstanceData {
    pub plugin_instance_id: i32,
    pub merged_data: String,
    pub raw_data: String,
    pub merge_strategy: String,
    pub updated_at: NaiveDateTime,
}

// Render queue models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::render_queue)]
pub struct RenderJob {
    pub id: i32,
    pub plugin_instance_id: i32,
    pub device_id: Option<i32>,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub status: String,
    pub independent_render: bool,
    pub attempts: i32,
    pub last_attempt: Option<NaiveDateTime>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl RenderJob {
    pub fn status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::render_queue)]
pub struct NewRenderJob {
    pub plugin_instance_id: i32,
    pub device_id: Option<i32>,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub status: String,
    pub independent_render: bool,
}

// Content cache models
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::rendered_content)]
pub struct RenderedContent {
    pub id: i32,
    pub plugin_instance_id: i32,
    pub device_id: Option<i32>,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
    pub image_path: String,
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub render_attempts: i32,
    pub rendered_at: NaiveDateTime,
    pub last_checked_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::rendered_content)]
pub struct NewRenderedContent {
    pub plugin_instance_id: i32,
    pub device_id: Option<i32>,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
    pub image_path: String,
    pub content_hash: String,
    pub render_attempts: i32,
    pub rendered_at: NaiveDateTime,
    pub last_checked_at: NaiveDateTime,
}

// Global Settings models
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::global_settings)]
pub struct GlobalSetting {
    pub id: i32,
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::global_settings)]
pub struct NewGlobalSetting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

/// Render queue entry states. Stored as text in `render_queue.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Failed entries may be re-armed while they are under the retry budget.
    pub fn can_transition(self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Deletion intent for definitions and instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Deactivated,
    PurgeScheduled,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Deactivated => "deactivated",
            LifecycleState::PurgeScheduled => "purge_scheduled",
        }
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "deactivated" => Ok(LifecycleState::Deactivated),
            "purge_scheduled" => Ok(LifecycleState::PurgeScheduled),
            other => Err(format!("unknown lifecycle state: {}", other)),
        }
    }
}

/// How a plugin definition sources its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStrategy {
    Webhook,
    Polling,
    Static,
}

impl DataStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DataStrategy::Webhook => "webhook",
            DataStrategy::Polling => "polling",
            DataStrategy::Static => "static",
        }
    }
}

impl FromStr for DataStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(DataStrategy::Webhook),
            "polling" => Ok(DataStrategy::Polling),
            "static" => Ok(DataStrategy::Static),
            other => Err(format!("unknown data strategy: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition(JobStatus::Cancelled));
        assert!(JobStatus::Failed.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition(JobStatus::Processing));
        assert!(!JobStatus::Pending.can_transition(JobStatus::Completed));
    }

    #[test]
    fn test_status_strings_parse_back() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert_eq!(
            "purge_scheduled".parse::<LifecycleState>().unwrap(),
            LifecycleState::PurgeScheduled
        );
    }
}
