use crate::error::{CoreError, CoreResult};
use crate::models::{
    DataStrategy, LifecycleState, NewPluginDefinition, NewPluginInstance, PluginDefinition,
    PluginInstance,
};
use crate::services::merge_engine::{self, MergeStrategy, DEFAULT_STREAM_LIMIT, VARIABLES_KEY};
use crate::services::{content_cache, playlist_service, render_queue, settings_service};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WebhookSettings {
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    pub stream_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingSettings {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    pub stream_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StaticSettings {
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Instance settings decoded against the definition's data strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginSettings {
    Webhook(WebhookSettings),
    Polling(PollingSettings),
    Static(StaticSettings),
}

impl PluginSettings {
    pub fn decode(strategy: DataStrategy, raw: &Value) -> CoreResult<Self> {
        let raw = if raw.is_null() {
            Value::Object(Map::new())
        } else {
            raw.clone()
        };
        let invalid = |e: serde_json::Error| {
            CoreError::config(format!("invalid {} settings: {}", strategy.as_str(), e))
        };

        let settings = match strategy {
            DataStrategy::Webhook => PluginSettings::Webhook(serde_json::from_value(raw).map_err(invalid)?),
            DataStrategy::Polling => PluginSettings::Polling(serde_json::from_value(raw).map_err(invalid)?),
            DataStrategy::Static => PluginSettings::Static(serde_json::from_value(raw).map_err(invalid)?),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Decode an instance's stored settings.
    pub fn for_instance(definition: &PluginDefinition, instance: &PluginInstance) -> CoreResult<Self> {
        let strategy = definition.strategy().ok_or_else(|| {
            CoreError::config(format!(
                "definition {} has unknown data strategy '{}'",
                definition.id, definition.data_strategy
            ))
        })?;
        let raw: Value = serde_json::from_str(&instance.settings)?;
        Self::decode(strategy, &raw)
    }

    fn validate(&self) -> CoreResult<()> {
        match self {
            PluginSettings::Polling(polling) => {
                let parsed = url::Url::parse(&polling.url).map_err(|e| {
                    CoreError::config(format!("invalid polling url '{}': {}", polling.url, e))
                })?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(CoreError::config(format!(
                        "polling url must be http or https, got '{}'",
                        parsed.scheme()
                    )));
                }
                Ok(())
            }
            PluginSettings::Webhook(_) | PluginSettings::Static(_) => Ok(()),
        }
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        match self {
            PluginSettings::Webhook(s) => s.merge_strategy,
            PluginSettings::Polling(s) => s.merge_strategy,
            PluginSettings::Static(_) => MergeStrategy::Default,
        }
    }

    pub fn stream_limit(&self) -> Option<i64> {
        match self {
            PluginSettings::Webhook(s) => s.stream_limit,
            PluginSettings::Polling(s) => s.stream_limit,
            PluginSettings::Static(_) => None,
        }
    }

    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(match self {
            PluginSettings::Webhook(s) => serde_json::to_value(s)?,
            PluginSettings::Polling(s) => serde_json::to_value(s)?,
            PluginSettings::Static(s) => serde_json::to_value(s)?,
        })
    }
}

pub fn create_definition(
    conn: &mut SqliteConnection,
    new_definition: NewPluginDefinition,
) -> CoreResult<PluginDefinition> {
    use crate::schema::plugin_definitions;

    if new_definition.identifier.trim().is_empty() {
        return Err(CoreError::data("definition identifier must not be empty"));
    }
    new_definition
        .data_strategy
        .parse::<DataStrategy>()
        .map_err(CoreError::config)?;

    Ok(diesel::insert_into(plugin_definitions::table)
        .values(&new_definition)
        .returning(PluginDefinition::as_select())
        .get_result(conn)?)
}

pub fn get_definition(conn: &mut SqliteConnection, definition_id: i32) -> CoreResult<PluginDefinition> {
    use crate::schema::plugin_definitions::dsl::*;

    plugin_definitions
        .find(definition_id)
        .select(PluginDefinition::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("plugin definition {}", definition_id)))
}

pub fn get_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<PluginInstance> {
    use crate::schema::plugin_instances::dsl::*;

    plugin_instances
        .find(instance_id)
        .select(PluginInstance::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("plugin instance {}", instance_id)))
}

pub fn list_instances(conn: &mut SqliteConnection) -> CoreResult<Vec<PluginInstance>> {
    use crate::schema::plugin_instances::dsl::*;

    Ok(plugin_instances
        .order(id.asc())
        .select(PluginInstance::as_select())
        .load(conn)?)
}

/// Instance plus its definition, for callers that need both.
pub fn get_instance_with_definition(
    conn: &mut SqliteConnection,
    instance_id: i32,
) -> CoreResult<(PluginInstance, PluginDefinition)> {
    use crate::schema::{plugin_definitions, plugin_instances};

    plugin_instances::table
        .inner_join(plugin_definitions::table)
        .filter(plugin_instances::id.eq(instance_id))
        .select((PluginInstance::as_select(), PluginDefinition::as_select()))
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("plugin instance {}", instance_id)))
}

fn check_refresh_interval(value: i32) -> CoreResult<i32> {
    if value <= 0 {
        return Err(CoreError::data(format!(
            "refresh_interval must be positive, got {}",
            value
        )));
    }
    Ok(value)
}

/// Store static data as the instance's merge record. Runs inside the
/// caller's transaction.
fn seed_static_data(
    conn: &mut SqliteConnection,
    instance_id: i32,
    settings: &PluginSettings,
) -> CoreResult<()> {
    if let PluginSettings::Static(static_settings) = settings {
        let payload = serde_json::json!({ VARIABLES_KEY: static_settings.data });
        merge_engine::apply_merge(
            conn,
            instance_id,
            &payload,
            MergeStrategy::Default,
            DEFAULT_STREAM_LIMIT,
        )?;
    }
    Ok(())
}

pub fn create_instance(
    conn: &mut SqliteConnection,
    definition: i32,
    instance_name: &str,
    raw_settings: Value,
    interval: Option<i32>,
) -> CoreResult<PluginInstance> {
    use crate::schema::plugin_instances;

    let owner = get_definition(conn, definition)?;
    if owner.lifecycle() != LifecycleState::Active {
        return Err(CoreError::consistency(format!(
            "plugin definition {} is {}",
            owner.id,
            owner.lifecycle().as_str()
        )));
    }
    let strategy = owner.strategy().ok_or_else(|| {
        CoreError::config(format!("unknown data strategy '{}'", owner.data_strategy))
    })?;
    let settings = PluginSettings::decode(strategy, &raw_settings)?;

    let refresh = match interval {
        Some(value) => check_refresh_interval(value)?,
        None => settings_service::load_tunables(conn)?.default_refresh_interval_secs,
    };

    let stored_settings = serde_json::to_string(&settings.to_value()?)?;
    let instance = conn.immediate_transaction(|conn| {
        let instance = diesel::insert_into(plugin_instances::table)
            .values(&NewPluginInstance {
                definition_id: owner.id,
                name: instance_name.to_string(),
                settings: stored_settings,
                refresh_interval: refresh,
            })
            .returning(PluginInstance::as_select())
            .get_result(conn)?;
        seed_static_data(conn, instance.id, &settings)?;
        Ok::<_, CoreError>(instance)
    })?;

    tracing::info!(
        "Created {} plugin instance {} ({})",
        strategy.as_str(),
        instance.id,
        instance.name
    );
    Ok(instance)
}

/// Replace an instance's settings. Clears `needs_config_update`.
pub fn configure_instance(
    conn: &mut SqliteConnection,
    instance_id: i32,
    raw_settings: Value,
    interval: Option<i32>,
) -> CoreResult<PluginInstance> {
    use crate::schema::plugin_instances::dsl::*;

    let (instance, definition) = get_instance_with_definition(conn, instance_id)?;
    if instance.lifecycle() != LifecycleState::Active {
        return Err(CoreError::consistency(format!(
            "plugin instance {} is {}",
            instance_id,
            instance.lifecycle().as_str()
        )));
    }
    let strategy = definition.strategy().ok_or_else(|| {
        CoreError::config(format!("unknown data strategy '{}'", definition.data_strategy))
    })?;
    let decoded = PluginSettings::decode(strategy, &raw_settings)?;
    let refresh = match interval {
        Some(value) => check_refresh_interval(value)?,
        None => instance.refresh_interval,
    };

    let stored_settings = serde_json::to_string(&decoded.to_value()?)?;
    conn.immediate_transaction(|conn| {
        let updated = diesel::update(plugin_instances.find(instance_id))
            .set((
                settings.eq(stored_settings),
                refresh_interval.eq(refresh),
                needs_config_update.eq(false),
                updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(PluginInstance::as_select())
            .get_result(conn)?;
        seed_static_data(conn, instance_id, &decoded)?;
        Ok(updated)
    })
}

/// Record a schema change on a definition. Every instance must be
/// reconfigured before it is scheduled again.
pub fn mark_definition_changed(conn: &mut SqliteConnection, definition: i32) -> CoreResult<usize> {
    use crate::schema::{plugin_definitions, plugin_instances};

    conn.immediate_transaction(|conn| {
        let now = Utc::now().naive_utc();
        let bumped = diesel::update(plugin_definitions::table.find(definition))
            .set((
                plugin_definitions::version.eq(plugin_definitions::version + 1),
                plugin_definitions::updated_at.eq(now),
            ))
            .execute(conn)?;
        if bumped == 0 {
            return Err(CoreError::not_found(format!("plugin definition {}", definition)));
        }

        let flagged = diesel::update(
            plugin_instances::table.filter(plugin_instances::definition_id.eq(definition)),
        )
        .set((
            plugin_instances::needs_config_update.eq(true),
            plugin_instances::updated_at.eq(now),
        ))
        .execute(conn)?;

        tracing::info!(
            "Definition {} changed, {} instances need reconfiguration",
            definition,
            flagged
        );
        Ok(flagged)
    })
}

fn set_instance_state(
    conn: &mut SqliteConnection,
    instance_id: i32,
    state: LifecycleState,
) -> CoreResult<PluginInstance> {
    use crate::schema::plugin_instances::dsl::*;

    let updated = diesel::update(plugin_instances.find(instance_id))
        .set((
            lifecycle_state.eq(state.as_str()),
            updated_at.eq(Utc::now().naive_utc()),
        ))
        .returning(PluginInstance::as_select())
        .get_result(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("plugin instance {}", instance_id)))?;

    if state != LifecycleState::Active {
        render_queue::cancel_for_instance(conn, instance_id)?;
    }
    Ok(updated)
}

pub fn deactivate_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<PluginInstance> {
    conn.immediate_transaction(|conn| set_instance_state(conn, instance_id, LifecycleState::Deactivated))
}

pub fn activate_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<PluginInstance> {
    conn.immediate_transaction(|conn| {
        let current = get_instance(conn, instance_id)?;
        if current.lifecycle() == LifecycleState::PurgeScheduled {
            return Err(CoreError::consistency(format!(
                "plugin instance {} is scheduled for purge",
                instance_id
            )));
        }
        set_instance_state(conn, instance_id, LifecycleState::Active)
    })
}

/// Hide the instance now; the cleanup sweep deletes it later.
pub fn schedule_purge_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<PluginInstance> {
    conn.immediate_transaction(|conn| set_instance_state(conn, instance_id, LifecycleState::PurgeScheduled))
}

/// Mark a definition and all its instances for purge.
pub fn schedule_purge_definition(conn: &mut SqliteConnection, definition: i32) -> CoreResult<()> {
    use crate::schema::{plugin_definitions, plugin_instances};

    conn.immediate_transaction(|conn| {
        let updated = diesel::update(plugin_definitions::table.find(definition))
            .set((
                plugin_definitions::lifecycle_state.eq(LifecycleState::PurgeScheduled.as_str()),
                plugin_definitions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("plugin definition {}", definition)));
        }

        let instance_ids: Vec<i32> = plugin_instances::table
            .filter(plugin_instances::definition_id.eq(definition))
            .select(plugin_instances::id)
            .load(conn)?;
        for instance_id in instance_ids {
            set_instance_state(conn, instance_id, LifecycleState::PurgeScheduled)?;
        }
        Ok(())
    })
}

/// Remove the instance and every row that references it. Jobs are
/// cancelled first so a worker mid-render discards its result. Returns
/// the bitmap files that no longer have an owner.
fn cascade_delete_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<Vec<String>> {
    use crate::schema::{playlist_items, plugin_instance_data, plugin_instances};

    render_queue::cancel_for_instance(conn, instance_id)?;
    render_queue::delete_for_instance(conn, instance_id)?;

    let playlists: Vec<i32> = playlist_items::table
        .filter(playlist_items::plugin_instance_id.eq(instance_id))
        .select(playlist_items::playlist_id)
        .distinct()
        .load(conn)?;
    diesel::delete(playlist_items::table.filter(playlist_items::plugin_instance_id.eq(instance_id)))
        .execute(conn)?;
    for playlist in playlists {
        playlist_service::compact(conn, playlist)?;
    }

    let orphaned = content_cache::delete_for_instance(conn, instance_id)?;
    diesel::delete(
        plugin_instance_data::table.filter(plugin_instance_data::plugin_instance_id.eq(instance_id)),
    )
    .execute(conn)?;
    diesel::delete(plugin_instances::table.find(instance_id)).execute(conn)?;

    tracing::info!("Deleted plugin instance {}", instance_id);
    Ok(orphaned)
}

pub fn delete_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<Vec<String>> {
    conn.immediate_transaction(|conn| {
        get_instance(conn, instance_id)?;
        cascade_delete_instance(conn, instance_id)
    })
}

pub fn delete_definition(conn: &mut SqliteConnection, definition: i32) -> CoreResult<Vec<String>> {
    use crate::schema::{plugin_definitions, plugin_instances};

    conn.immediate_transaction(|conn| {
        get_definition(conn, definition)?;
        let instance_ids: Vec<i32> = plugin_instances::table
            .filter(plugin_instances::definition_id.eq(definition))
            .select(plugin_instances::id)
            .load(conn)?;

        let mut orphaned = Vec::new();
        for instance_id in instance_ids {
            orphaned.extend(cascade_delete_instance(conn, instance_id)?);
        }
        diesel::delete(plugin_definitions::table.find(definition)).execute(conn)?;
        tracing::info!("Deleted plugin definition {}", definition);
        Ok(orphaned)
    })
}

/// Hard-delete everything marked `purge_scheduled`. Returns orphaned files.
pub fn purge_scheduled(conn: &mut SqliteConnection) -> CoreResult<Vec<String>> {
    use crate::schema::{plugin_definitions, plugin_instances};

    let purge = LifecycleState::PurgeScheduled.as_str();
    let mut orphaned = Vec::new();

    let definitions: Vec<i32> = plugin_definitions::table
        .filter(plugin_definitions::lifecycle_state.eq(purge))
        .select(plugin_definitions::id)
        .load(conn)?;
    for definition in definitions {
        orphaned.extend(delete_definition(conn, definition)?);
    }

    let instances: Vec<i32> = plugin_instances::table
        .filter(plugin_instances::lifecycle_state.eq(purge))
        .select(plugin_instances::id)
        .load(conn)?;
    for instance_id in instances {
        orphaned.extend(delete_instance(conn, instance_id)?);
    }

    Ok(orphaned)
}
