use crate::error::{CoreError, CoreResult};
use crate::models::{LifecycleState, NewPluginInstanceData, PluginInstance, PluginInstanceData};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_STREAM_LIMIT: usize = 10;

/// Key of the variable container inside an inbound payload.
pub const VARIABLES_KEY: &str = "merge_variables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Default,
    DeepMerge,
    Stream,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Default => "default",
            MergeStrategy::DeepMerge => "deep_merge",
            MergeStrategy::Stream => "stream",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "default" => Ok(MergeStrategy::Default),
            "deep_merge" => Ok(MergeStrategy::DeepMerge),
            "stream" => Ok(MergeStrategy::Stream),
            other => Err(CoreError::config(format!("unknown merge strategy '{}'", other))),
        }
    }
}

/// Extract the declared variable set from a raw payload.
pub fn extract_variables(raw: &Value) -> CoreResult<&Map<String, Value>> {
    match raw.get(VARIABLES_KEY) {
        Some(Value::Object(vars)) => Ok(vars),
        Some(_) => Err(CoreError::data(format!("'{}' must be a JSON object", VARIABLES_KEY))),
        None => Err(CoreError::data(format!("payload is missing '{}'", VARIABLES_KEY))),
    }
}

/// Fold `incoming` into `existing` under `strategy`. Pure; the caller
/// persists the result.
pub fn merge_values(
    existing: Option<&Value>,
    incoming: &Map<String, Value>,
    strategy: MergeStrategy,
    stream_limit: usize,
) -> Value {
    let mut base = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    match strategy {
        MergeStrategy::Default => return Value::Object(incoming.clone()),
        MergeStrategy::DeepMerge => deep_merge(&mut base, incoming),
        MergeStrategy::Stream => stream_append(&mut base, incoming, stream_limit.max(1)),
    }

    Value::Object(base)
}

fn deep_merge(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, new_value) in incoming {
        match (target.get_mut(key), new_value) {
            (Some(Value::Object(old)), Value::Object(new)) => deep_merge(old, new),
            _ => {
                target.insert(key.clone(), new_value.clone());
            }
        }
    }
}

fn stream_append(target: &mut Map<String, Value>, incoming: &Map<String, Value>, limit: usize) {
    for (key, new_value) in incoming {
        let mut series = match target.remove(key) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };

        match new_value {
            Value::Array(items) => series.extend(items.iter().cloned()),
            other => series.push(other.clone()),
        }

        if series.len() > limit {
            series.drain(..series.len() - limit);
        }
        target.insert(key.clone(), Value::Array(series));
    }
}

/// Current merge record for an instance, if any data has arrived yet.
pub fn load_record(
    conn: &mut SqliteConnection,
    instance_id: i32,
) -> CoreResult<Option<PluginInstanceData>> {
    use crate::schema::plugin_instance_data::dsl;

    Ok(dsl::plugin_instance_data
        .filter(dsl::plugin_instance_id.eq(instance_id))
        .select(PluginInstanceData::as_select())
        .first(conn)
        .optional()?)
}

/// Merged data for rendering; an instance without a record renders with
/// an empty object.
pub fn current_data(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<Value> {
    match load_record(conn, instance_id)? {
        Some(record) => Ok(serde_json::from_str(&record.merged_data)?),
        None => Ok(Value::Object(Map::new())),
    }
}

/// Merge(instance, payload, strategy). Computes fully in memory and
/// upserts once inside a write-locked transaction so concurrent merges
/// for one instance apply one after another.
pub fn merge(
    conn: &mut SqliteConnection,
    instance_id: i32,
    raw_payload: &Value,
    strategy: MergeStrategy,
    stream_limit: usize,
) -> CoreResult<Value> {
    conn.immediate_transaction(|conn| apply_merge(conn, instance_id, raw_payload, strategy, stream_limit))
}

/// Merge body for callers that already hold the write transaction.
pub fn apply_merge(
    conn: &mut SqliteConnection,
    instance_id: i32,
    raw_payload: &Value,
    strategy: MergeStrategy,
    stream_limit: usize,
) -> CoreResult<Value> {
    use crate::schema::plugin_instance_data::dsl;
    use crate::schema::plugin_instances;

    let incoming = extract_variables(raw_payload)?;

    let instance: PluginInstance = plugin_instances::table
        .find(instance_id)
        .select(PluginInstance::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("plugin instance {}", instance_id)))?;

    if instance.lifecycle() != LifecycleState::Active {
        return Err(CoreError::consistency(format!(
            "plugin instance {} is {}",
            instance_id,
            instance.lifecycle().as_str()
        )));
    }
    if instance.needs_config_update {
        return Err(CoreError::config(format!(
            "plugin instance {} requires reconfiguration",
            instance_id
        )));
    }

    let existing = match load_record(conn, instance_id)? {
        Some(record) => Some(serde_json::from_str::<Value>(&record.merged_data)?),
        None => None,
    };

    let merged = merge_values(existing.as_ref(), incoming, strategy, stream_limit);
    let merged_text = serde_json::to_string(&merged)?;
    let raw_text = serde_json::to_string(raw_payload)?;
    let now = Utc::now().naive_utc();

    diesel::insert_into(dsl::plugin_instance_data)
        .values(&NewPluginInstanceData {
            plugin_instance_id: instance_id,
            merged_data: merged_text.clone(),
            raw_data: raw_text.clone(),
            merge_strategy: strategy.as_str().to_string(),
            updated_at: now,
        })
        .on_conflict(dsl::plugin_instance_id)
        .do_update()
        .set((
            dsl::merged_data.eq(&merged_text),
            dsl::raw_data.eq(&raw_text),
            dsl::merge_strategy.eq(strategy.as_str()),
            dsl::updated_at.eq(now),
        ))
        .execute(conn)?;

    tracing::debug!(
        "Merged data for plugin instance {} using {}",
        instance_id,
        strategy
    );

    Ok(merged)
}
