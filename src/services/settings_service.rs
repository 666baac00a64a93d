use crate::error::CoreResult;
use crate::models::{GlobalSetting, NewGlobalSetting};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::HashMap;
use std::str::FromStr;

pub const MERGE_STREAM_LIMIT: &str = "merge_stream_limit";
pub const MERGE_STREAM_MAX_LIMIT: &str = "merge_stream_max_limit";
pub const WEBHOOK_RATE_LIMIT: &str = "webhook_rate_limit";
pub const WEBHOOK_RATE_WINDOW_SECS: &str = "webhook_rate_window_secs";
pub const WEBHOOK_MAX_PAYLOAD_BYTES: &str = "webhook_max_payload_bytes";
pub const DEFAULT_REFRESH_INTERVAL_SECS: &str = "default_refresh_interval_secs";
pub const DEFAULT_REFRESH_RATE_SECS: &str = "default_refresh_rate_secs";

// (key, default value, description)
pub const DEFAULT_SETTINGS: &[(&str, &str, &str)] = &[
    (
        MERGE_STREAM_LIMIT,
        "10",
        "Elements kept per key by the stream merge strategy.",
    ),
    (
        MERGE_STREAM_MAX_LIMIT,
        "500",
        "Upper bound for a stream_limit supplied in a webhook payload.",
    ),
    (
        WEBHOOK_RATE_LIMIT,
        "30",
        "Webhook requests accepted per plugin instance per window.",
    ),
    (
        WEBHOOK_RATE_WINDOW_SECS,
        "3600",
        "Length of the webhook rate limit window in seconds.",
    ),
    (
        WEBHOOK_MAX_PAYLOAD_BYTES,
        "5120",
        "Largest accepted webhook body in bytes.",
    ),
    (
        DEFAULT_REFRESH_INTERVAL_SECS,
        "900",
        "Refresh interval for new plugin instances that do not set one.",
    ),
    (
        DEFAULT_REFRESH_RATE_SECS,
        "900",
        "Seconds a device sleeps between polls unless an item overrides it.",
    ),
];

/// Typed view over the key/value settings table.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub merge_stream_limit: usize,
    pub merge_stream_max_limit: usize,
    pub webhook_rate_limit: u32,
    pub webhook_rate_window_secs: u64,
    pub webhook_max_payload_bytes: usize,
    pub default_refresh_interval_secs: i32,
    pub default_refresh_rate_secs: i32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            merge_stream_limit: 10,
            merge_stream_max_limit: 500,
            webhook_rate_limit: 30,
            webhook_rate_window_secs: 3600,
            webhook_max_payload_bytes: 5120,
            default_refresh_interval_secs: 900,
            default_refresh_rate_secs: 900,
        }
    }
}

impl Tunables {
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let defaults = Tunables::default();
        Self {
            merge_stream_limit: read(pairs, MERGE_STREAM_LIMIT, defaults.merge_stream_limit),
            merge_stream_max_limit: read(
                pairs,
                MERGE_STREAM_MAX_LIMIT,
                defaults.merge_stream_max_limit,
            ),
            webhook_rate_limit: read(pairs, WEBHOOK_RATE_LIMIT, defaults.webhook_rate_limit),
            webhook_rate_window_secs: read(
                pairs,
                WEBHOOK_RATE_WINDOW_SECS,
                defaults.webhook_rate_window_secs,
            ),
            webhook_max_payload_bytes: read(
                pairs,
                WEBHOOK_MAX_PAYLOAD_BYTES,
                defaults.webhook_max_payload_bytes,
            ),
            default_refresh_interval_secs: read(
                pairs,
                DEFAULT_REFRESH_INTERVAL_SECS,
                defaults.default_refresh_interval_secs,
            ),
            default_refresh_rate_secs: read(
                pairs,
                DEFAULT_REFRESH_RATE_SECS,
                defaults.default_refresh_rate_secs,
            ),
        }
    }

    /// Stream limit for one merge: the payload's override clamped to
    /// `1..=merge_stream_max_limit`, else the configured default.
    pub fn stream_limit(&self, requested: Option<i64>) -> usize {
        let max = self.merge_stream_max_limit.max(1);
        match requested {
            Some(n) if n >= 1 => (n as usize).min(max),
            _ => self.merge_stream_limit.clamp(1, max),
        }
    }
}

fn read<T: FromStr + Copy>(pairs: &HashMap<String, String>, key: &str, default: T) -> T {
    match pairs.get(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Setting '{}' has unparseable value '{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

pub fn list_settings(conn: &mut SqliteConnection) -> CoreResult<Vec<GlobalSetting>> {
    use crate::schema::global_settings::dsl::*;

    Ok(global_settings
        .order(key.asc())
        .select(GlobalSetting::as_select())
        .load(conn)?)
}

pub fn load_tunables(conn: &mut SqliteConnection) -> CoreResult<Tunables> {
    let pairs: HashMap<String, String> = list_settings(conn)?
        .into_iter()
        .map(|s| (s.key, s.value))
        .collect();
    Ok(Tunables::from_pairs(&pairs))
}

pub fn upsert_setting(
    conn: &mut SqliteConnection,
    setting_key: &str,
    new_value: &str,
    new_description: Option<String>,
) -> CoreResult<GlobalSetting> {
    use crate::schema::global_settings::dsl::*;

    let exists = global_settings
        .filter(key.eq(setting_key))
        .select(GlobalSetting::as_select())
        .first(conn)
        .optional()?;

    let setting = if let Some(current) = exists {
        diesel::update(global_settings.filter(key.eq(setting_key)))
            .set((
                value.eq(new_value),
                description.eq(new_description.or(current.description)),
                updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(GlobalSetting::as_select())
            .get_result(conn)?
    } else {
        diesel::insert_into(global_settings)
            .values(&NewGlobalSetting {
                key: setting_key.to_string(),
                value: new_value.to_string(),
                description: new_description,
            })
            .returning(GlobalSetting::as_select())
            .get_result(conn)?
    };

    Ok(setting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestDb;

    #[test]
    fn test_unparseable_values_fall_back() {
        let mut pairs = HashMap::new();
        pairs.insert(MERGE_STREAM_LIMIT.to_string(), "twenty".to_string());
        pairs.insert(WEBHOOK_RATE_LIMIT.to_string(), " 5 ".to_string());
        let tunables = Tunables::from_pairs(&pairs);
        assert_eq!(tunables.merge_stream_limit, 10);
        assert_eq!(tunables.webhook_rate_limit, 5);
    }

    #[test]
    fn test_stream_limit_override_is_clamped() {
        let tunables = Tunables {
            merge_stream_max_limit: 50,
            ..Tunables::default()
        };
        assert_eq!(tunables.stream_limit(None), 10);
        assert_eq!(tunables.stream_limit(Some(3)), 3);
        assert_eq!(tunables.stream_limit(Some(0)), 10);
        assert_eq!(tunables.stream_limit(Some(-4)), 10);
        assert_eq!(tunables.stream_limit(Some(10_000)), 50);
    }

    #[test]
    fn test_upsert_then_load() {
        let db = TestDb::new();
        let mut conn = db.conn();
        upsert_setting(&mut conn, MERGE_STREAM_LIMIT, "25", None).unwrap();
        upsert_setting(&mut conn, MERGE_STREAM_LIMIT, "30", None).unwrap();
        let tunables = load_tunables(&mut conn).unwrap();
        assert_eq!(tunables.merge_stream_limit, 30);
        assert_eq!(list_settings(&mut conn).unwrap().len(), 1);
    }
}
