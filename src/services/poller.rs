use crate::db::{self, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::models::{DataStrategy, LifecycleState, PluginDefinition, PluginInstance};
use crate::services::merge_engine::{self, VARIABLES_KEY};
use crate::services::plugin_service::{PluginSettings, PollingSettings};
use crate::services::render_orchestrator::RenderOrchestrator;
use crate::services::{ingestion, settings_service};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

const POLL_TICK_SECS: u64 = 60;
const FETCH_TIMEOUT_SECS: u64 = 20;

/// A polling instance whose data is older than its refresh interval.
#[derive(Debug, Clone)]
pub struct DuePoll {
    pub instance_id: i32,
    pub settings: PollingSettings,
}

/// Polling instances that are servable and due at `now`.
pub fn due_polls(conn: &mut SqliteConnection, now: NaiveDateTime) -> CoreResult<Vec<DuePoll>> {
    use crate::schema::{plugin_definitions, plugin_instances};

    let active = LifecycleState::Active.as_str();
    let rows: Vec<(PluginInstance, PluginDefinition)> = plugin_instances::table
        .inner_join(plugin_definitions::table)
        .filter(plugin_definitions::data_strategy.eq(DataStrategy::Polling.as_str()))
        .filter(plugin_definitions::lifecycle_state.eq(active))
        .filter(plugin_instances::lifecycle_state.eq(active))
        .filter(plugin_instances::needs_config_update.eq(false))
        .select((PluginInstance::as_select(), PluginDefinition::as_select()))
        .load(conn)?;

    let mut due = Vec::new();
    for (instance, definition) in rows {
        let last = merge_engine::load_record(conn, instance.id)?.map(|r| r.updated_at);
        let fresh = last.is_some_and(|at| {
            now - at < ChronoDuration::seconds(instance.refresh_interval.max(1) as i64)
        });
        if fresh {
            continue;
        }
        match PluginSettings::for_instance(&definition, &instance) {
            Ok(PluginSettings::Polling(settings)) => due.push(DuePoll {
                instance_id: instance.id,
                settings,
            }),
            Ok(_) => {}
            Err(e) => tracing::warn!("Skipping poll for instance {}: {}", instance.id, e),
        }
    }
    Ok(due)
}

/// Wrap a fetched document as a merge payload. Objects become the variable
/// set as-is; anything else lands under `data`.
pub fn to_payload(document: Value) -> Value {
    let variables = match document {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    let mut payload = Map::new();
    payload.insert(VARIABLES_KEY.to_string(), Value::Object(variables));
    Value::Object(payload)
}

pub struct Poller {
    db: DbPool,
    orchestrator: Arc<RenderOrchestrator>,
    client: Client,
}

impl Poller {
    pub fn new(db: DbPool, orchestrator: Arc<RenderOrchestrator>) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| CoreError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            db,
            orchestrator,
            client,
        })
    }

    pub async fn fetch(&self, settings: &PollingSettings) -> CoreResult<Value> {
        let mut request = self.client.get(&settings.url);
        for (name, value) in &settings.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let res = request
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("poll of {} failed: {}", settings.url, e)))?;
        if !res.status().is_success() {
            return Err(CoreError::transient(format!(
                "poll of {} returned {}",
                settings.url,
                res.status()
            )));
        }

        let raw_text = res
            .text()
            .await
            .map_err(|e| CoreError::transient(format!("failed to read poll response: {}", e)))?;
        let stripped = json_comments::StripComments::new(raw_text.as_bytes());
        serde_json::from_reader(stripped)
            .map_err(|e| CoreError::data(format!("poll of {} returned invalid JSON: {}", settings.url, e)))
    }

    /// Fetch and merge every due instance once. Returns how many merged.
    pub async fn poll_due(&self) -> CoreResult<usize> {
        let due = db::with_conn(&self.db, |conn| due_polls(conn, Utc::now().naive_utc())).await?;

        let mut merged = 0;
        for poll in due {
            let document = match self.fetch(&poll.settings).await {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!("Polling instance {}: {}", poll.instance_id, e);
                    continue;
                }
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let instance_id = poll.instance_id;
            let result = db::with_conn(&self.db, move |conn| {
                let tunables = settings_service::load_tunables(conn)?;
                merge_engine::merge(
                    conn,
                    poll.instance_id,
                    &to_payload(document),
                    poll.settings.merge_strategy,
                    tunables.stream_limit(poll.settings.stream_limit),
                )?;
                orchestrator.enqueue(conn, ingestion::data_changed(poll.instance_id))?;
                Ok(())
            })
            .await;

            match result {
                Ok(()) => merged += 1,
                Err(e) => tracing::warn!("Merging poll result for instance {} failed: {}", instance_id, e),
            }
        }
        Ok(merged)
    }
}

pub async fn run(poller: Poller) {
    let mut tick = interval(Duration::from_secs(POLL_TICK_SECS));

    loop {
        tick.tick().await;

        match poller.poll_due().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Poller merged data for {} instances", n),
            Err(e) => tracing::error!("Poller error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::merge_engine::MergeStrategy;
    use crate::services::plugin_service;
    use crate::test_support::{self, TestDb};
    use serde_json::json;

    #[test]
    fn test_non_objects_are_wrapped() {
        assert_eq!(
            to_payload(json!({"temp": 21})),
            json!({"merge_variables": {"temp": 21}})
        );
        assert_eq!(
            to_payload(json!([1, 2])),
            json!({"merge_variables": {"data": [1, 2]}})
        );
    }

    #[test]
    fn test_due_polls_respects_refresh_interval() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let def = test_support::definition(&mut conn, "weather", "polling");
        let instance = plugin_service::create_instance(
            &mut conn,
            def.id,
            "weather",
            json!({"url": "https://api.example.com/now", "merge_strategy": "deep_merge"}),
            Some(300),
        )
        .unwrap();
        test_support::webhook_instance(&mut conn, "not-polled");

        let now = Utc::now().naive_utc();
        let due = due_polls(&mut conn, now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].instance_id, instance.id);
        assert_eq!(due[0].settings.merge_strategy, MergeStrategy::DeepMerge);

        merge_engine::merge(
            &mut conn,
            instance.id,
            &to_payload(json!({"temp": 20})),
            MergeStrategy::DeepMerge,
            10,
        )
        .unwrap();
        assert!(due_polls(&mut conn, now).unwrap().is_empty());
        assert_eq!(
            due_polls(&mut conn, now + ChronoDuration::seconds(301)).unwrap().len(),
            1
        );
    }
}
