//! Shared fixtures for database-backed tests.

use crate::config::Config;
use crate::db::{self, DbConnection, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::models::{Device, NewDevice, NewPluginDefinition, PluginDefinition, PluginInstance};
use crate::services::renderer::{RenderRequest, RenderedImage, Renderer};
use crate::services::{device_service, image_store, playlist_service, plugin_service};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestDb {
    pub pool: DbPool,
    pub dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        let pool = db::create_pool(path.to_str().expect("utf8 path"), 4).expect("pool");
        db::run_migrations(&mut pool.get().expect("connection")).expect("migrations");
        Self { pool, dir }
    }

    pub fn conn(&self) -> DbConnection {
        self.pool.get().expect("connection")
    }

    pub fn storage_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("rendered")
    }
}

pub fn device(conn: &mut DbConnection, name: &str) -> Device {
    device_service::create_device(
        conn,
        NewDevice {
            name: name.to_string(),
            api_key: format!("key-{}", name),
            width: 800,
            height: 480,
            bit_depth: 1,
        },
    )
    .expect("device")
}

pub fn definition(conn: &mut DbConnection, identifier: &str, strategy: &str) -> PluginDefinition {
    plugin_service::create_definition(
        conn,
        NewPluginDefinition {
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            data_strategy: strategy.to_string(),
            template: "<div>{{ title }}</div>".to_string(),
        },
    )
    .expect("definition")
}

pub fn webhook_instance(conn: &mut DbConnection, name: &str) -> PluginInstance {
    let def = definition(conn, &format!("def-{}", name), "webhook");
    plugin_service::create_instance(conn, def.id, name, serde_json::json!({}), Some(600))
        .expect("instance")
}

/// Device with one visible playlist item pointing at a fresh webhook instance.
pub fn device_showing(conn: &mut DbConnection, name: &str) -> (Device, PluginInstance) {
    let device = device(conn, name);
    let instance = webhook_instance(conn, name);
    playlist_service::add_item(
        conn,
        device.id,
        playlist_service::ItemOptions::for_instance(instance.id),
    )
    .expect("playlist item");
    (device, instance)
}

/// Config from the shipped template, writing bitmaps into the test dir.
pub fn config(db: &TestDb) -> Config {
    let mut config: Config = toml::from_str(Config::default_template()).expect("template");
    config.storage.directory = db.storage_dir().to_string_lossy().into_owned();
    config.display.render_wait_secs = 2;
    config
}

/// In-process stand-in for the rendering service.
pub struct FakeRenderer {
    bytes: Mutex<Vec<u8>>,
    reported_hash: Mutex<Option<String>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: Mutex::new(bytes.to_vec()),
            reported_hash: Mutex::new(None),
            failing: AtomicBool::new(false),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_bytes(&self, bytes: &[u8]) {
        *self.bytes.lock().unwrap() = bytes.to_vec();
    }

    /// Report this hash instead of the real one, like a misbehaving service.
    pub fn set_reported_hash(&self, hash: &str) {
        *self.reported_hash.lock().unwrap() = Some(hash.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, _request: &RenderRequest) -> CoreResult<RenderedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::transient("fake renderer is down"));
        }
        let bytes = self.bytes.lock().unwrap().clone();
        let reported = self.reported_hash.lock().unwrap().clone();
        Ok(RenderedImage {
            content_hash: reported.unwrap_or_else(|| image_store::content_hash(&bytes)),
            bytes,
        })
    }
}
