use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub renderer: RendererConfig,
    #[serde(default)]
    pub render_queue: RenderQueueConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub https: Option<HttpsConfig>,
    /// Public base URL used when handing image links to devices.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    pub endpoint_url: String,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderQueueConfig {
    pub workers: usize,
    pub poll_interval_secs: u64,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub completed_retention_hours: i64,
}

impl Default for RenderQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_secs: 5,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            completed_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub freshness_secs: i64,
    pub render_wait_secs: u64,
    pub default_width: i32,
    pub default_height: i32,
    pub default_bit_depth: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 3600,
            render_wait_secs: 10,
            default_width: 800,
            default_height: 480,
            default_bit_depth: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub api_token: String,
}

fn default_pool_size() -> u32 {
    8
}

fn default_render_timeout() -> u64 {
    30
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.render_queue.workers == 0 {
            anyhow::bail!("render_queue.workers must be at least 1");
        }
        if self.render_queue.max_attempts < 1 {
            anyhow::bail!("render_queue.max_attempts must be at least 1");
        }
        if self.renderer.timeout_secs == 0 {
            anyhow::bail!("renderer.timeout_secs must be positive");
        }
        if self.admin.api_token.trim().is_empty() {
            anyhow::bail!("admin.api_token must not be empty");
        }
        Ok(())
    }

    pub fn default_template() -> &'static str {
        r#"[server]
host = "0.0.0.0"
port = 8080
# public_url = "https://inkstand.example.com"

[server.https]
enabled = false
cert_path = "certs/cert.pem"
key_path = "certs/key.pem"

[database]
# URL for the SQLite database. Ensure the directory exists.
url = "inkstand.db"
pool_size = 8

[logging]
level = "info"

[storage]
# Rendered bitmaps are written here and served under /images.
directory = "data/rendered"

[renderer]
endpoint_url = "http://127.0.0.1:3000/render"
timeout_secs = 30

[render_queue]
workers = 4
poll_interval_secs = 5
max_attempts = 5
backoff_base_secs = 30
backoff_max_secs = 3600
completed_retention_hours = 24

[display]
# Cached content older than this triggers a render on device poll.
freshness_secs = 3600
render_wait_secs = 10
default_width = 800
default_height = 480
default_bit_depth = 1

[admin]
api_token = "change-me-in-production"
"#
    }
}
