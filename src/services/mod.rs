pub mod cleaning_service;
pub mod content_cache;
pub mod device_service;
pub mod display_service;
pub mod image_store;
pub mod ingestion;
pub mod merge_engine;
pub mod playlist_service;
pub mod plugin_service;
pub mod poller;
pub mod rate_limiter;
pub mod render_orchestrator;
pub mod render_queue;
pub mod renderer;
pub mod schedule_resolver;
pub mod settings_service;
