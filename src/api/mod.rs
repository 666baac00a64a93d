pub mod devices_api;
pub mod display_api;
pub mod jobs_api;
pub mod plugins_api;
pub mod settings_api;
pub mod webhook_api;

use crate::AppState;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

pub fn routes(state: AppState) -> Router<AppState> {
    let admin_routes = Router::new()
        // Devices and playlists
        .route("/devices", get(devices_api::list_devices))
        .route("/devices", post(devices_api::create_device))
        .route("/devices/:id/playlist", get(devices_api::list_playlist))
        .route("/devices/:id/playlist", post(devices_api::add_playlist_item))
        .route(
            "/playlist_items/:id",
            put(devices_api::move_playlist_item).delete(devices_api::remove_playlist_item),
        )
        .route("/playlist_items/:id/schedules", post(devices_api::add_schedule))
        // Plugin definitions
        .route("/plugin_definitions", post(plugins_api::create_definition))
        .route(
            "/plugin_definitions/:id",
            delete(plugins_api::delete_definition),
        )
        .route(
            "/plugin_definitions/:id/changed",
            post(plugins_api::mark_definition_changed),
        )
        .route(
            "/plugin_definitions/:id/purge",
            post(plugins_api::schedule_definition_purge),
        )
        .route(
            "/plugin_definitions/:id/instances",
            post(plugins_api::create_instance),
        )
        // Plugin instances
        .route("/plugin_instances", get(plugins_api::list_instances))
        .route(
            "/plugin_instances/:id",
            put(plugins_api::configure_instance).delete(plugins_api::delete_instance),
        )
        .route(
            "/plugin_instances/:id/activate",
            post(plugins_api::activate_instance),
        )
        .route(
            "/plugin_instances/:id/deactivate",
            post(plugins_api::deactivate_instance),
        )
        .route(
            "/plugin_instances/:id/purge",
            post(plugins_api::schedule_instance_purge),
        )
        .route(
            "/plugin_instances/:id/preview",
            post(plugins_api::preview_instance),
        )
        // Render queue
        .route("/render_jobs/failed", get(jobs_api::list_failed))
        .route("/render_jobs/:id", get(jobs_api::get_job))
        .route("/render_jobs/:id/retry", post(jobs_api::retry_job))
        .route("/render_jobs/:id/cancel", post(jobs_api::cancel_job))
        // Settings
        .route("/settings", get(settings_api::list_settings))
        .route("/settings/:key", put(settings_api::update_setting))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::auth::middleware::admin_middleware,
        ));

    Router::new()
        // Device and integration endpoints
        .route("/display", get(display_api::get_display))
        .route("/custom_plugins/:id", post(webhook_api::receive_webhook))
        .nest("/admin", admin_routes)
}
