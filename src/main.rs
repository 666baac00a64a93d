mod api;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod schema;
mod seeding;
mod services;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use axum::Router;

use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::DbPool;
use crate::services::poller::{self, Poller};
use crate::services::rate_limiter::RateLimiter;
use crate::services::render_orchestrator::RenderOrchestrator;
use crate::services::renderer::HttpRenderer;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub rate_limiter: Arc<RateLimiter>,
    pub orchestrator: Arc<RenderOrchestrator>,
}

use clap::Parser;

#[derive(Parser)]
#[command(version, author = "INKSTAND AUTHORS", about = "Inkstand Server\nLicensed under AGPLv3\nCreated by INKSTAND AUTHORS", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Generate a default configuration template to stdout
    #[arg(long)]
    generate_config: bool,
}

fn run_onboarding() -> Result<Config> {
    use dialoguer::{theme::ColorfulTheme, Input};

    println!("Welcome to Inkstand Server!");
    println!("It looks like you don't have a configuration file yet.");
    println!("Let's get you set up.\n");

    let host: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Server Host")
        .default("0.0.0.0".to_string())
        .interact_text()?;

    let port: u16 = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Server Port")
        .default(8080)
        .interact_text()?;

    let db_url: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Database URL")
        .default("inkstand.db".to_string())
        .interact_text()?;

    let renderer_url: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Rendering service URL")
        .default("http://127.0.0.1:3000/render".to_string())
        .interact_text()?;

    let admin_token = uuid::Uuid::new_v4().to_string();

    let config_content = format!(
        r#"[server]
host = "{}"
port = {}

[server.https]
enabled = false
cert_path = "certs/cert.pem"
key_path = "certs/key.pem"

[database]
url = "{}"

[logging]
level = "info"

[storage]
directory = "data/rendered"

[renderer]
endpoint_url = "{}"

[admin]
api_token = "{}"
"#,
        host, port, db_url, renderer_url, admin_token
    );

    println!("\nGenerating configuration file: server-config.toml");
    std::fs::write("server-config.toml", &config_content)?;
    println!("Configuration saved successfully!");
    println!("Operator API token: {}", admin_token);
    println!("----------------------------------------\n");

    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        println!("{}", Config::default_template());
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkstand_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| "server-config.toml".to_string());

    // Onboarding only when no path was given and someone is at the terminal.
    if std::fs::metadata(&config_path).is_err() && cli.config.is_none() && console::user_attended() {
        if let Err(e) = run_onboarding() {
            eprintln!("Onboarding failed: {}", e);
            std::process::exit(1);
        }
    }

    if std::fs::metadata(&config_path).is_err() {
        eprintln!("Error: Configuration file '{}' not found.", config_path);
        eprintln!("Run with --generate-config to see a template.");
        std::process::exit(1);
    }

    let config = Config::load(&config_path)?;
    tracing::info!("Loaded configuration from {}", config_path);

    let db_pool = db::create_pool(&config.database.url, config.database.pool_size)?;
    db::run_migrations(&mut db_pool.get()?)?;
    seeding::seed_defaults(&db_pool)?;
    tracing::info!("Database initialized and seeded");

    let renderer = Arc::new(HttpRenderer::new(&config.renderer)?);
    let orchestrator = Arc::new(RenderOrchestrator::new(db_pool.clone(), renderer, &config));
    orchestrator.images().ensure_root()?;

    let state = AppState {
        db: db_pool.clone(),
        config: Arc::new(config.clone()),
        rate_limiter: Arc::new(RateLimiter::new()),
        orchestrator: Arc::clone(&orchestrator),
    };

    // Background tasks
    orchestrator.spawn();
    tokio::spawn(poller::run(Poller::new(db_pool.clone(), Arc::clone(&orchestrator))?));
    tokio::spawn(services::cleaning_service::run(
        db_pool,
        orchestrator.images().clone(),
        config.render_queue.clone(),
        Arc::clone(&state.rate_limiter),
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app = Router::new()
        .nest("/api", api::routes(state.clone()))
        .nest_service("/images", ServeDir::new(&config.storage.directory))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener_address: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid host/port: {}", e))?;

    if let Some(https_config) = &config.server.https {
        if https_config.enabled {
            use axum_server::tls_rustls::RustlsConfig;

            tracing::info!("Starting server in HTTPS mode on {}", addr);

            if !std::path::Path::new(&https_config.cert_path).exists() {
                anyhow::bail!("Certificate file not found: {}", https_config.cert_path);
            }
            if !std::path::Path::new(&https_config.key_path).exists() {
                anyhow::bail!("Key file not found: {}", https_config.key_path);
            }

            let tls_config =
                RustlsConfig::from_pem_file(&https_config.cert_path, &https_config.key_path)
                    .await?;

            axum_server::bind_rustls(listener_address, tls_config)
                .serve(app.into_make_service())
                .await?;

            return Ok(());
        }
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {} (HTTP)", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
