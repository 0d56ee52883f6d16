use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use session_relay::config::{self, Config, LogFormat};
use session_relay::middleware;
use session_relay::orchestrator::RelayService;
use session_relay::routes::{self, AppState};
use session_relay::store::{
    self, ConfigStore, MemoryConfigStore, SharedStore, SqliteConfigStore, RELAY_AUTH_TOKEN,
    RELAY_ENDPOINT,
};
use session_relay::token::FileCredentialSource;

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and no control key)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("CONTROL_API_KEY", &interactive_config.control_api_key);
        std::env::set_var("RELAY_ENDPOINT", &interactive_config.relay_endpoint);
        std::env::set_var("POLL_INTERVAL", &interactive_config.poll_interval);
        if !interactive_config.relay_auth_token.is_empty() {
            std::env::set_var("RELAY_AUTH_TOKEN", &interactive_config.relay_auth_token);
        }
    }

    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::info!("Session Relay starting...");
    tracing::info!(
        "Watching credential '{}' on {}",
        config.credential_name,
        config.target_domain
    );

    let store = open_store(&config);
    seed_relay_settings(store.as_ref(), &config).await;

    let source = Arc::new(FileCredentialSource::new(config.credential_file.clone()));
    tracing::info!("Credential source: {}", source.path().display());

    let service = RelayService::start(store, source, config.orchestrator_options()).await?;
    tracing::info!("✅ Relay pipeline started");

    let app_state = AppState {
        control_api_key: config.control_api_key.clone(),
        orchestrator: service.orchestrator(),
    };
    let app = build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control API to {}", addr))?;

    print_startup_banner(&config);
    tracing::info!("🚀 Control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    tracing::info!("👋 Shutdown complete");

    Ok(())
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Open the state database, degrading to memory-only state on failure
fn open_store(config: &Config) -> SharedStore {
    match SqliteConfigStore::open(&config.state_db_file) {
        Ok(store) => {
            tracing::info!("State database: {}", config.state_db_file.display());
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!("❌ Failed to open state database: {:#}", e);
            tracing::warn!("Continuing with memory-only state; nothing will survive a restart");
            Arc::new(MemoryConfigStore::new())
        }
    }
}

/// Write relay settings given on the command line into the store
async fn seed_relay_settings(store: &dyn ConfigStore, config: &Config) {
    if let Some(ref endpoint) = config.relay_endpoint {
        if store::set_best_effort(store, RELAY_ENDPOINT, endpoint.trim()).await {
            tracing::info!("Relay endpoint set from configuration: {}", endpoint.trim());
        }
    }

    if let Some(ref auth_token) = config.relay_auth_token {
        if store::set_best_effort(store, RELAY_AUTH_TOKEN, auth_token.trim()).await {
            tracing::info!("Relay auth token set from configuration");
        }
    }
}

/// Build the application with all routes and middleware
fn build_app(state: AppState) -> axum::Router {
    use axum::Router;

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::control_routes(state))
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  Session Relay {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Control API:   http://{}:{}",
        config.server_host, config.server_port
    );
    println!(
        "  Credential:    {} @ {}",
        config.credential_name, config.target_domain
    );
    println!("  Poll interval: {}s", config.poll_interval);
    println!("  State:         {}", config.state_db_file.display());
    println!("  Log Level:     {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
