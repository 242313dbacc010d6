use brokerdeck::config::Config;
use brokerdeck::db::SqliteRepository;
use brokerdeck::mqtt_service::{LiveSession, LiveSessionSettings};
use brokerdeck::probe::ConnectionProbe;
use brokerdeck::rest_server::{run_rest_server, AppState};
use brokerdeck::service_utils::{handle_shutdown, start_live_session};
use brokerdeck::status::StatusBroadcaster;
use brokerdeck::store::ConfigStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let env_broker = match config.env_broker() {
        Ok(broker) => broker,
        Err(e) => {
            error!("Invalid environment broker: {:?}", e);
            return;
        }
    };

    let repo = match SqliteRepository::open(&config.db_path) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!("Failed to open database {}: {:?}", config.db_path, e);
            return;
        }
    };
    info!("Database initialized successfully.");

    let store = match ConfigStore::new(repo) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load broker configurations: {:?}", e);
            return;
        }
    };
    let status = Arc::new(StatusBroadcaster::new());

    // Start the live session owner
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = LiveSession::new(
        store.clone(),
        status.clone(),
        LiveSessionSettings {
            env_broker,
            retry_interval: config.retry_interval(),
            max_retries: config.mqtt_max_retries,
            status_topic: config.status_topic.clone(),
        },
    );
    let session_task = start_live_session(session, shutdown_rx);

    // Start REST API server
    let state = AppState::new(store, status, ConnectionProbe::new(config.probe_timeout()));
    let rest_api_task = tokio::spawn(async move {
        if let Err(e) = run_rest_server(state).await {
            error!("REST server failed: {}", e);
        }
    });

    handle_shutdown(shutdown_tx).await;

    // Wait for tasks to complete
    let _ = tokio::join!(rest_api_task, session_task);
    info!("All services shut down successfully.");
}
