use crate::mqtt_service::LiveSession;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Start the live MQTT session owner
pub fn start_live_session(session: LiveSession, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        session.run(shutdown).await;
    })
}

/// Wait for Ctrl-C and tell every background task to stop
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Brokerdeck is shutting down...");
    }

    // Receivers may already be gone; nothing left to notify then.
    let _ = shutdown.send(true);
}
