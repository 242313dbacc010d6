use crate::models::{render_client_id, BrokerConfig, BrokerEndpoint, ConnectionStatus};
use crate::status::{ConnectionMode, ConnectionStatusSnapshot, StatusBroadcaster};
use crate::store::ConfigStore;
use crate::transport;
use rumqttc::{AsyncClient, Event, LastWill, Packet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LiveSessionSettings {
    /// Broker used when no stored configuration is enabled.
    pub env_broker: Option<BrokerConfig>,
    /// Retry interval for the environment broker. Stored configurations use
    /// their own `reconnect_period`.
    pub retry_interval: Duration,
    /// Attempts per target before giving up; negative means unlimited.
    pub max_retries: i32,
    /// Presence topic; `online` is published on connect, `offline` is the last will.
    pub status_topic: String,
}

/// Owner of the application's long-lived broker session.
///
/// Follows the enabled-config signal: whenever the enabled configuration
/// changes the current session is dropped and a new one is dialed. Every state
/// change is reported to the [`StatusBroadcaster`].
pub struct LiveSession {
    store: Arc<ConfigStore>,
    status: Arc<StatusBroadcaster>,
    settings: LiveSessionSettings,
}

enum SessionEnd {
    /// The broker never accepted us.
    Failed,
    /// We were connected and lost the connection.
    Lost,
}

impl LiveSession {
    pub fn new(store: Arc<ConfigStore>, status: Arc<StatusBroadcaster>, settings: LiveSessionSettings) -> Self {
        Self {
            store,
            status,
            settings,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting live MQTT session owner...");
        let mut enabled = self.store.subscribe_enabled();

        loop {
            let target = self.target(enabled.borrow_and_update().clone());

            match target {
                Some((config, mode)) => {
                    tokio::select! {
                        _ = self.serve(&config, mode) => {
                            warn!(url = %config.url(), "Giving up on live session until the configuration changes");
                        }
                        changed = enabled.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            info!(from = %config.url(), "Enabled configuration changed, migrating live session");
                            self.record_disconnect(&config, mode);
                            continue;
                        }
                        _ = shutdown.changed() => {
                            self.record_disconnect(&config, mode);
                            break;
                        }
                    }
                }
                None => {
                    info!("No enabled configuration and no environment broker; live session idle");
                    self.report(ConnectionStatus::Disconnected, String::new(), ConnectionMode::Database);
                }
            }

            tokio::select! {
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let last = self.status.current();
        self.report(ConnectionStatus::Disconnected, last.broker_url, last.mode);
        info!("Live MQTT session stopped.");
    }

    fn target(&self, enabled: Option<BrokerConfig>) -> Option<(BrokerConfig, ConnectionMode)> {
        match enabled {
            Some(config) => Some((config, ConnectionMode::Database)),
            None => self
                .settings
                .env_broker
                .clone()
                .map(|config| (config, ConnectionMode::Env)),
        }
    }

    /// Dials the primary endpoint and then each fallback in turn, backing off
    /// between attempts. Returns once the retry budget is spent.
    async fn serve(&self, config: &BrokerConfig, mode: ConnectionMode) {
        let endpoints = config.endpoints();
        let base = (self.retry_interval(config, mode).as_millis() as u64 / 2).max(1);
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(base)
            .max_delay(MAX_RETRY_DELAY);
        let mut failures: i64 = 0;
        let mut attempt = 0usize;

        loop {
            let endpoint = &endpoints[attempt % endpoints.len()];
            attempt += 1;

            match self.connect_once(config, endpoint, mode).await {
                SessionEnd::Lost => {
                    failures = 0;
                    delays = ExponentialBackoff::from_millis(2)
                        .factor(base)
                        .max_delay(MAX_RETRY_DELAY);
                    // Reconnect to where we were connected before moving on.
                    attempt -= 1;
                }
                SessionEnd::Failed => failures += 1,
            }

            if self.settings.max_retries >= 0 && failures > i64::from(self.settings.max_retries) {
                error!(
                    "Maximum number of retries ({}) reached for {}.",
                    self.settings.max_retries,
                    config.url()
                );
                return;
            }

            let delay = delays.next().unwrap_or(MAX_RETRY_DELAY);
            warn!("Lost connection to MQTT broker. Retrying in {:?}...", delay);
            sleep(delay).await;
        }
    }

    fn retry_interval(&self, config: &BrokerConfig, mode: ConnectionMode) -> Duration {
        match mode {
            ConnectionMode::Database => Duration::from_millis(u64::from(config.reconnect_period.max(1))),
            ConnectionMode::Env => self.settings.retry_interval,
        }
    }

    async fn connect_once(&self, config: &BrokerConfig, endpoint: &BrokerEndpoint, mode: ConnectionMode) -> SessionEnd {
        let url = endpoint.url();
        let client_id = render_client_id(&config.client_id);
        debug!("Configuring MQTT broker at {} as {}...", url, client_id);

        let mut options = transport::mqtt_options(config, endpoint, &client_id);
        options.set_last_will(LastWill::new(
            &self.settings.status_topic,
            presence_payload("offline", &client_id),
            transport::qos(config.qos),
            config.retain,
        ));
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        eventloop.set_network_options(transport::network_options(Duration::from_millis(u64::from(
            config.connect_timeout,
        ))));

        self.report(ConnectionStatus::Connecting, url.clone(), mode);
        let mut connected = false;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker at {}.", url);
                    connected = true;
                    self.record(config, mode, ConnectionStatus::Connected, None);
                    self.report(ConnectionStatus::Connected, url.clone(), mode);

                    if let Err(e) = client.try_publish(
                        &self.settings.status_topic,
                        transport::qos(config.qos),
                        config.retain,
                        presence_payload("online", &client_id),
                    ) {
                        warn!("Failed to queue presence message: {}", e);
                    }
                }
                Ok(event) => {
                    debug!("Live session event: {:?}", event);
                }
                Err(e) => {
                    error!("Error in MQTT event loop for {}: {}", url, e);
                    let message = e.to_string();
                    self.record(config, mode, ConnectionStatus::Error, Some(&message));
                    self.report(ConnectionStatus::Error, url.clone(), mode);
                    return if connected {
                        SessionEnd::Lost
                    } else {
                        SessionEnd::Failed
                    };
                }
            }
        }
    }

    fn report(&self, state: ConnectionStatus, broker_url: String, mode: ConnectionMode) {
        self.status
            .report(ConnectionStatusSnapshot::new(state, broker_url, mode));
    }

    /// Mirrors live outcomes onto the stored row. Environment brokers have no row.
    fn record(&self, config: &BrokerConfig, mode: ConnectionMode, status: ConnectionStatus, message: Option<&str>) {
        if mode != ConnectionMode::Database {
            return;
        }
        if let Err(e) = self.store.update_connection_status(config.id, status, message) {
            debug!(id = config.id, "Could not record live status: {}", e);
        }
    }

    fn record_disconnect(&self, config: &BrokerConfig, mode: ConnectionMode) {
        self.record(config, mode, ConnectionStatus::Disconnected, None);
    }
}

fn presence_payload(state: &str, client_id: &str) -> String {
    serde_json::json!({ "status": state, "client_id": client_id }).to_string()
}
