//! Bounded-time reachability test for a broker configuration.
//!
//! Every probe dials its own connection with its own client id, so it can
//! never evict or disturb the live session. The attempt runs on a spawned task
//! that owns the connection: the deadline and the teardown happen there even
//! if whoever asked for the test stops waiting.

use crate::error::Result;
use crate::models::{render_client_id, BrokerConfig, ConnectionStatus};
use crate::store::ConfigStore;
use crate::transport;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet};
use serde::Serialize;
use std::future::Future;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a probe did not succeed. Returned as data, never as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    /// Transport or broker refusal, with the underlying detail.
    Transport(String),
    ClosedUnexpectedly,
}

impl ProbeFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout => "ProbeTimeout",
            ProbeFailure::Transport(_) => "ProbeTransportError",
            ProbeFailure::ClosedUnexpectedly => "ProbeClosedUnexpectedly",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProbeFailure::Timeout => "Connection timeout".to_string(),
            ProbeFailure::Transport(detail) => format!("Connection failed: {}", detail),
            ProbeFailure::ClosedUnexpectedly => "Connection closed unexpectedly".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl ProbeResult {
    pub fn connected(latency: Duration) -> Self {
        Self {
            success: true,
            message: "Connection successful".to_string(),
            latency_ms: Some(latency.as_millis() as u64),
            error_kind: None,
        }
    }

    pub fn failed(failure: &ProbeFailure) -> Self {
        Self {
            success: false,
            message: failure.message(),
            latency_ms: None,
            error_kind: Some(failure.kind()),
        }
    }
}

/// The first thing a transient connection reports that decides the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Connected,
    Failed(String),
    TimedOut,
    Closed,
}

/// A transient connection driven by [`run_probe`].
pub trait ProbeTransport: Send + 'static {
    /// Resolves with the next deciding event; traffic that decides nothing is
    /// consumed internally. Must not reconnect after a failure.
    fn next_event(&mut self) -> impl Future<Output = ProbeEvent> + Send;

    /// Tears the connection down. Consumes the transport so it runs once.
    fn close(self);
}

/// Races the transport against the deadline and settles on the first outcome.
/// The connection is closed before the result is handed back.
pub async fn run_probe<T: ProbeTransport>(mut transport: T, deadline: Duration) -> ProbeResult {
    let started = Instant::now();
    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    // The losing branch is dropped unpolled, so a close that trails an error
    // is never observed and the outcome is decided exactly once.
    let settled = tokio::select! {
        biased;
        event = transport.next_event() => event,
        _ = &mut timer => ProbeEvent::TimedOut,
    };
    let elapsed = started.elapsed();
    transport.close();

    match settled {
        ProbeEvent::Connected => ProbeResult::connected(elapsed),
        ProbeEvent::Failed(detail) => ProbeResult::failed(&ProbeFailure::Transport(detail)),
        ProbeEvent::Closed => ProbeResult::failed(&ProbeFailure::ClosedUnexpectedly),
        ProbeEvent::TimedOut => ProbeResult::failed(&ProbeFailure::Timeout),
    }
}

/// Runs [`run_probe`] on its own task. Dropping the returned future detaches
/// the task; it still stops at the deadline and closes its connection.
pub async fn spawn_probe<T: ProbeTransport>(transport: T, deadline: Duration) -> ProbeResult {
    let handle = tokio::spawn(run_probe(transport, deadline));
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Probe task ended abnormally: {}", e);
            ProbeResult::failed(&ProbeFailure::Transport(format!("probe task failed: {}", e)))
        }
    }
}

/// Upper bound on flushing DISCONNECT to a broker that accepted the probe.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// rumqttc connection used for a single probe.
pub struct MqttProbeTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

impl MqttProbeTransport {
    /// rumqttc's own connect timeout is pushed past `deadline` so the probe
    /// deadline is always what decides a slow broker.
    pub fn new(config: &BrokerConfig, deadline: Duration) -> Self {
        let client_id = probe_client_id(&config.client_id);
        let options = transport::mqtt_options(config, &config.primary_endpoint(), &client_id);
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let connect_timeout = deadline.saturating_add(Duration::from_secs(1));
        eventloop.set_network_options(transport::network_options(connect_timeout));
        Self {
            client,
            eventloop,
            connected: false,
        }
    }
}

impl ProbeTransport for MqttProbeTransport {
    async fn next_event(&mut self) -> ProbeEvent {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == rumqttc::ConnectReturnCode::Success {
                        self.connected = true;
                        return ProbeEvent::Connected;
                    }
                    return ProbeEvent::Failed(format!("broker refused connection ({:?})", ack.code));
                }
                Ok(_) => continue,
                Err(e) => return classify(e),
            }
        }
    }

    /// Without a session the socket is simply dropped. An accepted session is
    /// ended with DISCONNECT; polling stops at the first outgoing DISCONNECT
    /// or error so the event loop never redials.
    fn close(self) {
        let Self {
            client,
            mut eventloop,
            connected,
        } = self;
        if !connected || client.try_disconnect().is_err() {
            return;
        }
        tokio::spawn(async move {
            let _client = client;
            let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            })
            .await;
            if flushed.is_err() {
                debug!("DISCONNECT not flushed before the probe connection was dropped");
            }
        });
    }
}

fn classify(error: ConnectionError) -> ProbeEvent {
    match error {
        ConnectionError::NetworkTimeout => ProbeEvent::TimedOut,
        ConnectionError::ConnectionRefused(code) => {
            ProbeEvent::Failed(format!("broker refused connection ({:?})", code))
        }
        ConnectionError::Io(e)
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
            ) =>
        {
            ProbeEvent::Closed
        }
        other => ProbeEvent::Failed(other.to_string()),
    }
}

/// Derived from the configured template but never equal to it, so a probe
/// cannot take over the live session's client id.
fn probe_client_id(template: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_probe_{}", render_client_id(template), &suffix[..8])
}

pub struct ConnectionProbe {
    deadline: Duration,
}

impl ConnectionProbe {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn test(&self, config: &BrokerConfig, deadline: Duration) -> ProbeResult {
        info!(id = config.id, url = %config.url(), "Testing broker connection");
        let result = spawn_probe(MqttProbeTransport::new(config, deadline), deadline).await;
        debug!(id = config.id, success = result.success, message = %result.message, "Probe finished");
        result
    }

    /// Probes a stored configuration with the default deadline and records the
    /// outcome on its row.
    pub async fn test_and_record(&self, store: &ConfigStore, id: i64) -> Result<ProbeResult> {
        let config = store.get(id)?;
        let result = self.test(&config, self.deadline).await;
        if result.success {
            store.update_connection_status(id, ConnectionStatus::Connected, None)?;
        } else {
            store.update_connection_status(id, ConnectionStatus::Error, Some(&result.message))?;
        }
        Ok(result)
    }
}

impl Default for ConnectionProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}
