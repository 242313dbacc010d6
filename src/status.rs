//! The process-wide live connection status.
//!
//! One slot, replaced wholesale on every report. Readers either poll
//! [`StatusBroadcaster::current`] or hold a `watch` receiver from
//! [`StatusBroadcaster::subscribe`].

use crate::models::ConnectionStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

/// Where the live session took its broker settings from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Process environment (`MQTT_HOST` and friends).
    #[default]
    Env,
    /// The enabled row of the configuration store.
    Database,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Env => f.write_str("env"),
            ConnectionMode::Database => f.write_str("database"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatusSnapshot {
    pub is_connected: bool,
    pub connection_state: ConnectionStatus,
    pub broker_url: String,
    pub mode: ConnectionMode,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl ConnectionStatusSnapshot {
    pub fn new(state: ConnectionStatus, broker_url: impl Into<String>, mode: ConnectionMode) -> Self {
        Self {
            is_connected: state == ConnectionStatus::Connected,
            connection_state: state,
            broker_url: broker_url.into(),
            mode,
            last_updated: OffsetDateTime::now_utc(),
        }
    }
}

impl Default for ConnectionStatusSnapshot {
    fn default() -> Self {
        Self::new(ConnectionStatus::Disconnected, "", ConnectionMode::Env)
    }
}

/// Inbound status report. `last_updated` is always stamped on receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub is_connected: bool,
    pub connection_state: Option<ConnectionStatus>,
    #[serde(default)]
    pub broker_url: String,
    #[serde(default)]
    pub mode: ConnectionMode,
}

impl From<StatusReport> for ConnectionStatusSnapshot {
    fn from(report: StatusReport) -> Self {
        let state = report.connection_state.unwrap_or(if report.is_connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        });
        Self {
            is_connected: report.is_connected,
            connection_state: state,
            broker_url: report.broker_url,
            mode: report.mode,
            last_updated: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug)]
pub struct StatusBroadcaster {
    tx: watch::Sender<ConnectionStatusSnapshot>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatusSnapshot::default());
        Self { tx }
    }

    /// Replaces the current snapshot. Concurrent reports race; the last one
    /// to land wins.
    pub fn report(&self, mut snapshot: ConnectionStatusSnapshot) -> ConnectionStatusSnapshot {
        snapshot.last_updated = OffsetDateTime::now_utc();
        debug!(
            state = %snapshot.connection_state,
            url = %snapshot.broker_url,
            mode = %snapshot.mode,
            "Live connection status reported"
        );
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    pub fn current(&self) -> ConnectionStatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatusSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
