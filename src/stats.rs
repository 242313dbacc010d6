//! Dashboard figures derived from the stored configurations and the live status.

use crate::error::Result;
use crate::models::{BrokerConfig, ConnectionStatus};
use crate::status::{ConnectionStatusSnapshot, StatusBroadcaster};
use crate::store::ConfigStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const RECENT_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveConfigSummary {
    pub id: i64,
    pub name: String,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub active: Option<ActiveConfigSummary>,
    /// Configurations whose `last_connected` lies within the last 24 hours.
    pub recently_connected: usize,
    pub by_protocol: BTreeMap<String, usize>,
    pub by_qos: BTreeMap<u8, usize>,
    /// Every status is present, zero or not.
    pub by_status: BTreeMap<String, usize>,
    pub live: ConnectionStatusSnapshot,
}

impl Stats {
    pub fn from_parts(configs: &[BrokerConfig], live: ConnectionStatusSnapshot, now: OffsetDateTime) -> Self {
        let mut by_protocol = BTreeMap::new();
        let mut by_qos = BTreeMap::new();
        let mut by_status: BTreeMap<String, usize> = ConnectionStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();

        for config in configs {
            *by_protocol.entry(config.protocol.to_string()).or_insert(0) += 1;
            *by_qos.entry(config.qos).or_insert(0) += 1;
            *by_status
                .entry(config.connection_status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let cutoff = now - RECENT_WINDOW;
        let recently_connected = configs
            .iter()
            .filter(|c| c.last_connected.is_some_and(|at| at >= cutoff))
            .count();

        let active = configs.iter().find(|c| c.is_active).map(|c| ActiveConfigSummary {
            id: c.id,
            name: c.name.clone(),
            connection_status: c.connection_status,
        });

        Self {
            total: configs.len(),
            active,
            recently_connected,
            by_protocol,
            by_qos,
            by_status,
            live,
        }
    }
}

/// Read-only dashboard figures over the store and the live status.
pub struct StatsAggregator {
    store: Arc<ConfigStore>,
    status: Arc<StatusBroadcaster>,
}

impl StatsAggregator {
    pub fn new(store: Arc<ConfigStore>, status: Arc<StatusBroadcaster>) -> Self {
        Self { store, status }
    }

    pub fn summarize(&self) -> Result<Stats> {
        let configs = self.store.list()?;
        Ok(Stats::from_parts(
            &configs,
            self.status.current(),
            OffsetDateTime::now_utc(),
        ))
    }
}
