//! Single-active / single-enabled bookkeeping.
//!
//! The transitions are plain functions over rows so every repository can apply
//! them the same way; the registry only sequences them through the store's
//! write gate and exposes the enabled-config signal to the live session owner.

use crate::error::Result;
use crate::models::BrokerConfig;
use crate::store::ConfigStore;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Primary selection among stored configurations.
    Active,
    /// Configuration the running application should use for its live session.
    Enabled,
}

impl Flag {
    pub fn column(&self) -> &'static str {
        match self {
            Flag::Active => "is_active",
            Flag::Enabled => "is_enabled",
        }
    }

    pub fn get(&self, config: &BrokerConfig) -> bool {
        match self {
            Flag::Active => config.is_active,
            Flag::Enabled => config.is_enabled,
        }
    }

    fn set(&self, config: &mut BrokerConfig, value: bool) {
        match self {
            Flag::Active => config.is_active = value,
            Flag::Enabled => config.is_enabled = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTransition {
    /// Raise the flag on `id` and lower it on every other row.
    Exclusive { flag: Flag, id: i64 },
    /// Lower the flag on `id` only.
    Clear { flag: Flag, id: i64 },
}

impl FlagTransition {
    pub fn id(&self) -> i64 {
        match self {
            FlagTransition::Exclusive { id, .. } | FlagTransition::Clear { id, .. } => *id,
        }
    }

    pub fn flag(&self) -> Flag {
        match self {
            FlagTransition::Exclusive { flag, .. } | FlagTransition::Clear { flag, .. } => *flag,
        }
    }

    /// Applies the transition in place. Returns `false` and leaves every row
    /// untouched when `id` is unknown. Rows whose flag changes get `now` as
    /// their `updated_at`.
    pub fn apply(&self, rows: &mut [BrokerConfig], now: OffsetDateTime) -> bool {
        let id = self.id();
        if !rows.iter().any(|row| row.id == id) {
            return false;
        }
        let flag = self.flag();
        for row in rows.iter_mut() {
            let wanted = match self {
                FlagTransition::Exclusive { .. } => row.id == id,
                FlagTransition::Clear { .. } if row.id == id => false,
                FlagTransition::Clear { .. } => continue,
            };
            if flag.get(row) != wanted || row.id == id {
                flag.set(row, wanted);
                row.updated_at = now;
            }
        }
        true
    }
}

pub struct ActivationRegistry {
    store: Arc<ConfigStore>,
}

impl ActivationRegistry {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn set_active(&self, id: i64) -> Result<BrokerConfig> {
        let config = self
            .store
            .apply_transition(FlagTransition::Exclusive { flag: Flag::Active, id })?;
        info!(id, name = %config.name, "Broker configuration activated");
        Ok(config)
    }

    /// Enables `id` and disables every other configuration. The live session
    /// owner picks the change up through [`enabled_signal`](Self::enabled_signal).
    pub fn set_enabled(&self, id: i64) -> Result<BrokerConfig> {
        let config = self
            .store
            .apply_transition(FlagTransition::Exclusive { flag: Flag::Enabled, id })?;
        info!(id, name = %config.name, "Broker configuration enabled for live use");
        Ok(config)
    }

    pub fn disable(&self, id: i64) -> Result<BrokerConfig> {
        let config = self
            .store
            .apply_transition(FlagTransition::Clear { flag: Flag::Enabled, id })?;
        info!(id, "Broker configuration disabled");
        Ok(config)
    }

    /// Deletes a configuration; any flag it held goes with it and the enabled
    /// signal is refreshed before this returns.
    pub fn delete(&self, id: i64) -> Result<BrokerConfig> {
        let removed = self.store.delete(id)?;
        if removed.is_active || removed.is_enabled {
            info!(
                id,
                was_active = removed.is_active,
                was_enabled = removed.is_enabled,
                "Deleted a flagged broker configuration"
            );
        }
        Ok(removed)
    }

    pub fn active(&self) -> Result<Option<BrokerConfig>> {
        Ok(self.store.list()?.into_iter().find(|c| c.is_active))
    }

    pub fn enabled(&self) -> Result<Option<BrokerConfig>> {
        Ok(self.store.list()?.into_iter().find(|c| c.is_enabled))
    }

    pub fn enabled_signal(&self) -> watch::Receiver<Option<BrokerConfig>> {
        self.store.subscribe_enabled()
    }
}
