//! Broker configuration storage.
//!
//! [`ConfigStore`] validates input, serializes writers and keeps the
//! enabled-config signal current. Durable storage is delegated to a
//! [`ConfigRepository`]; [`crate::db::SqliteRepository`] is the production
//! backend and [`MemoryRepository`] serves tests and throwaway runs.

use crate::activation::{Flag, FlagTransition};
use crate::error::{BrokerError, Result};
use crate::models::{BrokerConfig, BrokerConfigPatch, ConnectionStatus, NewBrokerConfig};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Storage backend for broker configurations.
///
/// Implementations must keep rows in insertion order and must apply a
/// [`FlagTransition`] as one atomic write: no reader may observe the state
/// between clearing the old flag holder and raising the new one.
pub trait ConfigRepository: Send + Sync {
    fn next_id(&self) -> Result<i64>;

    /// Fails with [`BrokerError::DuplicateId`] if the id is taken.
    fn insert(&self, config: &BrokerConfig) -> Result<()>;

    fn find(&self, id: i64) -> Result<Option<BrokerConfig>>;

    fn list(&self) -> Result<Vec<BrokerConfig>>;

    /// Overwrites the stored row with the same id. Fails with `NotFound`.
    fn replace(&self, config: &BrokerConfig) -> Result<()>;

    /// Removes and returns the row, or `None` if it did not exist.
    fn remove(&self, id: i64) -> Result<Option<BrokerConfig>>;

    /// Applies the transition atomically and returns the target row.
    fn apply_transition(&self, transition: FlagTransition, now: OffsetDateTime) -> Result<BrokerConfig>;

    fn find_flagged(&self, flag: Flag) -> Result<Option<BrokerConfig>> {
        Ok(self.list()?.into_iter().find(|c| flag.get(c)))
    }
}

pub struct ConfigStore {
    repo: Arc<dyn ConfigRepository>,
    write_gate: Mutex<()>,
    enabled_tx: watch::Sender<Option<BrokerConfig>>,
}

impl ConfigStore {
    pub fn new(repo: Arc<dyn ConfigRepository>) -> Result<Self> {
        let enabled = repo.find_flagged(Flag::Enabled)?;
        let (enabled_tx, _) = watch::channel(enabled);
        Ok(Self {
            repo,
            write_gate: Mutex::new(()),
            enabled_tx,
        })
    }

    pub fn create(&self, new: NewBrokerConfig) -> Result<BrokerConfig> {
        let _guard = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let id = match new.id {
            Some(id) => {
                if self.repo.find(id)?.is_some() {
                    return Err(BrokerError::DuplicateId(id));
                }
                id
            }
            None => self.repo.next_id()?,
        };
        let config = new.into_config(id, OffsetDateTime::now_utc())?;
        self.repo.insert(&config)?;
        info!(id, name = %config.name, url = %config.url(), "Broker configuration created");
        Ok(config)
    }

    pub fn get(&self, id: i64) -> Result<BrokerConfig> {
        self.repo.find(id)?.ok_or(BrokerError::NotFound(id))
    }

    pub fn list(&self) -> Result<Vec<BrokerConfig>> {
        self.repo.list()
    }

    pub fn update(&self, id: i64, patch: BrokerConfigPatch) -> Result<BrokerConfig> {
        let _guard = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.get(id)?;
        patch.apply_to(&mut config)?;
        config.updated_at = OffsetDateTime::now_utc();
        self.repo.replace(&config)?;
        debug!(id, "Broker configuration updated");
        self.refresh_enabled()?;
        Ok(config)
    }

    pub fn delete(&self, id: i64) -> Result<BrokerConfig> {
        let _guard = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.repo.remove(id)?.ok_or(BrokerError::NotFound(id))?;
        info!(id, name = %removed.name, "Broker configuration deleted");
        self.refresh_enabled()?;
        Ok(removed)
    }

    /// Records the outcome of a connection attempt. `connected` stamps
    /// `last_connected` and clears `last_error`; `error` stores the message.
    pub fn update_connection_status(
        &self,
        id: i64,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<BrokerConfig> {
        let _guard = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.get(id)?;
        let now = OffsetDateTime::now_utc();
        config.connection_status = status;
        match status {
            ConnectionStatus::Connected => {
                config.last_connected = Some(now);
                config.last_error = None;
            }
            ConnectionStatus::Error => {
                config.last_error = Some(error_message.unwrap_or("Unknown error").to_string());
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {
                if let Some(message) = error_message {
                    config.last_error = Some(message.to_string());
                }
            }
        }
        config.updated_at = now;
        self.repo.replace(&config)?;
        debug!(id, status = %status, "Connection status recorded");
        Ok(config)
    }

    pub(crate) fn apply_transition(&self, transition: FlagTransition) -> Result<BrokerConfig> {
        let _guard = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let config = self
            .repo
            .apply_transition(transition, OffsetDateTime::now_utc())?;
        if transition.flag() == Flag::Enabled {
            self.refresh_enabled()?;
        }
        Ok(config)
    }

    pub fn subscribe_enabled(&self) -> watch::Receiver<Option<BrokerConfig>> {
        self.enabled_tx.subscribe()
    }

    /// Publishes the enabled row when it differs in anything that matters to
    /// a live session. Status bookkeeping on the same row does not count.
    fn refresh_enabled(&self) -> Result<()> {
        let enabled = self.repo.find_flagged(Flag::Enabled)?;
        let changed = self.enabled_tx.send_if_modified(|current| {
            let same = match (current.as_ref(), enabled.as_ref()) {
                (None, None) => true,
                (Some(a), Some(b)) => same_session(a, b),
                _ => false,
            };
            if !same {
                *current = enabled.clone();
            }
            !same
        });
        if changed {
            match enabled.as_ref() {
                Some(cfg) => info!(id = cfg.id, url = %cfg.url(), "Enabled broker configuration changed"),
                None => warn!("No broker configuration is enabled"),
            }
        }
        Ok(())
    }
}

fn same_session(a: &BrokerConfig, b: &BrokerConfig) -> bool {
    a.id == b.id
        && a.protocol == b.protocol
        && a.host == b.host
        && a.port == b.port
        && a.username == b.username
        && a.password == b.password
        && a.client_id == b.client_id
        && a.qos == b.qos
        && a.clean_session == b.clean_session
        && a.keepalive == b.keepalive
        && a.connect_timeout == b.connect_timeout
        && a.reconnect_period == b.reconnect_period
        && a.fallback_brokers == b.fallback_brokers
}

/// Volatile repository backed by a vector.
#[derive(Default)]
pub struct MemoryRepository {
    rows: RwLock<Vec<BrokerConfig>>,
}

impl ConfigRepository for MemoryRepository {
    fn next_id(&self) -> Result<i64> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.iter().map(|c| c.id).max().unwrap_or(0) + 1)
    }

    fn insert(&self, config: &BrokerConfig) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows.iter().any(|c| c.id == config.id) {
            return Err(BrokerError::DuplicateId(config.id));
        }
        rows.push(config.clone());
        Ok(())
    }

    fn find(&self, id: i64) -> Result<Option<BrokerConfig>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.iter().find(|c| c.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<BrokerConfig>> {
        Ok(self.rows.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn replace(&self, config: &BrokerConfig) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let slot = rows
            .iter_mut()
            .find(|c| c.id == config.id)
            .ok_or(BrokerError::NotFound(config.id))?;
        *slot = config.clone();
        Ok(())
    }

    fn remove(&self, id: i64) -> Result<Option<BrokerConfig>> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .iter()
            .position(|c| c.id == id)
            .map(|index| rows.remove(index)))
    }

    fn apply_transition(&self, transition: FlagTransition, now: OffsetDateTime) -> Result<BrokerConfig> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if !transition.apply(&mut rows, now) {
            return Err(BrokerError::NotFound(transition.id()));
        }
        rows.iter()
            .find(|c| c.id == transition.id())
            .cloned()
            .ok_or(BrokerError::NotFound(transition.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::new(Arc::new(MemoryRepository::default())).unwrap()
    }

    #[test]
    fn create_assigns_sequential_ids_and_keeps_insertion_order() {
        let store = store();
        store.create(NewBrokerConfig::new("c", 1883).with_id(10)).unwrap();
        let a = store.create(NewBrokerConfig::new("a", 1883)).unwrap();
        let b = store.create(NewBrokerConfig::new("b", 1883).with_id(3)).unwrap();
        assert_eq!(a.id, 11);
        assert_eq!(b.id, 3);

        let hosts: Vec<_> = store.list().unwrap().into_iter().map(|c| c.host).collect();
        assert_eq!(hosts, vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let store = store();
        store.create(NewBrokerConfig::new("a", 1883).with_id(1)).unwrap();
        let err = store
            .create(NewBrokerConfig::new("b", 1883).with_id(1))
            .unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateId(1)));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = store();
        assert!(matches!(store.get(5), Err(BrokerError::NotFound(5))));
        assert!(matches!(
            store.update(5, BrokerConfigPatch::default()),
            Err(BrokerError::NotFound(5))
        ));
        assert!(matches!(store.delete(5), Err(BrokerError::NotFound(5))));
        assert!(matches!(
            store.update_connection_status(5, ConnectionStatus::Error, Some("x")),
            Err(BrokerError::NotFound(5))
        ));
    }

    #[test]
    fn update_validates_and_stamps_updated_at() {
        let store = store();
        let created = store.create(NewBrokerConfig::new("a", 1883)).unwrap();

        let bad = BrokerConfigPatch {
            port: Some(70_000),
            ..Default::default()
        };
        assert!(matches!(store.update(created.id, bad), Err(BrokerError::Validation(_))));
        assert_eq!(store.get(created.id).unwrap().port, 1883);

        let good = BrokerConfigPatch {
            host: Some("b".into()),
            ..Default::default()
        };
        let updated = store.update(created.id, good).unwrap();
        assert_eq!(updated.host, "b");
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn connection_status_bookkeeping() {
        let store = store();
        let cfg = store.create(NewBrokerConfig::new("a", 1883)).unwrap();

        let failed = store
            .update_connection_status(cfg.id, ConnectionStatus::Error, Some("Connection timeout"))
            .unwrap();
        assert_eq!(failed.connection_status, ConnectionStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("Connection timeout"));
        assert!(failed.last_connected.is_none());

        let ok = store
            .update_connection_status(cfg.id, ConnectionStatus::Connected, None)
            .unwrap();
        assert!(ok.last_connected.is_some());
        assert!(ok.last_error.is_none());
    }

    #[test]
    fn status_updates_do_not_retrigger_the_enabled_signal() {
        let store = Arc::new(store());
        let cfg = store.create(NewBrokerConfig::new("a", 1883)).unwrap();
        let registry = crate::activation::ActivationRegistry::new(store.clone());
        let mut signal = store.subscribe_enabled();

        registry.set_enabled(cfg.id).unwrap();
        assert!(signal.has_changed().unwrap());
        let _ = signal.borrow_and_update();

        store
            .update_connection_status(cfg.id, ConnectionStatus::Connected, None)
            .unwrap();
        assert!(!signal.has_changed().unwrap());

        store
            .update(
                cfg.id,
                BrokerConfigPatch {
                    port: Some(1884),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(signal.has_changed().unwrap());
        assert_eq!(signal.borrow().as_ref().map(|c| c.port), Some(1884));
    }
}
