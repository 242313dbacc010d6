//! Property tests for the exclusive `active` and `enabled` flags.
//!
//! Random operation sequences run against both repositories and are checked
//! against a small reference model after every step.

use brokerdeck::activation::ActivationRegistry;
use brokerdeck::db::SqliteRepository;
use brokerdeck::models::{BrokerConfig, NewBrokerConfig};
use brokerdeck::store::{ConfigRepository, ConfigStore, MemoryRepository};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Create,
    SetActive(i64),
    SetEnabled(i64),
    Disable(i64),
    Delete(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Create),
        3 => (1i64..=6).prop_map(Op::SetActive),
        3 => (1i64..=6).prop_map(Op::SetEnabled),
        2 => (1i64..=6).prop_map(Op::Disable),
        1 => (1i64..=6).prop_map(Op::Delete),
    ]
}

#[derive(Default)]
struct Model {
    ids: BTreeSet<i64>,
    active: Option<i64>,
    enabled: Option<i64>,
}

fn flagged(rows: &[BrokerConfig], pick: impl Fn(&BrokerConfig) -> bool) -> Vec<i64> {
    rows.iter().filter(|c| pick(c)).map(|c| c.id).collect()
}

fn run_sequence(repo: Arc<dyn ConfigRepository>, ops: &[Op]) -> Result<(), TestCaseError> {
    let store = Arc::new(ConfigStore::new(repo).unwrap());
    let registry = ActivationRegistry::new(store.clone());
    let signal = registry.enabled_signal();
    let mut model = Model::default();

    for _ in 0..3 {
        let cfg = store.create(NewBrokerConfig::new("broker", 1883)).unwrap();
        model.ids.insert(cfg.id);
    }

    for op in ops {
        match *op {
            Op::Create => {
                let cfg = store.create(NewBrokerConfig::new("broker", 1883)).unwrap();
                model.ids.insert(cfg.id);
            }
            Op::SetActive(id) => {
                let known = model.ids.contains(&id);
                prop_assert_eq!(registry.set_active(id).is_ok(), known);
                if known {
                    model.active = Some(id);
                }
            }
            Op::SetEnabled(id) => {
                let known = model.ids.contains(&id);
                prop_assert_eq!(registry.set_enabled(id).is_ok(), known);
                if known {
                    model.enabled = Some(id);
                }
            }
            Op::Disable(id) => {
                let known = model.ids.contains(&id);
                prop_assert_eq!(registry.disable(id).is_ok(), known);
                if model.enabled == Some(id) {
                    model.enabled = None;
                }
            }
            Op::Delete(id) => {
                let known = model.ids.remove(&id);
                prop_assert_eq!(registry.delete(id).is_ok(), known);
                if model.active == Some(id) {
                    model.active = None;
                }
                if model.enabled == Some(id) {
                    model.enabled = None;
                }
            }
        }

        let rows = store.list().unwrap();
        let active = flagged(&rows, |c| c.is_active);
        let enabled = flagged(&rows, |c| c.is_enabled);
        prop_assert!(active.len() <= 1, "two active rows: {:?}", active);
        prop_assert!(enabled.len() <= 1, "two enabled rows: {:?}", enabled);
        prop_assert_eq!(active.first().copied(), model.active);
        prop_assert_eq!(enabled.first().copied(), model.enabled);
        prop_assert_eq!(signal.borrow().as_ref().map(|c| c.id), model.enabled);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn flags_stay_exclusive_in_memory(ops in prop::collection::vec(op(), 1..40)) {
        run_sequence(Arc::new(MemoryRepository::default()), &ops)?;
    }

    #[test]
    fn flags_stay_exclusive_in_sqlite(ops in prop::collection::vec(op(), 1..40)) {
        run_sequence(Arc::new(SqliteRepository::open_in_memory().unwrap()), &ops)?;
    }
}
