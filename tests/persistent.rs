//! Facts, provenance and idempotency records survive a restart.

#![cfg(feature = "persistent")]

mod common;

use common::{active_engine, dollars, request, rule_store, value_of};
use factforge::storage::persistent::{open_ledger, persistent_stores, LedgerConfig};
use factforge::{FactQuery, ScenarioId};

fn fast() -> Option<LedgerConfig> {
    Some(LedgerConfig { sync_on_write: false })
}

#[test]
fn restart_keeps_facts_and_replays_keys() {
    let dir = tempfile::tempdir().unwrap();
    let req = request("100000").with_idempotency_key("client-7/fy25");

    let (first_ids, net_tax) = {
        let engine = active_engine(persistent_stores(dir.path(), fast(), rule_store()).unwrap());
        let outcome = engine.run(&req).unwrap();
        let net = outcome
            .facts
            .iter()
            .find(|f| f.topic.as_str() == "pit.net_tax")
            .unwrap()
            .id;
        (outcome.facts.iter().map(|f| f.id).collect::<Vec<_>>(), net)
    };

    let engine = active_engine(persistent_stores(dir.path(), fast(), rule_store()).unwrap());
    let page = engine.facts(&FactQuery::scenario(ScenarioId::base())).unwrap();
    assert_eq!(page.total, first_ids.len());
    assert_eq!(*value_of(&page.facts, "pit.net_tax"), dollars("22788"));

    let again = engine.run(&req).unwrap();
    assert!(again.replayed);
    assert_eq!(again.facts.iter().map(|f| f.id).collect::<Vec<_>>(), first_ids);

    let chain = engine.explain(net_tax).unwrap();
    assert!(chain.nodes.len() > 5);
}

#[test]
fn ledger_is_single_writer() {
    let dir = tempfile::tempdir().unwrap();
    let _held = open_ledger(dir.path(), fast()).unwrap();
    let Err(err) = persistent_stores(dir.path(), fast(), rule_store()) else {
        panic!("a second writer must be locked out");
    };
    assert_eq!(err.kind(), "storage_backend");
    assert!(err.to_string().contains("lock"));
}

#[test]
fn replay_counts_every_record() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = active_engine(persistent_stores(dir.path(), fast(), rule_store()).unwrap());
        engine.run(&request("40000").with_targets(["pit.lito"])).unwrap();
    }
    let ledger = open_ledger(dir.path(), fast()).unwrap();
    let stats = ledger.replay_stats();
    // Edges, two facts, then the idempotency record.
    assert_eq!(stats.records, 4);
    assert_eq!(stats.truncated_bytes, 0);
    assert_eq!(ledger.sequence(), 4);
}
