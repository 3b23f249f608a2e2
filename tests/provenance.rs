//! Explaining facts back to rules, assumptions and legislation.

mod common;

use common::{active_engine, fast_config, request, rule_store};
use factforge::provenance::NodeDetail;
use factforge::{
    CalcEngine, CalcError, EngineConfig, EngineStores, ExecutionError, FactId, NodeRef, Relation, ValidationError,
};
use uuid::Uuid;

fn fact_id(engine: &CalcEngine, salary: &str, topic: &str) -> FactId {
    engine
        .run(&request(salary))
        .unwrap()
        .facts
        .into_iter()
        .find(|f| f.topic.as_str() == topic)
        .unwrap()
        .id
}

#[test]
fn net_tax_chain_reaches_the_acts() {
    let engine = common::engine();
    let id = fact_id(&engine, "100000", "pit.net_tax");
    let chain = engine.explain(id).unwrap();

    assert_eq!(chain.root, id);
    assert_eq!(chain.nodes[0].node, NodeRef::Fact { id });
    assert_eq!(chain.nodes[0].depth, 0);

    let facts: Vec<String> = chain
        .nodes_where(|n| matches!(n, NodeRef::Fact { .. }))
        .filter_map(|n| match &n.detail {
            NodeDetail::Fact { topic, .. } => Some(topic.to_string()),
            _ => None,
        })
        .collect();
    for topic in ["pit.net_tax", "pit.income_tax", "pit.lito", "pit.medicare_levy", "pit.taxable_income"] {
        assert!(facts.contains(&topic.to_string()), "{topic} missing from chain");
    }

    let references: Vec<&str> = chain
        .nodes_where(|n| matches!(n, NodeRef::Reference { .. }))
        .filter_map(|n| match &n.node {
            NodeRef::Reference { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert!(references.contains(&"ITRA1986"));
    assert!(references.contains(&"MLA1986"));
    assert!(references.contains(&"ITAA1997"));
    // The superseded guidance rule never contributed.
    assert!(!references.contains(&"ATO-QC-MLS"));

    let pinpoints: Vec<&str> = chain
        .edges
        .iter()
        .filter(|e| e.relation == Relation::Cites)
        .filter_map(|e| e.pinpoint.as_deref())
        .collect();
    assert!(pinpoints.contains(&"Sch 7 Pt I"));
    assert!(pinpoints.contains(&"s 6"));
    assert!(pinpoints.contains(&"s 7"));

    // fact -> upstream fact -> taxable income -> rule -> reference
    assert!(chain.depth >= 4);
}

#[test]
fn chain_records_exact_assumption_versions() {
    let engine = common::engine();
    let id = fact_id(&engine, "100000", "pit.income_tax");
    let chain = engine.explain(id).unwrap();

    let uses: Vec<&NodeRef> = chain
        .edges
        .iter()
        .filter(|e| e.relation == Relation::Uses && e.src == NodeRef::Fact { id })
        .map(|e| &e.dst)
        .collect();
    assert_eq!(
        uses,
        vec![&NodeRef::Assumption {
            key: "pit.brackets".to_string(),
            version: 1
        }]
    );

    let computed_by = chain
        .edges
        .iter()
        .find(|e| e.relation == Relation::ComputedBy && e.src == NodeRef::Fact { id })
        .unwrap();
    let NodeRef::Rule { rule_id, version, .. } = &computed_by.dst else {
        panic!("computed_by must point at a rule");
    };
    assert_eq!(rule_id, "pit.income_tax");
    assert_eq!(*version, 1);
}

#[test]
fn depth_cap_is_enforced() {
    let config = EngineConfig {
        max_provenance_depth: 2,
        ..fast_config()
    };
    let engine = CalcEngine::new(EngineStores::in_memory(rule_store()), config).unwrap();
    engine.publish_ruleset(common::artifact()).unwrap();
    engine.validate_ruleset(&common::ruleset_id()).unwrap();
    engine.activate_ruleset(&common::ruleset_id(), None).unwrap();

    let id = fact_id(&engine, "100000", "pit.net_tax");
    let err = engine.explain(id).unwrap_err();
    assert!(matches!(
        err,
        CalcError::Execution(ExecutionError::ProvenanceDepthExceeded { max_depth: 2, .. })
    ));

    // A leaf fact fits: fact -> rule -> reference.
    let taxable = fact_id(&engine, "100000", "pit.taxable_income");
    assert_eq!(engine.explain(taxable).unwrap().depth, 2);
}

#[test]
fn batch_explain_reports_each_fact_separately() {
    let engine = active_engine(EngineStores::in_memory(rule_store()));
    let known = fact_id(&engine, "40000", "pit.lito");
    let unknown = FactId(Uuid::nil());

    let results = engine.explain_batch(&[known, unknown]);
    assert_eq!(results.len(), 2);
    assert!(results[&known].is_ok());
    let Err(CalcError::Validation(ValidationError::NotFound { resource, .. })) = &results[&unknown] else {
        panic!("unknown fact should be not found");
    };
    assert_eq!(*resource, "fact");
}

#[test]
fn replayed_run_adds_no_edges() {
    let engine = common::engine();
    let req = request("100000").with_idempotency_key("replay");
    let first = engine.run(&req).unwrap();
    let id = first.facts.last().unwrap().id;
    let before = engine.explain(id).unwrap();

    engine.run(&req).unwrap();
    let after = engine.explain(id).unwrap();
    assert_eq!(before.edges.len(), after.edges.len());
    assert_eq!(before.nodes, after.nodes);
}
