//! End-to-end calculation runs against the 2024-25 fixture.

mod common;

use std::time::{Duration, Instant};

use bigdecimal::BigDecimal;
use common::{dollars, engine, request, value_of};
use factforge::{
    CalcError, ConflictError, ExecutionError, FactQuery, Quantity, RunOutcome, ScenarioId, Unit, ValidationError,
};

#[test]
fn middle_income_matches_published_rates() {
    let engine = engine();
    let outcome = engine.run(&request("100000")).unwrap();

    assert!(!outcome.replayed);
    assert_eq!(*value_of(&outcome.facts, "pit.taxable_income"), dollars("100000"));
    assert_eq!(*value_of(&outcome.facts, "pit.income_tax"), dollars("20788"));
    assert_eq!(*value_of(&outcome.facts, "pit.medicare_levy"), dollars("2000"));
    assert_eq!(*value_of(&outcome.facts, "pit.lito"), dollars("0"));
    assert_eq!(*value_of(&outcome.facts, "pit.net_tax"), dollars("22788"));
    assert_eq!(*value_of(&outcome.facts, "super.contributions_tax"), dollars("1500"));
    assert_eq!(*value_of(&outcome.facts, "super.excess_concessional"), dollars("0"));
    assert_eq!(*value_of(&outcome.facts, "super.div293_tax"), dollars("0"));
}

#[test]
fn low_income_offset_reduces_tax() {
    let engine = engine();

    let forty = engine.run(&request("40000")).unwrap();
    assert_eq!(*value_of(&forty.facts, "pit.income_tax"), dollars("3488"));
    assert_eq!(*value_of(&forty.facts, "pit.lito"), dollars("575"));
    assert_eq!(*value_of(&forty.facts, "pit.medicare_levy"), dollars("800"));
    assert_eq!(*value_of(&forty.facts, "pit.net_tax"), dollars("3713"));

    // Offset is non-refundable and the levy threshold is not reached.
    let twenty = engine.run(&request("20000")).unwrap();
    assert_eq!(*value_of(&twenty.facts, "pit.income_tax"), dollars("288"));
    assert_eq!(*value_of(&twenty.facts, "pit.lito"), dollars("700"));
    assert_eq!(*value_of(&twenty.facts, "pit.medicare_levy"), dollars("0"));
    assert_eq!(*value_of(&twenty.facts, "pit.net_tax"), dollars("0"));
}

#[test]
fn high_income_pays_division_293() {
    let engine = engine();
    let mut req = request("245000");
    req.client_data.insert("concessional", dollars("35000"));
    let outcome = engine.run(&req).unwrap();

    // 245000 + 35000 exceeds 250000 by 30000, which is below the contributions.
    assert_eq!(*value_of(&outcome.facts, "super.div293_tax"), dollars("4500"));
    assert_eq!(*value_of(&outcome.facts, "super.excess_concessional"), dollars("5000"));
    assert_eq!(*value_of(&outcome.facts, "super.contributions_tax"), dollars("4500"));
}

#[test]
fn projection_compounds_and_rounds_to_cents() {
    let engine = engine();
    let outcome = engine
        .run(&request("100000").with_targets(["proj.super_balance_10y"]))
        .unwrap();

    assert_eq!(outcome.facts.len(), 1);
    let fact = &outcome.facts[0];
    assert_eq!(fact.value, dollars("196715.14"));
    assert_eq!(fact.rounding_steps.len(), 1);
    assert_eq!(fact.rounding_steps[0].after, "196715.14");
    assert_ne!(fact.rounding_steps[0].before, fact.rounding_steps[0].after);
}

#[test]
fn statute_outranks_guidance_for_the_same_topic() {
    let engine = engine();
    let outcome = engine
        .run(&request("100000").with_targets(["pit.medicare_levy"]))
        .unwrap();

    let levy = outcome
        .facts
        .iter()
        .find(|f| f.topic.as_str() == "pit.medicare_levy")
        .unwrap();
    assert_eq!(levy.value, dollars("2000"));
    assert_eq!(levy.rules.len(), 1);
    assert_eq!(levy.rules[0].rule_id, "pit.medicare_levy");
}

#[test]
fn targets_pull_in_only_their_dependencies() {
    let engine = engine();
    let outcome = engine.run(&request("100000").with_targets(["pit.net_tax"])).unwrap();

    let topics: Vec<&str> = outcome.facts.iter().map(|f| f.topic.as_str()).collect();
    assert_eq!(topics.len(), 5);
    assert!(!topics.contains(&"super.contributions_tax"));
    // Dependency order: net tax is computed last.
    assert_eq!(*topics.last().unwrap(), "pit.net_tax");
    let taxable = topics.iter().position(|t| *t == "pit.taxable_income").unwrap();
    let income_tax = topics.iter().position(|t| *t == "pit.income_tax").unwrap();
    assert!(taxable < income_tax);
}

#[test]
fn trace_names_every_executed_rule() {
    let engine = engine();
    let outcome = engine.run(&request("100000")).unwrap();

    assert_eq!(outcome.trace.len(), outcome.facts.len());
    for (entry, fact) in outcome.trace.iter().zip(&outcome.facts) {
        assert_eq!(entry.topic, fact.topic);
        assert_eq!(entry.rule, fact.rules[0]);
        assert!(!entry.detail.is_empty());
    }
}

#[test]
fn evaluation_is_deterministic_over_many_runs() {
    let engine = engine();
    let req = request("123456.78");
    let first = engine.prepare(&req).unwrap();
    let first_edges: Vec<_> = first.edges().iter().map(|e| e.id).collect();
    assert!(!first_edges.is_empty());

    for _ in 0..1_000 {
        let again = engine.prepare(&req).unwrap();
        assert_eq!(again.facts().len(), first.facts().len());
        for (a, b) in again.facts().iter().zip(first.facts()) {
            assert!(a.same_content(b), "{} drifted", a.topic);
        }
        let edges: Vec<_> = again.edges().iter().map(|e| e.id).collect();
        assert_eq!(edges, first_edges);
    }
}

#[test]
fn prepare_writes_nothing() {
    let engine = engine();
    let prepared = engine.prepare(&request("100000")).unwrap();
    let id = prepared.facts()[0].id;

    let Err(CalcError::Validation(ValidationError::NotFound { resource, .. })) = engine.fact(id) else {
        panic!("prepared fact should not be stored");
    };
    assert_eq!(resource, "fact");

    engine.commit(prepared).unwrap();
    assert_eq!(engine.fact(id).unwrap().id, id);
}

#[test]
fn repeated_idempotency_key_returns_the_first_result() {
    let engine = engine();
    let req = request("100000").with_idempotency_key("client-42/fy25");
    let first = engine.run(&req).unwrap();
    let second = engine.run(&req).unwrap();

    assert!(second.replayed);
    assert!(second.trace.is_empty());
    assert_eq!(second.idempotency_key, first.idempotency_key);
    let first_ids: Vec<_> = first.facts.iter().map(|f| f.id).collect();
    let second_ids: Vec<_> = second.facts.iter().map(|f| f.id).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(first.facts[0].created_at, second.facts[0].created_at);
}

#[test]
fn concurrent_runs_with_one_key_store_one_set_of_facts() {
    let engine = engine();
    let req = request("100000").with_idempotency_key("client-9/fy25");

    let outcomes: Vec<RunOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| engine.run(&req).unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ids = |o: &RunOutcome| o.facts.iter().map(|f| f.id).collect::<Vec<_>>();
    let first_ids = ids(&outcomes[0]);
    assert!(outcomes.iter().all(|o| ids(o) == first_ids));
    assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);

    let page = engine.facts(&FactQuery::default()).unwrap();
    assert_eq!(page.total, first_ids.len());
}

#[test]
fn reused_key_for_another_request_is_rejected() {
    let engine = engine();
    engine
        .run(&request("100000").with_idempotency_key("client-42/fy25"))
        .unwrap();

    let err = engine
        .run(&request("90000").with_idempotency_key("client-42/fy25"))
        .unwrap_err();
    assert!(matches!(err, CalcError::Conflict(ConflictError::IdempotencyMismatch { .. })));
    assert_eq!(err.kind(), "idempotency_mismatch");
}

#[test]
fn missing_client_field_fails_before_any_write() {
    let engine = engine();
    let mut req = request("100000");
    req.client_data = factforge::ClientData::new().with("salary", dollars("100000"));

    let err = engine.run(&req).unwrap_err();
    assert!(matches!(err, CalcError::Validation(ValidationError::MissingInput { .. })));
    assert_eq!(engine.facts(&FactQuery::default()).unwrap().total, 0);
}

#[test]
fn unknown_target_is_a_missing_rule() {
    let engine = engine();
    let err = engine
        .run(&request("100000").with_targets(["pit.payroll_tax"]))
        .unwrap_err();
    let CalcError::Execution(ExecutionError::MissingRule { topic, .. }) = &err else {
        panic!("expected MissingRule, got {err:?}");
    };
    assert_eq!(topic, "pit.payroll_tax");
}

#[test]
fn as_of_before_any_rule_window_has_no_rule() {
    let engine = engine();
    let mut req = request("100000").with_targets(["pit.net_tax"]);
    req.as_of = common::date(2024, 6, 30);
    let err = engine.run(&req).unwrap_err();
    assert!(matches!(err, CalcError::Execution(ExecutionError::MissingRule { .. })));
}

#[test]
fn facts_are_queryable_by_topic_pattern() {
    let engine = engine();
    engine.run(&request("100000")).unwrap();
    engine.run(&request("40000")).unwrap();

    let page = engine
        .facts(&FactQuery::scenario(ScenarioId::base()).topic_pattern(r"super\..*"))
        .unwrap();
    assert_eq!(page.total, 6);
    assert!(page.facts.iter().all(|f| f.topic.as_str().starts_with("super.")));

    let bad = engine.facts(&FactQuery::default().topic_pattern("(")).unwrap_err();
    assert!(matches!(bad, CalcError::Validation(ValidationError::InvalidQuery { .. })));
}

#[test]
fn capital_gains_are_discounted_after_losses() {
    let engine = engine();
    let mut req = request("100000").with_targets(["cgt.net_capital_gain"]);
    req.client_data.insert("capital_gains", dollars("10000"));
    req.client_data.insert("capital_losses", dollars("2000"));
    let outcome = engine.run(&req).unwrap();
    assert_eq!(*value_of(&outcome.facts, "cgt.net_capital_gain"), dollars("4000"));

    // Losses exceeding gains carry no negative gain.
    let mut loss = request("100000").with_targets(["cgt.net_capital_gain"]);
    loss.client_data.insert("capital_losses", dollars("500"));
    let outcome = engine.run(&loss).unwrap();
    assert_eq!(*value_of(&outcome.facts, "cgt.net_capital_gain"), dollars("0"));
}

#[test]
fn huge_exponent_input_is_refused_up_front() {
    let engine = engine();
    let mut req = request("100000");
    let huge: BigDecimal = "1e1000000".parse().unwrap();
    req.client_data.insert("salary", Quantity::new(huge, Unit::Dollars));

    let started = Instant::now();
    let err = engine.run(&req).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err.kind(), "precision_exceeded");
    assert!(err.is_validation());
    assert_eq!(engine.facts(&FactQuery::default()).unwrap().total, 0);

    let json = r#"{"client_data": {"salary": {"amount": "1e20000000", "unit": "dollars"}},
                   "ruleset_id": "ruleset-20240701", "as_of": "2025-01-15", "scenario_id": "base"}"#;
    let parsed = serde_json::from_str::<factforge::CalculationRequest>(json);
    assert!(parsed.unwrap_err().to_string().contains("integer digits"));
}
