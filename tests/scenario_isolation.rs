//! What-if scenarios never see or disturb each other's facts.

mod common;

use common::{dollars, engine, request, value_of};
use factforge::scenario::ScenarioUpdate;
use factforge::{CalcError, ConflictError, FactQuery, Scenario, ScenarioId, ScenarioStatus, ValidationError};

fn salary_sacrifice() -> ScenarioId {
    ScenarioId::new("salary-sacrifice")
}

#[test]
fn scenario_facts_are_isolated_from_base() {
    let engine = engine();
    engine
        .scenarios()
        .create(Scenario::new(salary_sacrifice(), "Salary sacrifice 10k"))
        .unwrap();

    let base = engine.run(&request("100000")).unwrap();

    let mut what_if = request("90000");
    what_if.scenario_id = salary_sacrifice();
    what_if.client_data.insert("concessional", dollars("20000"));
    let alt = engine.run(&what_if).unwrap();

    assert!(alt.facts.iter().all(|f| f.scenario_id == salary_sacrifice()));
    assert!(base.facts.iter().all(|f| f.scenario_id.is_base()));

    let base_page = engine.facts(&FactQuery::scenario(ScenarioId::base())).unwrap();
    let alt_page = engine.facts(&FactQuery::scenario(salary_sacrifice())).unwrap();
    assert_eq!(base_page.total, base.facts.len());
    assert_eq!(alt_page.total, alt.facts.len());
    assert_eq!(*value_of(&base_page.facts, "pit.net_tax"), dollars("22788"));
}

#[test]
fn same_inputs_in_two_scenarios_are_two_facts() {
    let engine = engine();
    engine
        .scenarios()
        .create(Scenario::new(salary_sacrifice(), "Salary sacrifice"))
        .unwrap();

    let base = engine.run(&request("100000")).unwrap();
    let mut copy = request("100000");
    copy.scenario_id = salary_sacrifice();
    let alt = engine.run(&copy).unwrap();

    assert!(!alt.replayed);
    for (a, b) in base.facts.iter().zip(&alt.facts) {
        assert_eq!(a.topic, b.topic);
        assert_eq!(a.value, b.value);
        assert_ne!(a.id, b.id);
    }
}

#[test]
fn comparison_lines_up_topics_side_by_side() {
    let engine = engine();
    engine
        .scenarios()
        .create(Scenario::new(salary_sacrifice(), "Salary sacrifice"))
        .unwrap();

    engine
        .run(&request("100000").with_targets(["pit.net_tax"]))
        .unwrap();
    let mut what_if = request("90000").with_targets(["pit.net_tax"]);
    what_if.scenario_id = salary_sacrifice();
    engine.run(&what_if).unwrap();

    let comparison = engine
        .compare_scenarios(
            &[ScenarioId::base(), salary_sacrifice()],
            &FactQuery::default().topic("pit.net_tax"),
        )
        .unwrap();
    assert_eq!(comparison.scenarios, vec![ScenarioId::base(), salary_sacrifice()]);
    assert_eq!(comparison.rows.len(), 1);
    let row = &comparison.rows[0];
    assert_eq!(row.cells[0][0].value, dollars("22788"));
    // 90000: 4288 + 13500 income tax, 1800 levy, no offset.
    assert_eq!(row.cells[1][0].value, dollars("19588"));
}

#[test]
fn comparison_of_unknown_scenario_is_not_found() {
    let engine = engine();
    let err = engine
        .compare_scenarios(&[ScenarioId::base(), ScenarioId::new("nope")], &FactQuery::default())
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[test]
fn archived_scenario_is_read_only() {
    let engine = engine();
    let created = engine
        .scenarios()
        .create(Scenario::new(salary_sacrifice(), "Salary sacrifice"))
        .unwrap();
    let mut what_if = request("90000");
    what_if.scenario_id = salary_sacrifice();
    let before = engine.run(&what_if).unwrap();

    let archived = engine.scenarios().archive(&salary_sacrifice(), created.version).unwrap();
    assert_eq!(archived.status, ScenarioStatus::Archived);

    let mut again = request("80000");
    again.scenario_id = salary_sacrifice();
    let err = engine.run(&again).unwrap_err();
    assert!(matches!(err, CalcError::Validation(ValidationError::ScenarioArchived { .. })));

    // Existing facts remain readable.
    assert_eq!(engine.fact(before.facts[0].id).unwrap().id, before.facts[0].id);
}

#[test]
fn base_scenario_cannot_be_archived() {
    let engine = engine();
    let base = engine.scenarios().get(&ScenarioId::base()).unwrap();
    let err = engine.scenarios().archive(&ScenarioId::base(), base.version).unwrap_err();
    assert!(matches!(err, CalcError::Validation(ValidationError::BaseScenarioImmutable)));
}

#[test]
fn updates_use_optimistic_versions() {
    let engine = engine();
    let created = engine
        .scenarios()
        .create(Scenario::new(salary_sacrifice(), "Salary sacrifice"))
        .unwrap();

    let renamed = engine
        .scenarios()
        .update(
            &salary_sacrifice(),
            created.version,
            ScenarioUpdate {
                name: Some("Sacrifice 15k".to_string()),
                description: None,
            },
        )
        .unwrap();
    assert_eq!(renamed.version, created.version + 1);

    let err = engine
        .scenarios()
        .update(&salary_sacrifice(), created.version, ScenarioUpdate::default())
        .unwrap_err();
    assert!(matches!(err, CalcError::Conflict(ConflictError::VersionConflict { .. })));
}

#[test]
fn unknown_scenario_is_rejected_before_evaluation() {
    let engine = engine();
    let mut req = request("100000");
    req.scenario_id = ScenarioId::new("never-created");
    let err = engine.run(&req).unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
