//! Ruleset publish / validate / activate / rollback through the engine.

mod common;

use common::{dollars, percent, request, rules, value_of};
use factforge::ruleset::IssueKind;
use factforge::{
    CalcError, CalcEngine, ConflictError, EffectiveWindow, EngineStores, Expr, PrecedenceTier, Rule, RulesetArtifact,
    RulesetId, RulesetStatus, Unit, ValidationError,
};

fn next_year_id() -> RulesetId {
    RulesetId::parse("ruleset-20250101-levy").unwrap()
}

/// Same rules with the levy raised to 2.5%.
fn raised_levy() -> RulesetArtifact {
    let mut next: Vec<Rule> = rules()
        .into_iter()
        .filter(|r| r.topic.as_str() != "pit.medicare_levy")
        .collect();
    next.push(
        Rule::builder()
            .id("pit.medicare_levy", 2)
            .topic("pit.medicare_levy")
            .tier(PrecedenceTier::Statute)
            .window(EffectiveWindow::starting(common::fy25_start()))
            .expression(Expr::mul(Expr::topic("pit.taxable_income"), Expr::constant(percent("2.5"))))
            .unit(Unit::Dollars)
            .cite("MLA1986", "s 6")
            .description("Levy at 2.5% with no low-income threshold")
            .build()
            .unwrap(),
    );
    RulesetArtifact::new(next_year_id(), None, next).unwrap()
}

fn publish_and_validate(engine: &CalcEngine, artifact: RulesetArtifact) -> RulesetId {
    let id = artifact.id.clone();
    engine.publish_ruleset(artifact).unwrap();
    assert!(engine.validate_ruleset(&id).unwrap().passed);
    id
}

#[test]
fn activation_supersedes_and_old_facts_stay_put() {
    let engine = common::engine();
    let before = engine.run(&request("100000")).unwrap();
    let old_levy = before
        .facts
        .iter()
        .find(|f| f.topic.as_str() == "pit.medicare_levy")
        .unwrap()
        .clone();

    let next = publish_and_validate(&engine, raised_levy());
    let active = engine.activate_ruleset(&next, None).unwrap();
    assert_eq!(active.status, RulesetStatus::Active);
    assert_eq!(engine.publisher().active().unwrap().unwrap().id, next);
    let old = engine.publisher().get(&common::ruleset_id()).unwrap();
    assert_eq!(old.status, RulesetStatus::Superseded);
    assert!(old.activations[0].deactivated_at.is_some());

    let mut req = request("100000");
    req.ruleset_id = next.clone();
    let after = engine.run(&req).unwrap();
    assert_eq!(*value_of(&after.facts, "pit.medicare_levy"), dollars("2500"));

    // Facts under the superseded ruleset are untouched and still computable.
    assert_eq!(engine.fact(old_levy.id).unwrap(), old_levy);
    let replay = engine.run(&request("100000")).unwrap();
    assert_eq!(*value_of(&replay.facts, "pit.medicare_levy"), dollars("2000"));
}

#[test]
fn rollback_restores_the_previous_snapshot() {
    let engine = common::engine();
    let next = publish_and_validate(&engine, raised_levy());
    engine.activate_ruleset(&next, None).unwrap();

    let restored = engine.rollback_ruleset(&common::ruleset_id(), None).unwrap();
    assert_eq!(restored.status, RulesetStatus::Active);
    assert_eq!(restored.activations.len(), 2);
    assert_eq!(
        engine.publisher().get(&next).unwrap().status,
        RulesetStatus::Superseded
    );

    // Only superseded snapshots can be rolled back to.
    let err = engine.rollback_ruleset(&common::ruleset_id(), None).unwrap_err();
    assert!(matches!(err, CalcError::Validation(ValidationError::InvalidTransition { .. })));
}

#[test]
fn stale_revision_loses_the_activation_race() {
    let engine = common::engine();
    let next = publish_and_validate(&engine, raised_levy());
    let seen = engine.publisher().revision().unwrap();

    engine.publisher().activate(&next, Some(seen)).unwrap();
    let err = engine.rollback_ruleset(&common::ruleset_id(), Some(seen)).unwrap_err();
    assert!(matches!(err, CalcError::Conflict(ConflictError::VersionConflict { .. })));
    assert_eq!(engine.publisher().active().unwrap().unwrap().id, next);
}

#[test]
fn failed_validation_blocks_activation() {
    let engine = common::engine();
    let broken = Rule::builder()
        .id("pit.medicare_levy", 3)
        .topic("pit.medicare_levy")
        .tier(PrecedenceTier::Statute)
        .window(EffectiveWindow::starting(common::fy25_start()))
        .expression(Expr::mul(
            Expr::topic("pit.taxable_income"),
            Expr::assumption("medicare.surcharge"),
        ))
        .unit(Unit::Dollars)
        .cite("MLA1986", "s 8B")
        .build()
        .unwrap();
    let id = RulesetId::parse("ruleset-20250101-broken").unwrap();
    let mut next: Vec<Rule> = rules()
        .into_iter()
        .filter(|r| r.topic.as_str() != "pit.medicare_levy")
        .collect();
    next.push(broken);
    engine
        .publish_ruleset(RulesetArtifact::new(id.clone(), None, next).unwrap())
        .unwrap();

    let err = engine.validate_ruleset(&id).unwrap_err();
    let CalcError::Validation(ValidationError::RulesetValidationFailed { issues, .. }) = &err else {
        panic!("expected RulesetValidationFailed, got {err:?}");
    };
    assert!(issues.len() >= 2);
    let report = engine.publisher().get(&id).unwrap().last_validation.unwrap();
    assert!(!report.passed);
    assert!(report.has(IssueKind::UnknownPinpoint));
    assert!(report.has(IssueKind::UndeclaredAssumption));
    assert_eq!(engine.publisher().get(&id).unwrap().status, RulesetStatus::Draft);

    let err = engine.activate_ruleset(&id, None).unwrap_err();
    assert_eq!(err.kind(), "ruleset_validation_failed");

    // The failed draft cannot serve calculations either.
    let mut req = request("100000");
    req.ruleset_id = id.clone();
    let err = engine.run(&req).unwrap_err();
    assert!(matches!(err, CalcError::Validation(ValidationError::RulesetNotActive { .. })));

    engine.publisher().discard(&id).unwrap();
    let err = engine.publisher().get(&id).unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[test]
fn republishing_an_id_is_a_conflict() {
    let engine = common::engine();
    let err = engine.publish_ruleset(common::artifact()).unwrap_err();
    assert!(matches!(err, CalcError::Conflict(ConflictError::DuplicateRuleset { .. })));
}

#[test]
fn tampered_rule_fails_hash_check() {
    let engine = CalcEngine::new(EngineStores::in_memory(common::rule_store()), common::fast_config()).unwrap();
    let mut tampered = rules();
    let net = tampered
        .iter_mut()
        .find(|r| r.topic.as_str() == "pit.net_tax")
        .unwrap();
    net.expression = Expr::constant(dollars("0"));
    let artifact = RulesetArtifact::new(common::ruleset_id(), None, tampered).unwrap();
    engine.publish_ruleset(artifact).unwrap();

    let err = engine.validate_ruleset(&common::ruleset_id()).unwrap_err();
    assert_eq!(err.kind(), "ruleset_validation_failed");
    let stored = engine.publisher().get(&common::ruleset_id()).unwrap();
    assert_eq!(stored.status, RulesetStatus::Draft);
    assert!(stored.last_validation.unwrap().has(IssueKind::RuleHashMismatch));
}
