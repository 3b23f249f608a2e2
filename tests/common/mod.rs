//! Shared fixtures: Australian individual tax and superannuation rules for
//! the 2024-25 income year.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;

use factforge::storage::memory::{InMemoryFactStore, InMemoryRuleStore};
use factforge::{
    Assumption, Bracket, BracketSchedule, CalcEngine, CalculationRequest, ClientData, Comparison, EffectiveWindow,
    EngineConfig, EngineStores, Expr, Fact, FactId, FactPage, FactQuery, FactStore, PrecedenceTier, Quantity,
    Reference, RetryPolicy, Rule, RulesetArtifact, RulesetId, ScenarioId, StorageError, Unit,
};

pub const RULESET: &str = "ruleset-20240701";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn fy25_start() -> NaiveDate {
    date(2024, 7, 1)
}

pub fn as_of() -> NaiveDate {
    date(2025, 1, 15)
}

pub fn ruleset_id() -> RulesetId {
    RulesetId::parse(RULESET).unwrap()
}

pub fn dollars(text: &str) -> Quantity {
    Quantity::parse(text, Unit::Dollars).unwrap()
}

pub fn percent(text: &str) -> Quantity {
    Quantity::parse(text, Unit::Percent).unwrap()
}

fn fy25() -> EffectiveWindow {
    EffectiveWindow::starting(fy25_start())
}

pub fn references() -> Vec<Reference> {
    vec![
        Reference::new("ITRA1986", 1, "Income Tax Rates Act 1986", EffectiveWindow::always())
            .with_publisher("Commonwealth of Australia")
            .with_pinpoint("Sch 7 Pt I"),
        Reference::new("MLA1986", 1, "Medicare Levy Act 1986", EffectiveWindow::always())
            .with_publisher("Commonwealth of Australia")
            .with_pinpoint("s 6")
            .with_pinpoint("s 7"),
        Reference::new("ITAA1997", 1, "Income Tax Assessment Act 1997", EffectiveWindow::always())
            .with_publisher("Commonwealth of Australia")
            .with_pinpoint("s 4-15")
            .with_pinpoint("s 61-115")
            .with_pinpoint("s 115-25")
            .with_pinpoint("s 291-20")
            .with_pinpoint("s 295-160")
            .with_pinpoint("s 293-20"),
        Reference::new("ATO-QC-MLS", 1, "ATO guidance: Medicare levy", EffectiveWindow::always())
            .with_publisher("Australian Taxation Office")
            .with_pinpoint("para 3"),
    ]
}

pub fn brackets() -> BracketSchedule {
    BracketSchedule::new(vec![
        Bracket::new(dollars("0"), percent("0")),
        Bracket::new(dollars("18200"), percent("16")),
        Bracket::new(dollars("45000"), percent("30")),
        Bracket::new(dollars("135000"), percent("37")),
        Bracket::new(dollars("190000"), percent("45")),
    ])
}

pub fn assumptions() -> Vec<Assumption> {
    vec![
        Assumption::schedule("pit.brackets", 1, brackets(), fy25()).with_source("ITRA1986"),
        Assumption::scalar("medicare.rate", 1, percent("2"), fy25()).with_source("MLA1986"),
        Assumption::scalar("medicare.threshold", 1, dollars("26000"), fy25()).with_source("MLA1986"),
        Assumption::scalar("lito.max", 1, dollars("700"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("super.concessional_cap", 1, dollars("30000"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("super.contributions_tax_rate", 1, percent("15"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("div293.threshold", 1, dollars("250000"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("div293.rate", 1, percent("15"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("cgt.discount", 1, percent("50"), fy25()).with_source("ITAA1997"),
        Assumption::scalar("projection.growth_rate", 1, percent("7"), fy25()),
    ]
}

pub fn rule_store() -> Arc<InMemoryRuleStore> {
    let store = InMemoryRuleStore::new();
    for reference in references() {
        store.insert_reference(reference).unwrap();
    }
    for assumption in assumptions() {
        store.insert_assumption(assumption).unwrap();
    }
    Arc::new(store)
}

fn statute(id: &str, topic: &str, expression: Expr) -> factforge::RuleBuilder {
    Rule::builder()
        .id(id, 1)
        .topic(topic)
        .tier(PrecedenceTier::Statute)
        .window(fy25())
        .expression(expression)
        .unit(Unit::Dollars)
}

fn taxable() -> Expr {
    Expr::topic("pit.taxable_income")
}

fn net_gain() -> Expr {
    Expr::floor_zero(Expr::sub(Expr::input("capital_gains"), Expr::input("capital_losses")))
}

pub fn rules() -> Vec<Rule> {
    let zero = || Expr::constant(dollars("0"));
    vec![
        statute(
            "pit.taxable_income",
            "pit.taxable_income",
            Expr::floor_zero(Expr::sub(Expr::input("salary"), Expr::input("deductions"))),
        )
        .cite("ITAA1997", "s 4-15")
        .build()
        .unwrap(),
        statute("pit.income_tax", "pit.income_tax", Expr::progressive(taxable(), "pit.brackets"))
            .assumption("pit.brackets")
            .cite("ITRA1986", "Sch 7 Pt I")
            .build()
            .unwrap(),
        statute(
            "pit.medicare_levy",
            "pit.medicare_levy",
            Expr::if_cmp(
                taxable(),
                Comparison::Gt,
                Expr::assumption("medicare.threshold"),
                Expr::mul(taxable(), Expr::assumption("medicare.rate")),
                zero(),
            ),
        )
        .assumption("medicare.rate")
        .assumption("medicare.threshold")
        .cite("MLA1986", "s 6")
        .cite("MLA1986", "s 7")
        .build()
        .unwrap(),
        // Superseded by the statute rule for the same topic.
        Rule::builder()
            .id("ato.medicare_levy_estimate", 1)
            .topic("pit.medicare_levy")
            .tier(PrecedenceTier::Guidance)
            .window(fy25())
            .expression(Expr::mul(taxable(), Expr::constant(percent("3"))))
            .unit(Unit::Dollars)
            .cite("ATO-QC-MLS", "para 3")
            .build()
            .unwrap(),
        statute(
            "pit.lito",
            "pit.lito",
            Expr::floor_zero(Expr::sub(
                Expr::sub(
                    Expr::assumption("lito.max"),
                    Expr::mul(
                        Expr::min(vec![
                            Expr::max(vec![Expr::sub(taxable(), Expr::constant(dollars("37500"))), zero()]),
                            Expr::constant(dollars("7500")),
                        ]),
                        Expr::constant(percent("5")),
                    ),
                ),
                Expr::mul(
                    Expr::max(vec![Expr::sub(taxable(), Expr::constant(dollars("45000"))), zero()]),
                    Expr::constant(percent("1.5")),
                ),
            )),
        )
        .assumption("lito.max")
        .cite("ITAA1997", "s 61-115")
        .build()
        .unwrap(),
        statute(
            "pit.net_tax",
            "pit.net_tax",
            Expr::add(vec![
                Expr::floor_zero(Expr::sub(Expr::topic("pit.income_tax"), Expr::topic("pit.lito"))),
                Expr::topic("pit.medicare_levy"),
            ]),
        )
        .build()
        .unwrap(),
        statute(
            "super.contributions_tax",
            "super.contributions_tax",
            Expr::mul(
                Expr::min(vec![Expr::input("concessional"), Expr::assumption("super.concessional_cap")]),
                Expr::assumption("super.contributions_tax_rate"),
            ),
        )
        .assumption("super.concessional_cap")
        .assumption("super.contributions_tax_rate")
        .cite("ITAA1997", "s 295-160")
        .build()
        .unwrap(),
        statute(
            "super.excess_concessional",
            "super.excess_concessional",
            Expr::floor_zero(Expr::sub(
                Expr::input("concessional"),
                Expr::assumption("super.concessional_cap"),
            )),
        )
        .assumption("super.concessional_cap")
        .cite("ITAA1997", "s 291-20")
        .build()
        .unwrap(),
        statute(
            "super.div293_tax",
            "super.div293_tax",
            Expr::if_cmp(
                Expr::add(vec![taxable(), Expr::input("concessional")]),
                Comparison::Gt,
                Expr::assumption("div293.threshold"),
                Expr::mul(
                    Expr::min(vec![
                        Expr::input("concessional"),
                        Expr::sub(
                            Expr::add(vec![taxable(), Expr::input("concessional")]),
                            Expr::assumption("div293.threshold"),
                        ),
                    ]),
                    Expr::assumption("div293.rate"),
                ),
                zero(),
            ),
        )
        .assumption("div293.threshold")
        .assumption("div293.rate")
        .cite("ITAA1997", "s 293-20")
        .build()
        .unwrap(),
        statute(
            "cgt.net_capital_gain",
            "cgt.net_capital_gain",
            Expr::sub(
                net_gain(),
                Expr::mul(net_gain(), Expr::assumption("cgt.discount")),
            ),
        )
        .assumption("cgt.discount")
        .cite("ITAA1997", "s 115-25")
        .description("Discount method for assets held at least 12 months")
        .build()
        .unwrap(),
        Rule::builder()
            .id("proj.super_balance_10y", 1)
            .topic("proj.super_balance_10y")
            .tier(PrecedenceTier::Assumption)
            .window(fy25())
            .expression(Expr::compound(
                Expr::input("super_balance"),
                Expr::assumption("projection.growth_rate"),
                10,
            ))
            .unit(Unit::Dollars)
            .assumption("projection.growth_rate")
            .build()
            .unwrap(),
    ]
}

pub fn artifact() -> RulesetArtifact {
    RulesetArtifact::new(ruleset_id(), Some("AU individuals 2024-25".to_string()), rules()).unwrap()
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        ..EngineConfig::default()
    }
}

/// Engine over in-memory stores with the fixture ruleset active.
pub fn engine() -> CalcEngine {
    active_engine(EngineStores::in_memory(rule_store()))
}

pub fn active_engine(stores: EngineStores) -> CalcEngine {
    let engine = CalcEngine::new(stores, fast_config()).unwrap();
    engine.publish_ruleset(artifact()).unwrap();
    let report = engine.validate_ruleset(&ruleset_id()).unwrap();
    assert!(report.passed, "fixture ruleset failed validation: {:?}", report.issues);
    engine.activate_ruleset(&ruleset_id(), None).unwrap();
    engine
}

pub fn client(salary: &str) -> ClientData {
    ClientData::new()
        .with("salary", dollars(salary))
        .with("deductions", dollars("0"))
        .with("concessional", dollars("10000"))
        .with("super_balance", dollars("100000"))
        .with("capital_gains", dollars("0"))
        .with("capital_losses", dollars("0"))
}

pub fn request(salary: &str) -> CalculationRequest {
    CalculationRequest::new(client(salary), ruleset_id(), as_of(), ScenarioId::base())
}

pub fn value_of<'a>(facts: &'a [Fact], topic: &str) -> &'a Quantity {
    &facts
        .iter()
        .find(|f| f.topic.as_str() == topic)
        .unwrap_or_else(|| panic!("no fact for {topic}"))
        .value
}

/// Fact store whose first `failures` writes fail with a transient error.
pub struct FlakyFactStore {
    inner: InMemoryFactStore,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FlakyFactStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryFactStore::new(),
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl FactStore for FlakyFactStore {
    fn put(&self, fact: Fact) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("fact store restarting".to_string()));
        }
        self.inner.put(fact)
    }

    fn get(&self, id: FactId) -> Result<Option<Fact>, StorageError> {
        self.inner.get(id)
    }

    fn query(&self, query: &FactQuery) -> Result<FactPage, StorageError> {
        self.inner.query(query)
    }

    fn count(&self) -> Result<usize, StorageError> {
        self.inner.count()
    }
}
