//! Ruleset snapshots and the publisher state machine.
//!
//! A snapshot moves `Draft -> Validated -> Active -> Superseded`. Only
//! `activate` and `rollback` make a snapshot usable, and both are
//! optimistic-concurrency writes against the registry revision.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::digest::{digest_json, RULESET_DOMAIN};
use crate::error::{CalcError, CalcResult, ConflictError, ValidationError};
use crate::reference::{Assumption, Reference};
use crate::rule::{Rule, RuleVersionRef, Topic};
use crate::storage::{RuleStore, RulesetStore, StorageError};

/// Maximum number of rules in one snapshot.
pub const MAX_RULES_PER_SNAPSHOT: usize = 10_000;

/// Ruleset identifier: `ruleset-YYYYMMDD` with an optional `-suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulesetId(String);

impl RulesetId {
    /// Parses and validates an id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRulesetId` if the id is not `ruleset-YYYYMMDD[-suffix]`
    /// or the date does not exist.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let id = Self(value.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Checks the format. Deserialized ids are checked here as well.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRulesetId` on a malformed id.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = || ValidationError::InvalidRulesetId { value: self.0.clone() };
        let rest = self.0.strip_prefix("ruleset-").ok_or_else(invalid)?;
        let (date, suffix) = match rest.split_once('-') {
            Some((date, suffix)) => (date, Some(suffix)),
            None => (rest, None),
        };
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
        if let Some(suffix) = suffix {
            let ok = !suffix.is_empty()
                && suffix.len() <= 64
                && suffix.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
            if !ok {
                return Err(invalid());
            }
        }
        Ok(())
    }

    /// Date encoded in the id.
    #[must_use]
    pub fn date(&self) -> Option<NaiveDate> {
        let digits = self.0.get("ruleset-".len().."ruleset-".len() + 8)?;
        NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RulesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RulesetId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesetStatus {
    /// Published, not yet validated (or validation failed).
    Draft,
    /// Passed validation; may be activated.
    #[serde(alias = "published")]
    Validated,
    /// The snapshot in force for new calculations.
    Active,
    /// Previously active; usable for replays and rollback.
    Superseded,
}

impl RulesetStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Validated => "validated",
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for RulesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A portable ruleset as submitted for publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetArtifact {
    pub id: RulesetId,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    /// Declared checksum over the rule versions and their content hashes.
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumEntry<'a> {
    rule_id: &'a str,
    version: u32,
    content_hash: &'a str,
}

impl RulesetArtifact {
    /// Creates an artifact with its checksum sealed from `rules`.
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if hashing fails.
    pub fn new(id: RulesetId, description: Option<String>, rules: Vec<Rule>) -> CalcResult<Self> {
        let checksum = compute_checksum(&rules)?;
        Ok(Self {
            id,
            description,
            rules,
            checksum,
        })
    }
}

/// Checksum of a rule list; independent of rule order.
///
/// # Errors
///
/// Returns `CalcError::Internal` if hashing fails.
pub fn compute_checksum(rules: &[Rule]) -> CalcResult<String> {
    let mut entries: Vec<ChecksumEntry<'_>> = rules
        .iter()
        .map(|r| ChecksumEntry {
            rule_id: &r.id,
            version: r.version,
            content_hash: &r.content_hash,
        })
        .collect();
    entries.sort_by(|a, b| (a.rule_id, a.version).cmp(&(b.rule_id, b.version)));
    digest_json(RULESET_DOMAIN, &entries)
}

/// One period during which a snapshot was active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub activated_at: DateTime<Utc>,
    /// `None` while the snapshot is still active.
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyRuleset,
    InvalidRule,
    DuplicateRule,
    RuleHashMismatch,
    ChecksumMismatch,
    MissingReference,
    UnknownPinpoint,
    MissingAssumption,
    UndeclaredAssumption,
    MissingDependency,
    DependencyCycle,
    SameTierOverlap,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Rule the finding is about, if any.
    pub rule: Option<RuleVersionRef>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rule {
            Some(rule) => write!(f, "[{rule}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of validating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ruleset_id: RulesetId,
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Returns true if an issue of `kind` was found.
    #[must_use]
    pub fn has(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }
}

/// A named, immutable collection of rule versions plus its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetSnapshot {
    pub id: RulesetId,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    pub checksum: String,
    pub status: RulesetStatus,
    /// Registry revision at which this snapshot was last written.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activations: Vec<ActivationRecord>,
    #[serde(default)]
    pub last_validation: Option<ValidationReport>,
}

impl RulesetSnapshot {
    /// Creates a draft from an artifact.
    #[must_use]
    pub fn draft(artifact: RulesetArtifact) -> Self {
        Self {
            id: artifact.id,
            description: artifact.description,
            rules: artifact.rules,
            checksum: artifact.checksum,
            status: RulesetStatus::Draft,
            revision: 0,
            created_at: Utc::now(),
            validated_at: None,
            activations: Vec::new(),
            last_validation: None,
        }
    }

    /// Returns true if calculations may run against this snapshot.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.status, RulesetStatus::Active | RulesetStatus::Superseded)
    }

    /// Looks up a rule version.
    #[must_use]
    pub fn rule(&self, rule_id: &str, version: u32) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id && r.version == version)
    }

    /// Rules producing `topic`.
    pub fn rules_for<'a>(&'a self, topic: &'a Topic) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| r.topic == *topic)
    }

    /// Every topic produced by some rule.
    #[must_use]
    pub fn topics(&self) -> BTreeSet<Topic> {
        self.rules.iter().map(|r| r.topic.clone()).collect()
    }

    fn close_activation(&mut self, at: DateTime<Utc>) {
        if let Some(current) = self.activations.last_mut() {
            if current.deactivated_at.is_none() {
                current.deactivated_at = Some(at);
            }
        }
    }
}

/// Runs the publisher checks against a snapshot. Pure apart from store reads.
///
/// # Errors
///
/// Propagates storage failures; findings are reported, not raised.
pub fn validate_snapshot(snapshot: &RulesetSnapshot, store: &dyn RuleStore) -> CalcResult<ValidationReport> {
    let mut issues = Vec::new();
    let mut issue = |kind: IssueKind, rule: Option<&Rule>, message: String| {
        issues.push(ValidationIssue {
            kind,
            rule: rule.map(Rule::version_ref),
            message,
        });
    };

    if snapshot.rules.is_empty() {
        issue(IssueKind::EmptyRuleset, None, "ruleset contains no rules".to_string());
    }
    if snapshot.rules.len() > MAX_RULES_PER_SNAPSHOT {
        issue(
            IssueKind::InvalidRule,
            None,
            format!("ruleset exceeds {MAX_RULES_PER_SNAPSHOT} rules"),
        );
    }

    let mut seen = HashSet::new();
    for rule in &snapshot.rules {
        if !seen.insert((rule.id.as_str(), rule.version)) {
            issue(IssueKind::DuplicateRule, Some(rule), "duplicate rule id and version".to_string());
        }
        if let Err(e) = rule.validate() {
            issue(IssueKind::InvalidRule, Some(rule), e.to_string());
        }
        if !rule.hash_matches()? {
            issue(
                IssueKind::RuleHashMismatch,
                Some(rule),
                "declared content hash does not match rule content".to_string(),
            );
        }
    }
    if compute_checksum(&snapshot.rules)? != snapshot.checksum {
        issue(
            IssueKind::ChecksumMismatch,
            None,
            "declared checksum does not match the rule set".to_string(),
        );
    }

    let produced = snapshot.topics();
    for rule in &snapshot.rules {
        for citation in &rule.citations {
            let versions: Vec<Reference> = store
                .reference_versions(&citation.reference_id)?
                .into_iter()
                .filter(|r| r.window.overlaps(&rule.window))
                .collect();
            if versions.is_empty() {
                issue(
                    IssueKind::MissingReference,
                    Some(rule),
                    format!("reference '{}' has no version in force during {}", citation.reference_id, rule.window),
                );
            } else if !versions.iter().any(|r| r.has_pinpoint(&citation.pinpoint)) {
                issue(
                    IssueKind::UnknownPinpoint,
                    Some(rule),
                    format!("reference '{}' has no pinpoint '{}'", citation.reference_id, citation.pinpoint),
                );
            }
        }

        for key in &rule.assumptions {
            let in_force = store
                .assumption_versions(key)?
                .iter()
                .any(|a: &Assumption| a.window.overlaps(&rule.window));
            if !in_force {
                issue(
                    IssueKind::MissingAssumption,
                    Some(rule),
                    format!("assumption '{key}' has no version in force during {}", rule.window),
                );
            }
        }
        for key in rule.expression.assumption_keys() {
            if !rule.assumptions.contains(&key) {
                issue(
                    IssueKind::UndeclaredAssumption,
                    Some(rule),
                    format!("expression reads assumption '{key}' which is not declared"),
                );
            }
        }
        for dep in rule.dependencies() {
            if !produced.contains(&dep) {
                issue(
                    IssueKind::MissingDependency,
                    Some(rule),
                    format!("no rule produces topic '{dep}'"),
                );
            }
        }
    }

    if let Some(cycle) = find_topic_cycle(&snapshot.rules) {
        issue(
            IssueKind::DependencyCycle,
            None,
            format!("topic dependency cycle: {}", cycle.join(" -> ")),
        );
    }

    for (i, a) in snapshot.rules.iter().enumerate() {
        for b in &snapshot.rules[i + 1..] {
            if a.topic == b.topic && a.tier == b.tier && a.window.overlaps(&b.window) {
                issue(
                    IssueKind::SameTierOverlap,
                    Some(b),
                    format!(
                        "overlaps {} for topic '{}' at tier {}",
                        a.version_ref(),
                        a.topic,
                        a.tier.as_str()
                    ),
                );
            }
        }
    }

    Ok(ValidationReport {
        ruleset_id: snapshot.id.clone(),
        passed: issues.is_empty(),
        issues,
        checked_at: Utc::now(),
    })
}

/// First cycle in the topic graph, as a closed path of topic names.
fn find_topic_cycle(rules: &[Rule]) -> Option<Vec<String>> {
    let mut graph: BTreeMap<&Topic, BTreeSet<Topic>> = BTreeMap::new();
    for rule in rules {
        graph.entry(&rule.topic).or_default().extend(rule.dependencies());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        topic: &'a Topic,
        graph: &'a BTreeMap<&'a Topic, BTreeSet<Topic>>,
        marks: &mut BTreeMap<&'a Topic, Mark>,
        path: &mut Vec<&'a Topic>,
    ) -> Option<Vec<String>> {
        match marks.get(topic) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|t| *t == topic).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
                cycle.push(topic.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(topic, Mark::Visiting);
        path.push(topic);
        if let Some(deps) = graph.get(topic) {
            for dep in deps {
                if let Some(cycle) = visit(dep, graph, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(topic, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for topic in graph.keys() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(*topic, &graph, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Drives snapshots through their lifecycle.
#[derive(Clone)]
pub struct RulesetPublisher {
    rulesets: Arc<dyn RulesetStore>,
    rules: Arc<dyn RuleStore>,
}

impl RulesetPublisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(rulesets: Arc<dyn RulesetStore>, rules: Arc<dyn RuleStore>) -> Self {
        Self { rulesets, rules }
    }

    /// Registers an artifact as a `Draft` snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRuleset` if the id was published before.
    pub fn publish(&self, artifact: RulesetArtifact) -> CalcResult<RulesetSnapshot> {
        artifact.id.validate()?;
        let mut snapshot = RulesetSnapshot::draft(artifact);
        let id = snapshot.id.clone();
        match self.rulesets.insert(snapshot.clone()) {
            Ok(revision) => {
                snapshot.revision = revision;
                info!(ruleset_id = %id, rules = snapshot.rules.len(), "ruleset published");
                Ok(snapshot)
            }
            Err(StorageError::DuplicateKey(_)) => Err(ConflictError::DuplicateRuleset { id: id.to_string() }.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Validates a `Draft` (or re-validates a `Validated`) snapshot.
    ///
    /// A passing report moves it to `Validated`; a failing one leaves it in
    /// `Draft`. The report is stored on the snapshot either way and can be
    /// read back through [`RulesetSnapshot::last_validation`].
    ///
    /// # Errors
    ///
    /// - `RulesetValidationFailed` listing the issues when the report fails.
    /// - `InvalidTransition` for active or superseded snapshots.
    /// - `VersionConflict` if the registry moved underneath.
    pub fn validate(&self, id: &RulesetId) -> CalcResult<ValidationReport> {
        let revision = self.rulesets.revision()?;
        let mut snapshot = self.get(id)?;
        if !matches!(snapshot.status, RulesetStatus::Draft | RulesetStatus::Validated) {
            return Err(transition(&snapshot, RulesetStatus::Validated));
        }
        let report = validate_snapshot(&snapshot, self.rules.as_ref())?;
        if report.passed {
            snapshot.status = RulesetStatus::Validated;
            snapshot.validated_at = Some(report.checked_at);
            info!(ruleset_id = %id, "ruleset validated");
        } else {
            snapshot.status = RulesetStatus::Draft;
            snapshot.validated_at = None;
            warn!(ruleset_id = %id, issues = report.issues.len(), "ruleset failed validation");
        }
        snapshot.last_validation = Some(report.clone());
        self.commit(revision, vec![snapshot])?;
        if report.passed {
            Ok(report)
        } else {
            Err(validation_failed(id, &report))
        }
    }

    /// Activates a `Validated` snapshot; the current active one is superseded.
    ///
    /// `expected_revision` pins the registry revision the caller read; `None`
    /// reads it now.
    ///
    /// # Errors
    ///
    /// - `RulesetValidationFailed` for a draft whose last validation failed.
    /// - `InvalidTransition` for any other state but `Validated`.
    /// - `VersionConflict` if the registry revision is stale.
    pub fn activate(&self, id: &RulesetId, expected_revision: Option<u64>) -> CalcResult<RulesetSnapshot> {
        let revision = match expected_revision {
            Some(r) => r,
            None => self.rulesets.revision()?,
        };
        let mut target = self.get(id)?;
        if target.status != RulesetStatus::Validated {
            if let Some(report) = target.last_validation.as_ref().filter(|r| !r.passed) {
                return Err(validation_failed(id, report));
            }
            return Err(transition(&target, RulesetStatus::Active));
        }
        self.swap_active(revision, &mut target, "ruleset activated")
    }

    /// Re-activates a previously active snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless `target` is `Superseded`, and
    /// `VersionConflict` if the registry revision is stale.
    pub fn rollback(&self, target_id: &RulesetId, expected_revision: Option<u64>) -> CalcResult<RulesetSnapshot> {
        let revision = match expected_revision {
            Some(r) => r,
            None => self.rulesets.revision()?,
        };
        let mut target = self.get(target_id)?;
        if target.status != RulesetStatus::Superseded {
            return Err(transition(&target, RulesetStatus::Active));
        }
        self.swap_active(revision, &mut target, "ruleset rolled back")
    }

    /// Removes a draft that will never be activated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the snapshot is a `Draft`.
    pub fn discard(&self, id: &RulesetId) -> CalcResult<()> {
        let revision = self.rulesets.revision()?;
        let snapshot = self.get(id)?;
        if snapshot.status != RulesetStatus::Draft {
            return Err(ValidationError::InvalidTransition {
                ruleset_id: id.to_string(),
                from: snapshot.status.to_string(),
                to: "discarded".to_string(),
            }
            .into());
        }
        self.rulesets.remove(revision, id).map_err(registry_error)?;
        info!(ruleset_id = %id, "draft ruleset discarded");
        Ok(())
    }

    /// Fetches a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, id: &RulesetId) -> CalcResult<RulesetSnapshot> {
        self.rulesets.get(id)?.ok_or_else(|| {
            ValidationError::NotFound {
                resource: "ruleset",
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Fetches a snapshot calculations may run against.
    ///
    /// # Errors
    ///
    /// Returns `RulesetNotActive` for drafts and validated snapshots.
    pub fn usable(&self, id: &RulesetId) -> CalcResult<RulesetSnapshot> {
        let snapshot = self.get(id)?;
        if !snapshot.is_usable() {
            return Err(ValidationError::RulesetNotActive {
                ruleset_id: id.to_string(),
                status: snapshot.status.to_string(),
            }
            .into());
        }
        Ok(snapshot)
    }

    /// The currently active snapshot, if any.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn active(&self) -> CalcResult<Option<RulesetSnapshot>> {
        Ok(self
            .rulesets
            .list()?
            .into_iter()
            .find(|s| s.status == RulesetStatus::Active))
    }

    /// All snapshots sorted by id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list(&self) -> CalcResult<Vec<RulesetSnapshot>> {
        Ok(self.rulesets.list()?)
    }

    /// Current registry revision.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn revision(&self) -> CalcResult<u64> {
        Ok(self.rulesets.revision()?)
    }

    fn swap_active(&self, revision: u64, target: &mut RulesetSnapshot, event: &str) -> CalcResult<RulesetSnapshot> {
        let now = Utc::now();
        let mut updates = Vec::with_capacity(2);
        let previous = self.active()?;
        if let Some(mut current) = previous.clone() {
            current.status = RulesetStatus::Superseded;
            current.close_activation(now);
            updates.push(current);
        }
        target.status = RulesetStatus::Active;
        target.activations.push(ActivationRecord {
            activated_at: now,
            deactivated_at: None,
        });
        updates.push(target.clone());
        let new_revision = self.commit(revision, updates)?;
        target.revision = new_revision;
        info!(
            ruleset_id = %target.id,
            superseded = ?previous.as_ref().map(|p| p.id.as_str()),
            revision = new_revision,
            "{event}"
        );
        Ok(target.clone())
    }

    fn commit(&self, revision: u64, updates: Vec<RulesetSnapshot>) -> CalcResult<u64> {
        self.rulesets.commit(revision, updates).map_err(registry_error)
    }
}

fn transition(snapshot: &RulesetSnapshot, to: RulesetStatus) -> CalcError {
    ValidationError::InvalidTransition {
        ruleset_id: snapshot.id.to_string(),
        from: snapshot.status.to_string(),
        to: to.to_string(),
    }
    .into()
}

fn validation_failed(id: &RulesetId, report: &ValidationReport) -> CalcError {
    ValidationError::RulesetValidationFailed {
        ruleset_id: id.to_string(),
        issues: report.issues.iter().map(ToString::to_string).collect(),
    }
    .into()
}

fn registry_error(err: StorageError) -> CalcError {
    match err {
        StorageError::VersionConflict { key, expected, actual } => {
            warn!(registry = %key, expected, actual, "ruleset registry revision conflict");
            ConflictError::VersionConflict {
                resource: "ruleset registry",
                id: key,
                expected,
                actual,
            }
            .into()
        }
        other => other.into(),
    }
}
