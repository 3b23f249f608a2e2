//! Provenance edges and chain reconstruction.
//!
//! Edges are relational rows `(src, dst, relation)`:
//!
//! - Fact → Rule (`computed_by`)
//! - Fact → Fact (`derived_from`, upstream topics)
//! - Fact → Assumption (`uses`, the exact version read)
//! - Rule → Reference (`cites`, with pinpoint)
//!
//! [`ProvenanceBuilder`] walks these edges breadth-first from a fact, resolves
//! every node against its store, and returns a declarative
//! [`ProvenanceChain`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Quantity;
use crate::error::{CalcError, CalcResult, ExecutionError, ValidationError};
use crate::fact::{Fact, FactId};
use crate::reference::AssumptionValue;
use crate::rule::{PrecedenceTier, Topic};
use crate::ruleset::RulesetId;
use crate::storage::{FactStore, ProvenanceStore, RuleStore, RulesetStore};
use crate::time::EffectiveWindow;

/// Hard ceiling on provenance traversal depth.
pub const MAX_PROVENANCE_DEPTH: usize = 15;

const EDGE_NAMESPACE: Uuid = Uuid::from_u128(0x9e27_44d1_0b6a_4f3e_8c55_e0a1_7b92_d364);

/// A node of the provenance graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRef {
    /// A computed fact.
    Fact { id: FactId },
    /// A rule version inside a ruleset snapshot.
    Rule {
        ruleset_id: RulesetId,
        rule_id: String,
        version: u32,
    },
    /// A reference version.
    Reference { id: String, version: u32 },
    /// An assumption version.
    Assumption { key: String, version: u32 },
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fact { id } => write!(f, "fact:{id}"),
            Self::Rule {
                ruleset_id,
                rule_id,
                version,
            } => write!(f, "rule:{ruleset_id}/{rule_id}@v{version}"),
            Self::Reference { id, version } => write!(f, "reference:{id}@v{version}"),
            Self::Assumption { key, version } => write!(f, "assumption:{key}@v{version}"),
        }
    }
}

/// Edge relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Fact computed by rule.
    ComputedBy,
    /// Fact derived from an upstream fact.
    DerivedFrom,
    /// Rule cites a reference.
    Cites,
    /// Fact used an assumption version.
    Uses,
}

impl Relation {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ComputedBy => "computed_by",
            Self::DerivedFrom => "derived_from",
            Self::Cites => "cites",
            Self::Uses => "uses",
        }
    }
}

/// Deterministic edge identifier; identical edges share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub Uuid);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A provenance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    /// Identifier derived from `(src, dst, relation, pinpoint)`.
    pub id: EdgeId,
    /// Source node.
    pub src: NodeRef,
    /// Destination node.
    pub dst: NodeRef,
    /// Relation.
    pub relation: Relation,
    /// Pinpoint locator for `cites` edges.
    #[serde(default)]
    pub pinpoint: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl ProvenanceEdge {
    /// Creates an edge.
    #[must_use]
    pub fn new(src: NodeRef, dst: NodeRef, relation: Relation, pinpoint: Option<String>) -> Self {
        let name = format!(
            "{src}\u{1f}{dst}\u{1f}{}\u{1f}{}",
            relation.as_str(),
            pinpoint.as_deref().unwrap_or("")
        );
        Self {
            id: EdgeId(Uuid::new_v5(&EDGE_NAMESPACE, name.as_bytes())),
            src,
            dst,
            relation,
            pinpoint,
            created_at: Utc::now(),
        }
    }
}

/// Resolved content of a chain node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDetail {
    Fact {
        topic: Topic,
        value: Quantity,
        as_of: NaiveDate,
        scenario_id: String,
        ruleset_id: RulesetId,
    },
    Rule {
        topic: Topic,
        tier: PrecedenceTier,
        window: EffectiveWindow,
        description: Option<String>,
    },
    Reference {
        title: String,
        publisher: Option<String>,
        window: EffectiveWindow,
    },
    Assumption {
        value: AssumptionValue,
        window: EffectiveWindow,
    },
}

/// A node in a reconstructed chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    /// Node identity.
    pub node: NodeRef,
    /// Hops from the root fact.
    pub depth: usize,
    /// Resolved content.
    pub detail: NodeDetail,
}

/// An edge in a reconstructed chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEdge {
    pub src: NodeRef,
    pub dst: NodeRef,
    pub relation: Relation,
    pub pinpoint: Option<String>,
}

/// Declarative derivation of one fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceChain {
    /// Fact being explained.
    pub root: FactId,
    /// Nodes in breadth-first order; the root is first.
    pub nodes: Vec<ChainNode>,
    /// Edges traversed.
    pub edges: Vec<ChainEdge>,
    /// Deepest hop reached.
    pub depth: usize,
}

impl ProvenanceChain {
    /// Nodes of one kind, for assertions and rendering.
    pub fn nodes_where(&self, pred: impl Fn(&NodeRef) -> bool) -> impl Iterator<Item = &ChainNode> {
        self.nodes.iter().filter(move |n| pred(&n.node))
    }
}

/// Reconstructs provenance chains from the edge store.
#[derive(Clone)]
pub struct ProvenanceBuilder {
    facts: Arc<dyn FactStore>,
    edges: Arc<dyn ProvenanceStore>,
    rulesets: Arc<dyn RulesetStore>,
    rules: Arc<dyn RuleStore>,
    max_depth: usize,
}

impl ProvenanceBuilder {
    /// Creates a builder. `max_depth` is clamped to [`MAX_PROVENANCE_DEPTH`].
    #[must_use]
    pub fn new(
        facts: Arc<dyn FactStore>,
        edges: Arc<dyn ProvenanceStore>,
        rulesets: Arc<dyn RulesetStore>,
        rules: Arc<dyn RuleStore>,
        max_depth: usize,
    ) -> Self {
        Self {
            facts,
            edges,
            rulesets,
            rules,
            max_depth: max_depth.min(MAX_PROVENANCE_DEPTH),
        }
    }

    /// Explains one fact.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the fact does not exist.
    /// - `ProvenanceDepthExceeded` if the chain is deeper than the cap.
    /// - `DanglingProvenance` if any node does not resolve.
    pub fn explain(&self, fact_id: FactId) -> CalcResult<ProvenanceChain> {
        let Some(root_fact) = self.facts.get(fact_id)? else {
            return Err(ValidationError::NotFound {
                resource: "fact",
                id: fact_id.to_string(),
            }
            .into());
        };
        let as_of = root_fact.as_of;
        let root = NodeRef::Fact { id: fact_id };

        let mut nodes = vec![ChainNode {
            node: root.clone(),
            depth: 0,
            detail: fact_detail(&root_fact),
        }];
        let mut edges = Vec::new();
        let mut seen: HashSet<NodeRef> = HashSet::from([root.clone()]);
        let mut queue: VecDeque<(NodeRef, usize)> = VecDeque::from([(root, 0)]);
        let mut deepest = 0;

        while let Some((node, depth)) = queue.pop_front() {
            for edge in self.edges.edges_from(&node)? {
                // A rule can cite several versions of one reference across
                // years; only the version in force for this fact belongs here.
                let detail = match self.resolve(&edge.dst)? {
                    Some(detail) => detail,
                    None => {
                        return Err(ExecutionError::DanglingProvenance {
                            node: edge.dst.to_string(),
                        }
                        .into())
                    }
                };
                if edge.relation == Relation::Cites && !detail_in_force(&detail, as_of) {
                    continue;
                }
                let next = depth + 1;
                if next > self.max_depth {
                    return Err(ExecutionError::ProvenanceDepthExceeded {
                        fact_id: fact_id.to_string(),
                        max_depth: self.max_depth,
                    }
                    .into());
                }
                edges.push(ChainEdge {
                    src: edge.src.clone(),
                    dst: edge.dst.clone(),
                    relation: edge.relation,
                    pinpoint: edge.pinpoint.clone(),
                });
                if seen.insert(edge.dst.clone()) {
                    deepest = deepest.max(next);
                    nodes.push(ChainNode {
                        node: edge.dst.clone(),
                        depth: next,
                        detail,
                    });
                    queue.push_back((edge.dst, next));
                }
            }
        }

        Ok(ProvenanceChain {
            root: fact_id,
            nodes,
            edges,
            depth: deepest,
        })
    }

    /// Explains several facts; each result stands alone.
    #[must_use]
    pub fn explain_batch(&self, fact_ids: &[FactId]) -> BTreeMap<FactId, CalcResult<ProvenanceChain>> {
        fact_ids.iter().map(|id| (*id, self.explain(*id))).collect()
    }

    fn resolve(&self, node: &NodeRef) -> Result<Option<NodeDetail>, CalcError> {
        Ok(match node {
            NodeRef::Fact { id } => self.facts.get(*id)?.map(|f| fact_detail(&f)),
            NodeRef::Rule {
                ruleset_id,
                rule_id,
                version,
            } => self.rulesets.get(ruleset_id)?.and_then(|snapshot| {
                snapshot
                    .rules
                    .iter()
                    .find(|r| r.id == *rule_id && r.version == *version)
                    .map(|r| NodeDetail::Rule {
                        topic: r.topic.clone(),
                        tier: r.tier,
                        window: r.window,
                        description: r.description.clone(),
                    })
            }),
            NodeRef::Reference { id, version } => {
                self.rules
                    .reference_version(id, *version)?
                    .map(|r| NodeDetail::Reference {
                        title: r.title,
                        publisher: r.publisher,
                        window: r.window,
                    })
            }
            NodeRef::Assumption { key, version } => {
                self.rules
                    .assumption_version(key, *version)?
                    .map(|a| NodeDetail::Assumption {
                        value: a.value,
                        window: a.window,
                    })
            }
        })
    }
}

fn fact_detail(fact: &Fact) -> NodeDetail {
    NodeDetail::Fact {
        topic: fact.topic.clone(),
        value: fact.value.clone(),
        as_of: fact.as_of,
        scenario_id: fact.scenario_id.to_string(),
        ruleset_id: fact.ruleset_id.clone(),
    }
}

fn detail_in_force(detail: &NodeDetail, as_of: NaiveDate) -> bool {
    match detail {
        NodeDetail::Reference { window, .. } => window.contains(as_of),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_edges_share_an_id() {
        let fact = NodeRef::Fact {
            id: FactId(Uuid::nil()),
        };
        let rule = NodeRef::Rule {
            ruleset_id: RulesetId::parse("ruleset-20240701").unwrap(),
            rule_id: "pit.income_tax".to_string(),
            version: 1,
        };
        let a = ProvenanceEdge::new(fact.clone(), rule.clone(), Relation::ComputedBy, None);
        let b = ProvenanceEdge::new(fact.clone(), rule.clone(), Relation::ComputedBy, None);
        let c = ProvenanceEdge::new(rule, fact, Relation::ComputedBy, None);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn pinpoint_is_part_of_edge_identity() {
        let rule = NodeRef::Rule {
            ruleset_id: RulesetId::parse("ruleset-20240701").unwrap(),
            rule_id: "pit.income_tax".to_string(),
            version: 1,
        };
        let reference = NodeRef::Reference {
            id: "ITAA1997".to_string(),
            version: 1,
        };
        let a = ProvenanceEdge::new(rule.clone(), reference.clone(), Relation::Cites, Some("s 4-10".into()));
        let b = ProvenanceEdge::new(rule, reference, Relation::Cites, Some("Sch 7".into()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn node_ref_display_and_json() {
        let node = NodeRef::Assumption {
            key: "medicare.rate".to_string(),
            version: 2,
        };
        assert_eq!(node.to_string(), "assumption:medicare.rate@v2");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "assumption");
        assert_eq!(json["version"], 2);
    }
}
