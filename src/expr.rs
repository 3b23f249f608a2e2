//! Rule expression language.
//!
//! Expressions are plain data (serde-tagged JSON) so that ruleset artifacts
//! are portable and hashable. Evaluation lives in [`crate::executor`].
//!
//! ```json
//! {"op": "mul",
//!  "left": {"op": "topic", "topic": "super.total_concessional"},
//!  "right": {"op": "assumption", "key": "super.contributions_tax_rate"}}
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::decimal::{range_issue, Quantity, RoundingPolicy};
use crate::rule::Topic;

/// Maximum nesting depth accepted for an expression tree.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Comparison operator for conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

/// A comparison between two sub-expressions of the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Left operand.
    pub left: Box<Expr>,
    /// Operator.
    pub cmp: Comparison,
    /// Right operand.
    pub right: Box<Expr>,
}

/// A calculation expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    /// A literal quantity.
    Const { value: Quantity },
    /// A client data field.
    Input { field: String },
    /// A scalar assumption in force at `as_of`.
    Assumption { key: String },
    /// The output of another topic in the same plan.
    Topic { topic: Topic },
    /// Sum of one or more operands.
    Add { args: Vec<Expr> },
    /// `left - right`.
    Sub { left: Box<Expr>, right: Box<Expr> },
    /// `left * right`.
    Mul { left: Box<Expr>, right: Box<Expr> },
    /// `left / right`.
    Div { left: Box<Expr>, right: Box<Expr> },
    /// Negation.
    Neg { arg: Box<Expr> },
    /// Smallest of one or more operands.
    Min { args: Vec<Expr> },
    /// Largest of one or more operands.
    Max { args: Vec<Expr> },
    /// Clamp negatives to zero.
    FloorZero { arg: Box<Expr> },
    /// Explicit rounding.
    Round { arg: Box<Expr>, policy: RoundingPolicy },
    /// Conditional.
    If {
        cond: Condition,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Marginal application of a bracket schedule assumption.
    Progressive { base: Box<Expr>, schedule: String },
    /// `principal * (1 + rate) ^ periods`.
    Compound {
        principal: Box<Expr>,
        rate: Box<Expr>,
        periods: u32,
    },
}

impl Expr {
    /// Literal.
    #[must_use]
    pub const fn constant(value: Quantity) -> Self {
        Self::Const { value }
    }

    /// Client data field.
    #[must_use]
    pub fn input(field: impl Into<String>) -> Self {
        Self::Input { field: field.into() }
    }

    /// Scalar assumption.
    #[must_use]
    pub fn assumption(key: impl Into<String>) -> Self {
        Self::Assumption { key: key.into() }
    }

    /// Upstream topic.
    #[must_use]
    pub fn topic(topic: impl Into<Topic>) -> Self {
        Self::Topic { topic: topic.into() }
    }

    #[must_use]
    pub fn add(args: Vec<Self>) -> Self {
        Self::Add { args }
    }

    #[must_use]
    pub fn sub(left: Self, right: Self) -> Self {
        Self::Sub {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn mul(left: Self, right: Self) -> Self {
        Self::Mul {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn div(left: Self, right: Self) -> Self {
        Self::Div {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn neg(arg: Self) -> Self {
        Self::Neg { arg: Box::new(arg) }
    }

    #[must_use]
    pub fn min(args: Vec<Self>) -> Self {
        Self::Min { args }
    }

    #[must_use]
    pub fn max(args: Vec<Self>) -> Self {
        Self::Max { args }
    }

    #[must_use]
    pub fn floor_zero(arg: Self) -> Self {
        Self::FloorZero { arg: Box::new(arg) }
    }

    #[must_use]
    pub fn round(arg: Self, policy: RoundingPolicy) -> Self {
        Self::Round {
            arg: Box::new(arg),
            policy,
        }
    }

    /// `if left cmp right { then } else { otherwise }`.
    #[must_use]
    pub fn if_cmp(left: Self, cmp: Comparison, right: Self, then: Self, otherwise: Self) -> Self {
        Self::If {
            cond: Condition {
                left: Box::new(left),
                cmp,
                right: Box::new(right),
            },
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    #[must_use]
    pub fn progressive(base: Self, schedule: impl Into<String>) -> Self {
        Self::Progressive {
            base: Box::new(base),
            schedule: schedule.into(),
        }
    }

    #[must_use]
    pub fn compound(principal: Self, rate: Self, periods: u32) -> Self {
        Self::Compound {
            principal: Box::new(principal),
            rate: Box::new(rate),
            periods,
        }
    }

    /// Direct children, in evaluation order.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        match self {
            Self::Const { .. } | Self::Input { .. } | Self::Assumption { .. } | Self::Topic { .. } => {
                Vec::new()
            }
            Self::Add { args } | Self::Min { args } | Self::Max { args } => args.iter().collect(),
            Self::Sub { left, right } | Self::Mul { left, right } | Self::Div { left, right } => {
                vec![left.as_ref(), right.as_ref()]
            }
            Self::Neg { arg } | Self::FloorZero { arg } | Self::Round { arg, .. } => vec![arg.as_ref()],
            Self::If { cond, then, otherwise } => vec![
                cond.left.as_ref(),
                cond.right.as_ref(),
                then.as_ref(),
                otherwise.as_ref(),
            ],
            Self::Progressive { base, .. } => vec![base.as_ref()],
            Self::Compound { principal, rate, .. } => vec![principal.as_ref(), rate.as_ref()],
        }
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Self)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Upstream topics this expression reads.
    #[must_use]
    pub fn topics(&self) -> BTreeSet<Topic> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Self::Topic { topic } = e {
                out.insert(topic.clone());
            }
        });
        out
    }

    /// Client data fields this expression reads.
    #[must_use]
    pub fn inputs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Self::Input { field } = e {
                out.insert(field.clone());
            }
        });
        out
    }

    /// Assumption keys this expression reads, scalar and schedule alike.
    #[must_use]
    pub fn assumption_keys(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| match e {
            Self::Assumption { key } => {
                out.insert(key.clone());
            }
            Self::Progressive { schedule, .. } => {
                out.insert(schedule.clone());
            }
            _ => {}
        });
        out
    }

    /// Nesting depth (a leaf has depth 1).
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.children().into_iter().map(Self::depth).max().unwrap_or(0)
    }

    /// Returns a structural problem, if any: empty operand lists or
    /// excessive nesting.
    #[must_use]
    pub fn structural_issue(&self) -> Option<String> {
        if self.depth() > MAX_EXPR_DEPTH {
            return Some(format!("expression nesting exceeds {MAX_EXPR_DEPTH}"));
        }
        let mut issue = None;
        self.walk(&mut |e| {
            if issue.is_some() {
                return;
            }
            match e {
                Self::Add { args } | Self::Min { args } | Self::Max { args } if args.is_empty() => {
                    issue = Some("operator with no operands".to_string());
                }
                Self::Round { policy, .. } => {
                    if let Err(err) = policy.validate() {
                        issue = Some(err.to_string());
                    }
                }
                Self::Const { value } => issue = range_issue(&value.amount),
                _ => {}
            }
        });
        issue
    }
}
