#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The compiled policy pack: [`EconomicProfile`] selection and the
//! restricted guard-expression interpreter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledger_core::{Payload, PayloadValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no policy matched event type {event_type}")]
    NoMatchingPolicy { event_type: String },
    #[error("{count} policies matched event type {event_type} with no decisive tie-break")]
    AmbiguousPolicy { event_type: String, count: usize },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A single `trigger.where` discriminator: the event matches only if
/// `payload[field] == expected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub field: String,
    pub expected: PayloadValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Debit,
    Credit,
}

/// Where a line mapping's amount comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LineSource {
    /// The posting's headline amount.
    Primary,
    /// `payload[field]`, must resolve to a positive decimal.
    FromContext { field: String },
    /// One line per element of `payload[collection]`.
    Foreach { collection: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineMapping {
    pub side: Side,
    /// Logical account role, e.g. `ACCOUNTS_PAYABLE`, resolved to a COA code
    /// by the meaning builder's `RoleResolver`.
    pub role: String,
    pub ledger: String,
    pub source: LineSource,
}

/// A restricted boolean-expression AST for reject guards: attribute access
/// on the payload, comparisons, and `and`/`or`/`not`. No calls, no loops, no
/// mutation — this is the same shape enforced by the guard parsers this
/// kernel's surrounding tooling already uses to keep configuration
/// declarative rather than executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuardExpr {
    Eq { field: String, value: PayloadValue },
    Ne { field: String, value: PayloadValue },
    Gt { field: String, value: PayloadValue },
    Lt { field: String, value: PayloadValue },
    In { field: String, values: Vec<PayloadValue> },
    And(Vec<GuardExpr>),
    Or(Vec<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Evaluates against a payload. `None` means the referenced field was
    /// absent or not comparable — treated as "guard does not fire" rather
    /// than an error, since a guard is a reject condition and the safer
    /// default on missing data is to let the entry through to the explicit
    /// balance/role checks.
    pub fn evaluate(&self, payload: &Payload) -> bool {
        match self {
            GuardExpr::Eq { field, value } => payload.get(field) == Some(value),
            GuardExpr::Ne { field, value } => {
                matches!(payload.get(field), Some(actual) if actual != value)
            }
            GuardExpr::Gt { field, value } => {
                match (payload.get(field).and_then(PayloadValue::as_decimal), value.as_decimal()) {
                    (Some(actual), Some(expected)) => actual > expected,
                    _ => false,
                }
            }
            GuardExpr::Lt { field, value } => {
                match (payload.get(field).and_then(PayloadValue::as_decimal), value.as_decimal()) {
                    (Some(actual), Some(expected)) => actual < expected,
                    _ => false,
                }
            }
            GuardExpr::In { field, values } => {
                matches!(payload.get(field), Some(actual) if values.contains(actual))
            }
            GuardExpr::And(clauses) => clauses.iter().all(|clause| clause.evaluate(payload)),
            GuardExpr::Or(clauses) => clauses.iter().any(|clause| clause.evaluate(payload)),
            GuardExpr::Not(inner) => !inner.evaluate(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    pub expr: GuardExpr,
    pub error_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub event_type: String,
    pub where_clauses: Vec<WhereClause>,
}

/// An immutable, compiled posting policy. Matches exactly one event type;
/// among profiles that match, ties break on (specificity, effective_from,
/// version) per [`PolicyPack::find_for_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicProfile {
    pub name: String,
    pub version: String,
    pub module: String,
    pub trigger: Trigger,
    pub line_mappings: Vec<LineMapping>,
    pub guards: Vec<Guard>,
    pub required_engines: Vec<String>,
    pub engine_parameters: HashMap<String, serde_json::Value>,
    pub effective_from: NaiveDate,
}

impl EconomicProfile {
    fn matches(&self, event_type: &str, effective_date: NaiveDate, payload: &Payload) -> bool {
        if self.trigger.event_type != event_type {
            return false;
        }
        if self.effective_from > effective_date {
            return false;
        }
        self.trigger
            .where_clauses
            .iter()
            .all(|clause| payload.get(&clause.field) == Some(&clause.expected))
    }

    fn specificity(&self) -> usize {
        self.trigger.where_clauses.len()
    }
}

/// The compiled, immutable policy pack. Built once via [`PolicyPack::compile`]
/// and shared behind an `Arc`; a "reload" is compiling a fresh pack and
/// swapping the `Arc` reference — there is no in-place mutation.
#[derive(Debug, Clone)]
pub struct PolicyPack {
    profiles_by_event_type: HashMap<String, Vec<EconomicProfile>>,
}

impl PolicyPack {
    /// Validates the pack once at load time: rejects duplicate
    /// `(name, version)` pairs. Role resolvability is checked separately by
    /// the meaning builder against a `RoleResolver`, since roles are a
    /// concern of that crate, not this one.
    pub fn compile(profiles: Vec<EconomicProfile>) -> PolicyResult<Arc<PolicyPack>> {
        let mut seen = std::collections::HashSet::new();
        for profile in &profiles {
            let key = (profile.name.clone(), profile.version.clone());
            if !seen.insert(key) {
                return Err(PolicyError::Validation(format!(
                    "duplicate profile {} version {}",
                    profile.name, profile.version
                )));
            }
        }

        let mut profiles_by_event_type: HashMap<String, Vec<EconomicProfile>> = HashMap::new();
        for profile in profiles {
            profiles_by_event_type
                .entry(profile.trigger.event_type.clone())
                .or_default()
                .push(profile);
        }

        Ok(Arc::new(PolicyPack {
            profiles_by_event_type,
        }))
    }

    /// O(1) dispatch on `event_type`, then a linear scan over that type's
    /// candidates applying where-clauses and tie-breaks. Never guesses: no
    /// match is `NoMatchingPolicy`, unresolved ties are `AmbiguousPolicy`.
    pub fn find_for_event(
        &self,
        event_type: &str,
        effective_date: NaiveDate,
        payload: &Payload,
    ) -> PolicyResult<&EconomicProfile> {
        let candidates: Vec<&EconomicProfile> = self
            .profiles_by_event_type
            .get(event_type)
            .into_iter()
            .flatten()
            .filter(|profile| profile.matches(event_type, effective_date, payload))
            .collect();

        if candidates.is_empty() {
            return Err(PolicyError::NoMatchingPolicy {
                event_type: event_type.to_string(),
            });
        }

        let max_specificity = candidates
            .iter()
            .map(|profile| profile.specificity())
            .max()
            .unwrap_or(0);
        let mut survivors: Vec<&EconomicProfile> = candidates
            .into_iter()
            .filter(|profile| profile.specificity() == max_specificity)
            .collect();

        if survivors.len() > 1 {
            let max_effective_from = survivors.iter().map(|profile| profile.effective_from).max();
            if let Some(max_effective_from) = max_effective_from {
                survivors.retain(|profile| profile.effective_from == max_effective_from);
            }
        }

        if survivors.len() > 1 {
            let max_version = survivors.iter().map(|profile| profile.version.clone()).max();
            if let Some(max_version) = max_version {
                survivors.retain(|profile| profile.version == max_version);
            }
        }

        match survivors.as_slice() {
            [single] => Ok(single),
            _ => Err(PolicyError::AmbiguousPolicy {
                event_type: event_type.to_string(),
                count: survivors.len(),
            }),
        }
    }
}

/// Records a trace of policy decisions for observability, mirroring the
/// decision-tracing sinks this kernel's other components emit to.
#[async_trait]
pub trait PolicyEventSink: Send + Sync {
    async fn record_selection(&self, event_type: &str, profile_name: &str, profile_version: &str);
    async fn record_no_match(&self, event_type: &str);
    async fn record_ambiguous(&self, event_type: &str, count: usize);
}

pub struct NoopPolicyEventSink;

#[async_trait]
impl PolicyEventSink for NoopPolicyEventSink {
    async fn record_selection(&self, _event_type: &str, _profile_name: &str, _profile_version: &str) {}
    async fn record_no_match(&self, _event_type: &str) {}
    async fn record_ambiguous(&self, _event_type: &str, _count: usize) {}
}
