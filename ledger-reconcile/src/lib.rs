#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Link graph and reconciliation (C9): an immutable, append-only DAG of
//! [`EconomicLink`] records and the read-time aggregation that turns it into
//! a [`ReconciliationState`]. Nothing here is stored pre-computed; every
//! state is derived from the links that currently exist.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("link not found: {0}")]
    LinkNotFound(String),
    #[error("document {0} is already matched")]
    DocumentAlreadyMatched(String),
    #[error("overapplication against {reference}: {amount} exceeds remaining {remaining}")]
    Overapplication {
        reference: String,
        amount: Decimal,
        remaining: Decimal,
    },
    #[error("three-way match variance exceeded tolerance: {0}")]
    MatchVarianceExceeded(String),
    #[error("statement line {0} is already matched")]
    StatementLineAlreadyMatched(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// The five relationships links can express between economic artifacts.
/// The graph is a DAG: a link always points from an earlier artifact
/// (`parent_ref`) to a later one (`child_ref`) created in its fulfillment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    PaidBy,
    FulfilledBy,
    AllocatedTo,
    AppliedTo,
    MatchedWith,
}

/// One edge in the link graph. Links are never mutated or removed once
/// created; `establish_link` either inserts a new row or, per the caller's
/// `allow_duplicate` flag, folds a repeat into a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicLink {
    pub id: String,
    pub link_type: LinkType,
    pub parent_ref: String,
    pub child_ref: String,
    pub creating_event_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, Decimal>,
}

/// A graph query and insertion surface over the immutable link set. Kept
/// synchronous: every operation here is in-memory aggregation, never a
/// store round-trip in its own right (inserts go through the same
/// transaction the caller already holds on the posting path).
pub trait LinkGraph: Send + Sync {
    fn establish_link(
        &self,
        parent_ref: &str,
        child_ref: &str,
        link_type: LinkType,
        creating_event_id: &str,
        metadata: HashMap<String, Decimal>,
        allow_duplicate: bool,
    ) -> ReconcileResult<EconomicLink>;

    fn children(&self, reference: &str, allowed_types: &[LinkType]) -> Vec<EconomicLink>;

    fn parents(&self, reference: &str, allowed_types: &[LinkType]) -> Vec<EconomicLink>;
}

#[derive(Default)]
pub struct InMemoryLinkGraph {
    links: RwLock<Vec<EconomicLink>>,
}

impl InMemoryLinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_duplicate(existing: &EconomicLink, parent_ref: &str, child_ref: &str, link_type: LinkType) -> bool {
        existing.parent_ref == parent_ref && existing.child_ref == child_ref && existing.link_type == link_type
    }
}

impl LinkGraph for InMemoryLinkGraph {
    fn establish_link(
        &self,
        parent_ref: &str,
        child_ref: &str,
        link_type: LinkType,
        creating_event_id: &str,
        metadata: HashMap<String, Decimal>,
        allow_duplicate: bool,
    ) -> ReconcileResult<EconomicLink> {
        let mut guard = self
            .links
            .write()
            .map_err(|_| ReconcileError::Storage("link graph poisoned".into()))?;

        if let Some(existing) = guard
            .iter()
            .find(|link| Self::is_duplicate(link, parent_ref, child_ref, link_type))
        {
            if allow_duplicate {
                return Ok(existing.clone());
            }
            return Err(ReconcileError::Validation(format!(
                "link {parent_ref} -> {child_ref} ({link_type:?}) already exists"
            )));
        }

        let link = EconomicLink {
            id: Uuid::new_v4().to_string(),
            link_type,
            parent_ref: parent_ref.to_string(),
            child_ref: child_ref.to_string(),
            creating_event_id: creating_event_id.to_string(),
            created_at: Utc::now(),
            metadata,
        };
        guard.push(link.clone());
        Ok(link)
    }

    fn children(&self, reference: &str, allowed_types: &[LinkType]) -> Vec<EconomicLink> {
        let guard = match self.links.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        guard
            .iter()
            .filter(|link| link.parent_ref == reference && allowed_types.contains(&link.link_type))
            .cloned()
            .collect()
    }

    fn parents(&self, reference: &str, allowed_types: &[LinkType]) -> Vec<EconomicLink> {
        let guard = match self.links.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        guard
            .iter()
            .filter(|link| link.child_ref == reference && allowed_types.contains(&link.link_type))
            .cloned()
            .collect()
    }
}

#[cfg(feature = "postgres-store")]
#[derive(Clone)]
pub struct PostgresLinkGraph {
    connection_string: String,
}

#[cfg(feature = "postgres-store")]
impl PostgresLinkGraph {
    //! Schema:
    //!
    //! ```sql
    //! CREATE TABLE economic_links (
    //!     id UUID PRIMARY KEY,
    //!     link_type TEXT NOT NULL,
    //!     parent_ref TEXT NOT NULL,
    //!     child_ref TEXT NOT NULL,
    //!     creating_event_id TEXT NOT NULL,
    //!     created_at TIMESTAMPTZ NOT NULL,
    //!     metadata_json JSONB NOT NULL
    //! );
    //! CREATE RULE economic_links_no_update AS ON UPDATE TO economic_links DO INSTEAD NOTHING;
    //! CREATE RULE economic_links_no_delete AS ON DELETE TO economic_links DO INSTEAD NOTHING;
    //! ```
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[cfg(feature = "postgres-store")]
impl LinkGraph for PostgresLinkGraph {
    fn establish_link(
        &self,
        parent_ref: &str,
        child_ref: &str,
        link_type: LinkType,
        creating_event_id: &str,
        metadata: HashMap<String, Decimal>,
        allow_duplicate: bool,
    ) -> ReconcileResult<EconomicLink> {
        let _ = (&self.connection_string, parent_ref, child_ref, link_type, creating_event_id, metadata, allow_duplicate);
        Err(ReconcileError::Storage("postgres link graph not yet implemented".into()))
    }

    fn children(&self, _reference: &str, _allowed_types: &[LinkType]) -> Vec<EconomicLink> {
        Vec::new()
    }

    fn parents(&self, _reference: &str, _allowed_types: &[LinkType]) -> Vec<EconomicLink> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Open,
    Partial,
    Matched,
    Overapplied,
}

/// Never stored: recomputed from the link graph every time it is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub original_amount: Decimal,
    pub consumed_amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: ReconciliationStatus,
}

fn reconciliation_status(original_amount: Decimal, consumed_amount: Decimal) -> ReconciliationStatus {
    if consumed_amount > original_amount {
        ReconciliationStatus::Overapplied
    } else if consumed_amount == original_amount {
        ReconciliationStatus::Matched
    } else if consumed_amount == Decimal::ZERO {
        ReconciliationStatus::Open
    } else {
        ReconciliationStatus::Partial
    }
}

/// Sums `metadata[amount_metadata_key]` over every outbound link of
/// `reference` matching one of `link_types`, returning `(consumed,
/// remaining)` against `original_amount`.
pub fn unconsumed(
    graph: &dyn LinkGraph,
    reference: &str,
    original_amount: Decimal,
    link_types: &[LinkType],
    amount_metadata_key: &str,
) -> (Decimal, Decimal) {
    let consumed: Decimal = graph
        .children(reference, link_types)
        .iter()
        .filter_map(|link| link.metadata.get(amount_metadata_key).copied())
        .sum();
    (consumed, original_amount - consumed)
}

/// Convenience wrapper over [`unconsumed`] using the `PAID_BY` /
/// `amount_applied` convention payment application uses.
pub fn get_reconciliation_state(graph: &dyn LinkGraph, reference: &str, original_amount: Decimal) -> ReconciliationState {
    let (consumed, remaining) = unconsumed(graph, reference, original_amount, &[LinkType::PaidBy], "amount_applied");
    ReconciliationState {
        original_amount,
        consumed_amount: consumed,
        remaining_amount: remaining,
        status: reconciliation_status(original_amount, consumed),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentApplication {
    pub link: EconomicLink,
    pub state: ReconciliationState,
}

/// Inserts a `PAID_BY` link after checking the invoice isn't already fully
/// matched and that this application wouldn't overapply it. Fails closed:
/// the link is never inserted on either error path.
pub fn apply_payment(
    graph: &dyn LinkGraph,
    invoice_ref: &str,
    payment_ref: &str,
    amount: Decimal,
    original_amount: Decimal,
    creating_event_id: &str,
) -> ReconcileResult<PaymentApplication> {
    let state = get_reconciliation_state(graph, invoice_ref, original_amount);
    if state.status == ReconciliationStatus::Matched {
        return Err(ReconcileError::DocumentAlreadyMatched(invoice_ref.to_string()));
    }
    if amount > state.remaining_amount {
        return Err(ReconcileError::Overapplication {
            reference: invoice_ref.to_string(),
            amount,
            remaining: state.remaining_amount,
        });
    }

    let mut metadata = HashMap::new();
    metadata.insert("amount_applied".to_string(), amount);
    let link = graph.establish_link(
        invoice_ref,
        payment_ref,
        LinkType::PaidBy,
        creating_event_id,
        metadata,
        false,
    )?;

    let state = get_reconciliation_state(graph, invoice_ref, original_amount);
    Ok(PaymentApplication { link, state })
}

/// Whether a `MatchTolerance` field is a fixed amount or a percentage of the
/// PO-side value it is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToleranceKind {
    Absolute,
    Percent,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchTolerance {
    pub quantity_tolerance: Decimal,
    pub quantity_tolerance_kind: ToleranceKind,
    pub price_tolerance: Decimal,
    pub price_tolerance_kind: ToleranceKind,
}

impl Default for MatchTolerance {
    fn default() -> Self {
        Self {
            quantity_tolerance: Decimal::ZERO,
            quantity_tolerance_kind: ToleranceKind::Absolute,
            price_tolerance: Decimal::ZERO,
            price_tolerance_kind: ToleranceKind::Absolute,
        }
    }
}

/// `true` when `diff` (already absolute) breaches `tolerance`, computing a
/// percent-of-`base` difference for `ToleranceKind::Percent` the way
/// `_evaluate_match` does: `abs_diff / base * 100`, skipped (never a breach)
/// when `base` is zero.
fn exceeds_tolerance(diff: Decimal, base: Decimal, tolerance: Decimal, kind: ToleranceKind) -> bool {
    match kind {
        ToleranceKind::Absolute => diff > tolerance,
        ToleranceKind::Percent => {
            if base.is_zero() {
                false
            } else {
                (diff / base * Decimal::from(100)) > tolerance
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreeWayMatchInput {
    pub po_qty: Decimal,
    pub po_unit_price: Decimal,
    pub receipt_qty: Decimal,
    pub invoice_qty: Decimal,
    pub invoice_unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeWayMatchResult {
    pub quantity_variance: Decimal,
    pub price_variance: Decimal,
    pub po_to_receipt: EconomicLink,
    pub receipt_to_invoice: EconomicLink,
}

/// `quantity_variance = receipt_qty - po_qty`;
/// `price_variance = (invoice_price - po_price) * invoice_qty`. Either
/// exceeding its tolerance fails the whole match; no links are inserted on
/// failure.
pub fn create_three_way_match(
    graph: &dyn LinkGraph,
    po_ref: &str,
    receipt_ref: &str,
    invoice_ref: &str,
    input: ThreeWayMatchInput,
    creating_event_id: &str,
    tolerance: MatchTolerance,
) -> ReconcileResult<ThreeWayMatchResult> {
    let quantity_variance = input.receipt_qty - input.po_qty;
    let price_variance = (input.invoice_unit_price - input.po_unit_price) * input.invoice_qty;
    let po_extended = input.po_unit_price * input.invoice_qty;

    if exceeds_tolerance(
        quantity_variance.abs(),
        input.po_qty,
        tolerance.quantity_tolerance,
        tolerance.quantity_tolerance_kind,
    ) {
        return Err(ReconcileError::MatchVarianceExceeded(format!(
            "quantity variance {quantity_variance} exceeds tolerance {}",
            tolerance.quantity_tolerance
        )));
    }
    if exceeds_tolerance(
        price_variance.abs(),
        po_extended,
        tolerance.price_tolerance,
        tolerance.price_tolerance_kind,
    ) {
        return Err(ReconcileError::MatchVarianceExceeded(format!(
            "price variance {price_variance} exceeds tolerance {}",
            tolerance.price_tolerance
        )));
    }

    let po_to_receipt = graph.establish_link(
        po_ref,
        receipt_ref,
        LinkType::FulfilledBy,
        creating_event_id,
        HashMap::new(),
        false,
    )?;
    let receipt_to_invoice = graph.establish_link(
        receipt_ref,
        invoice_ref,
        LinkType::FulfilledBy,
        creating_event_id,
        HashMap::new(),
        false,
    )?;

    Ok(ThreeWayMatchResult {
        quantity_variance,
        price_variance,
        po_to_receipt,
        receipt_to_invoice,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementLineStatus {
    Unmatched,
    Matched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub id: String,
    pub amount: Decimal,
    pub posted_at: DateTime<Utc>,
    pub description: String,
    pub status: StatementLineStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct GlCandidate<'a> {
    pub gl_entry_id: &'a str,
    pub amount: Decimal,
    pub posted_at: DateTime<Utc>,
    pub description: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub statement_line_id: String,
    pub gl_entry_id: String,
    pub score: f32,
}

/// Scores a statement-line/GL-entry pair. A weighted composite of amount
/// closeness, date proximity, and description similarity — the same shape
/// a fuzzy statement-matcher scores candidates with elsewhere in this
/// codebase's sibling crates.
pub trait BankMatchScoring: Send + Sync {
    fn score(&self, statement_line: &StatementLine, candidate: &GlCandidate<'_>) -> f32;
}

#[derive(Debug, Clone)]
pub struct WeightedBankMatchScoring {
    amount_weight: f32,
    date_weight: f32,
    description_weight: f32,
    amount_tolerance: Decimal,
    date_tolerance_days: i64,
}

impl WeightedBankMatchScoring {
    pub fn new(
        amount_weight: f32,
        date_weight: f32,
        description_weight: f32,
        amount_tolerance: Decimal,
        date_tolerance_days: i64,
    ) -> Self {
        Self {
            amount_weight,
            date_weight,
            description_weight,
            amount_tolerance: amount_tolerance.max(Decimal::new(1, 2)),
            date_tolerance_days: date_tolerance_days.max(1),
        }
    }

    fn normalize_amount(&self, delta: Decimal) -> f32 {
        let ratio = (delta.abs() / self.amount_tolerance).to_f32().unwrap_or(1.0);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    fn normalize_date(&self, delta_days: i64) -> f32 {
        let ratio = (delta_days.abs() as f32) / (self.date_tolerance_days as f32);
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

impl Default for WeightedBankMatchScoring {
    fn default() -> Self {
        Self::new(0.5, 0.3, 0.2, Decimal::new(500, 2), 5)
    }
}

impl BankMatchScoring for WeightedBankMatchScoring {
    fn score(&self, statement_line: &StatementLine, candidate: &GlCandidate<'_>) -> f32 {
        let total_weight = self.amount_weight + self.date_weight + self.description_weight;
        if total_weight <= f32::EPSILON {
            return 0.0;
        }
        let amount_component = self.normalize_amount(statement_line.amount - candidate.amount);
        let date_delta = (statement_line.posted_at - candidate.posted_at).num_days();
        let date_component = self.normalize_date(date_delta);
        let description_component = description_similarity(&statement_line.description, candidate.description);
        let weighted = amount_component * self.amount_weight
            + date_component * self.date_weight
            + description_component * self.description_weight;
        (weighted / total_weight).clamp(0.0, 1.0)
    }
}

fn description_similarity(left: &str, right: &str) -> f32 {
    use std::collections::BTreeSet;
    let tokenize = |input: &str| -> BTreeSet<String> {
        input.split_whitespace().map(str::to_ascii_lowercase).collect()
    };
    let left_tokens = tokenize(left);
    let right_tokens = tokenize(right);
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }
    let intersection = left_tokens.intersection(&right_tokens).count() as f32;
    let union = left_tokens.union(&right_tokens).count() as f32;
    if union <= f32::EPSILON {
        0.0
    } else {
        (intersection / union).clamp(0.0, 1.0)
    }
}

/// Ranks every candidate against the statement line, highest score first.
/// Does not mutate anything; confirming a suggestion is a separate step.
pub fn suggest_matches(
    scoring: &dyn BankMatchScoring,
    statement_line: &StatementLine,
    candidates: &[GlCandidate<'_>],
) -> Vec<MatchSuggestion> {
    let mut suggestions: Vec<MatchSuggestion> = candidates
        .iter()
        .map(|candidate| MatchSuggestion {
            statement_line_id: statement_line.id.clone(),
            gl_entry_id: candidate.gl_entry_id.to_string(),
            score: scoring.score(statement_line, candidate),
        })
        .collect();
    suggestions.sort_by(|left, right| right.score.partial_cmp(&left.score).unwrap_or(std::cmp::Ordering::Equal));
    suggestions
}

/// Confirms a suggested match: inserts a `MATCHED_WITH` link carrying the
/// residual `amount_delta` between the statement line and the GL entry, and
/// transitions the statement line to `matched`. Fails if the line is
/// already matched.
pub fn confirm_match(
    graph: &dyn LinkGraph,
    statement_line: &mut StatementLine,
    gl_entry_id: &str,
    amount_delta: Decimal,
    creating_event_id: &str,
) -> ReconcileResult<EconomicLink> {
    if statement_line.status == StatementLineStatus::Matched {
        return Err(ReconcileError::StatementLineAlreadyMatched(statement_line.id.clone()));
    }
    let mut metadata = HashMap::new();
    metadata.insert("amount_delta".to_string(), amount_delta);
    let link = graph.establish_link(
        &statement_line.id,
        gl_entry_id,
        LinkType::MatchedWith,
        creating_event_id,
        metadata,
        false,
    )?;
    statement_line.status = StatementLineStatus::Matched;
    Ok(link)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityOutcome {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFinding {
    pub check: String,
    pub outcome: IntegrityOutcome,
    pub message: String,
}

/// A read-only sweep over statement lines and the link graph. Never
/// mutates state; every finding is `passed | warning | failed`.
pub struct IntegrityChecker {
    pub stale_after_days: i64,
    pub variance_tolerance: Decimal,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            variance_tolerance: Decimal::new(1, 2),
        }
    }
}

impl IntegrityChecker {
    pub fn run(
        &self,
        graph: &dyn LinkGraph,
        statement_lines: &[StatementLine],
        declared_closing_balance: Option<Decimal>,
        as_of: DateTime<Utc>,
    ) -> Vec<IntegrityFinding> {
        let mut findings = Vec::new();
        findings.push(self.check_stale_unmatched(statement_lines, as_of));
        findings.push(self.check_duplicate_gl_matches(graph, statement_lines));
        findings.push(self.check_balance_discontinuity(statement_lines, declared_closing_balance));
        findings.push(self.check_unexplained_variance(graph, statement_lines));
        findings
    }

    fn check_balance_discontinuity(
        &self,
        statement_lines: &[StatementLine],
        declared_closing_balance: Option<Decimal>,
    ) -> IntegrityFinding {
        let Some(declared) = declared_closing_balance else {
            return IntegrityFinding {
                check: "balance_discontinuity".into(),
                outcome: IntegrityOutcome::Passed,
                message: "no declared closing balance supplied for this period".into(),
            };
        };
        let computed: Decimal = statement_lines.iter().map(|line| line.amount).sum();
        if (computed - declared).abs() <= self.variance_tolerance {
            IntegrityFinding {
                check: "balance_discontinuity".into(),
                outcome: IntegrityOutcome::Passed,
                message: "computed running balance matches the declared closing balance".into(),
            }
        } else {
            IntegrityFinding {
                check: "balance_discontinuity".into(),
                outcome: IntegrityOutcome::Failed,
                message: format!("computed balance {computed} diverges from declared closing balance {declared}"),
            }
        }
    }

    fn check_unexplained_variance(&self, graph: &dyn LinkGraph, statement_lines: &[StatementLine]) -> IntegrityFinding {
        let matched = statement_lines.iter().filter(|line| line.status == StatementLineStatus::Matched);
        let mut offending = 0;
        for line in matched {
            for link in graph.children(&line.id, &[LinkType::MatchedWith]) {
                let delta = link.metadata.get("amount_delta").copied().unwrap_or(Decimal::ZERO);
                if delta.abs() > self.variance_tolerance {
                    offending += 1;
                }
            }
        }
        if offending == 0 {
            IntegrityFinding {
                check: "unexplained_variance".into(),
                outcome: IntegrityOutcome::Passed,
                message: "every completed reconciliation is within variance tolerance".into(),
            }
        } else {
            IntegrityFinding {
                check: "unexplained_variance".into(),
                outcome: IntegrityOutcome::Warning,
                message: format!("{offending} completed match(es) carry unexplained variance"),
            }
        }
    }

    fn check_stale_unmatched(&self, statement_lines: &[StatementLine], as_of: DateTime<Utc>) -> IntegrityFinding {
        let stale: Vec<&StatementLine> = statement_lines
            .iter()
            .filter(|line| {
                line.status == StatementLineStatus::Unmatched
                    && (as_of - line.posted_at).num_days() > self.stale_after_days
            })
            .collect();
        if stale.is_empty() {
            IntegrityFinding {
                check: "stale_unmatched_lines".into(),
                outcome: IntegrityOutcome::Passed,
                message: "no unmatched statement line exceeds the staleness window".into(),
            }
        } else {
            IntegrityFinding {
                check: "stale_unmatched_lines".into(),
                outcome: IntegrityOutcome::Warning,
                message: format!("{} statement line(s) unmatched past {} days", stale.len(), self.stale_after_days),
            }
        }
    }

    fn check_duplicate_gl_matches(&self, graph: &dyn LinkGraph, statement_lines: &[StatementLine]) -> IntegrityFinding {
        let mut seen: HashMap<String, u32> = HashMap::new();
        for line in statement_lines {
            for link in graph.children(&line.id, &[LinkType::MatchedWith]) {
                *seen.entry(link.child_ref).or_insert(0) += 1;
            }
        }
        let duplicates: Vec<&String> = seen.iter().filter(|(_, count)| **count > 1).map(|(gl, _)| gl).collect();
        if duplicates.is_empty() {
            IntegrityFinding {
                check: "duplicate_gl_matches".into(),
                outcome: IntegrityOutcome::Passed,
                message: "no GL entry matched more than once".into(),
            }
        } else {
            IntegrityFinding {
                check: "duplicate_gl_matches".into(),
                outcome: IntegrityOutcome::Failed,
                message: format!("{} GL entr(ies) matched more than once", duplicates.len()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn apply_payment_tracks_remaining_balance() {
        let graph = InMemoryLinkGraph::new();
        let application = apply_payment(&graph, "inv-1", "pay-1", dec!(400.00), dec!(1000.00), "evt-1").expect("applies");
        assert_eq!(application.state.consumed_amount, dec!(400.00));
        assert_eq!(application.state.remaining_amount, dec!(600.00));
        assert_eq!(application.state.status, ReconciliationStatus::Partial);
    }

    #[test]
    fn apply_payment_rejects_overapplication() {
        let graph = InMemoryLinkGraph::new();
        apply_payment(&graph, "inv-1", "pay-1", dec!(900.00), dec!(1000.00), "evt-1").expect("applies");
        let err = apply_payment(&graph, "inv-1", "pay-2", dec!(200.00), dec!(1000.00), "evt-2").unwrap_err();
        assert!(matches!(err, ReconcileError::Overapplication { .. }));
    }

    #[test]
    fn apply_payment_rejects_against_fully_matched_invoice() {
        let graph = InMemoryLinkGraph::new();
        apply_payment(&graph, "inv-1", "pay-1", dec!(1000.00), dec!(1000.00), "evt-1").expect("applies");
        let err = apply_payment(&graph, "inv-1", "pay-2", dec!(0.01), dec!(1000.00), "evt-2").unwrap_err();
        assert!(matches!(err, ReconcileError::DocumentAlreadyMatched(_)));
    }

    #[test]
    fn three_way_match_within_tolerance_inserts_links() {
        let graph = InMemoryLinkGraph::new();
        let input = ThreeWayMatchInput {
            po_qty: dec!(100),
            po_unit_price: dec!(10.00),
            receipt_qty: dec!(100),
            invoice_qty: dec!(100),
            invoice_unit_price: dec!(10.00),
        };
        let result = create_three_way_match(&graph, "po-1", "rcpt-1", "inv-1", input, "evt-1", MatchTolerance::default())
            .expect("matches");
        assert_eq!(result.quantity_variance, dec!(0));
        assert_eq!(result.price_variance, dec!(0));
        assert_eq!(graph.children("po-1", &[LinkType::FulfilledBy]).len(), 1);
    }

    #[test]
    fn three_way_match_exceeding_tolerance_fails_without_inserting_links() {
        let graph = InMemoryLinkGraph::new();
        let input = ThreeWayMatchInput {
            po_qty: dec!(100),
            po_unit_price: dec!(10.00),
            receipt_qty: dec!(110),
            invoice_qty: dec!(110),
            invoice_unit_price: dec!(10.00),
        };
        let err = create_three_way_match(&graph, "po-1", "rcpt-1", "inv-1", input, "evt-1", MatchTolerance::default())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MatchVarianceExceeded(_)));
        assert!(graph.children("po-1", &[LinkType::FulfilledBy]).is_empty());
    }

    #[test]
    fn three_way_match_percent_tolerance_accepts_proportional_variance() {
        let graph = InMemoryLinkGraph::new();
        let input = ThreeWayMatchInput {
            po_qty: dec!(100),
            po_unit_price: dec!(10.00),
            receipt_qty: dec!(102),
            invoice_qty: dec!(102),
            invoice_unit_price: dec!(10.00),
        };
        let tolerance = MatchTolerance {
            quantity_tolerance: dec!(5),
            quantity_tolerance_kind: ToleranceKind::Percent,
            ..MatchTolerance::default()
        };
        let result = create_three_way_match(&graph, "po-1", "rcpt-1", "inv-1", input, "evt-1", tolerance)
            .expect("2% quantity variance is within a 5% tolerance");
        assert_eq!(result.quantity_variance, dec!(2));
    }

    #[test]
    fn three_way_match_percent_tolerance_rejects_disproportional_variance() {
        let graph = InMemoryLinkGraph::new();
        let input = ThreeWayMatchInput {
            po_qty: dec!(100),
            po_unit_price: dec!(10.00),
            receipt_qty: dec!(100),
            invoice_qty: dec!(100),
            invoice_unit_price: dec!(10.50),
        };
        let tolerance = MatchTolerance {
            price_tolerance: dec!(2),
            price_tolerance_kind: ToleranceKind::Percent,
            ..MatchTolerance::default()
        };
        let err = create_three_way_match(&graph, "po-1", "rcpt-1", "inv-1", input, "evt-1", tolerance).unwrap_err();
        assert!(matches!(err, ReconcileError::MatchVarianceExceeded(_)));
        assert!(graph.children("po-1", &[LinkType::FulfilledBy]).is_empty());
    }

    #[test]
    fn suggest_matches_ranks_closest_candidate_first() {
        let scoring = WeightedBankMatchScoring::default();
        let statement_line = StatementLine {
            id: "stmt-1".into(),
            amount: dec!(500.00),
            posted_at: Utc::now(),
            description: "Acme Corp Invoice 123".into(),
            status: StatementLineStatus::Unmatched,
        };
        let close = GlCandidate {
            gl_entry_id: "gl-1",
            amount: dec!(500.00),
            posted_at: statement_line.posted_at,
            description: "Acme Corp Invoice 123",
        };
        let far = GlCandidate {
            gl_entry_id: "gl-2",
            amount: dec!(50.00),
            posted_at: statement_line.posted_at - Duration::days(20),
            description: "Unrelated transfer",
        };
        let suggestions = suggest_matches(&scoring, &statement_line, &[far, close]);
        assert_eq!(suggestions[0].gl_entry_id, "gl-1");
        assert!(suggestions[0].score > suggestions[1].score);
    }

    #[test]
    fn confirm_match_transitions_statement_line() {
        let graph = InMemoryLinkGraph::new();
        let mut statement_line = StatementLine {
            id: "stmt-1".into(),
            amount: dec!(500.00),
            posted_at: Utc::now(),
            description: "Acme".into(),
            status: StatementLineStatus::Unmatched,
        };
        confirm_match(&graph, &mut statement_line, "gl-1", Decimal::ZERO, "evt-1").expect("confirms");
        assert_eq!(statement_line.status, StatementLineStatus::Matched);
        let err = confirm_match(&graph, &mut statement_line, "gl-2", Decimal::ZERO, "evt-2").unwrap_err();
        assert!(matches!(err, ReconcileError::StatementLineAlreadyMatched(_)));
    }

    #[test]
    fn integrity_checker_flags_duplicate_gl_matches() {
        let graph = InMemoryLinkGraph::new();
        let lines = vec![
            StatementLine {
                id: "stmt-1".into(),
                amount: dec!(500.00),
                posted_at: Utc::now(),
                description: "Acme".into(),
                status: StatementLineStatus::Matched,
            },
            StatementLine {
                id: "stmt-2".into(),
                amount: dec!(500.00),
                posted_at: Utc::now(),
                description: "Acme duplicate".into(),
                status: StatementLineStatus::Matched,
            },
        ];
        graph
            .establish_link("stmt-1", "gl-1", LinkType::MatchedWith, "evt-1", HashMap::new(), false)
            .expect("link");
        graph
            .establish_link("stmt-2", "gl-1", LinkType::MatchedWith, "evt-2", HashMap::new(), false)
            .expect("link");

        let findings = IntegrityChecker::default().run(&graph, &lines, None, Utc::now());
        let duplicate_finding = findings
            .iter()
            .find(|finding| finding.check == "duplicate_gl_matches")
            .expect("finding present");
        assert_eq!(duplicate_finding.outcome, IntegrityOutcome::Failed);
    }

    #[test]
    fn integrity_checker_flags_stale_unmatched_lines() {
        let graph = InMemoryLinkGraph::new();
        let now = Utc::now();
        let lines = vec![StatementLine {
            id: "stmt-1".into(),
            amount: dec!(100.00),
            posted_at: now - Duration::days(45),
            description: "Stale".into(),
            status: StatementLineStatus::Unmatched,
        }];
        let findings = IntegrityChecker::default().run(&graph, &lines, None, now);
        let stale_finding = findings
            .iter()
            .find(|finding| finding.check == "stale_unmatched_lines")
            .expect("finding present");
        assert_eq!(stale_finding.outcome, IntegrityOutcome::Warning);
    }

    #[test]
    fn integrity_checker_flags_balance_discontinuity() {
        let graph = InMemoryLinkGraph::new();
        let lines = vec![StatementLine {
            id: "stmt-1".into(),
            amount: dec!(500.00),
            posted_at: Utc::now(),
            description: "Acme".into(),
            status: StatementLineStatus::Unmatched,
        }];
        let findings = IntegrityChecker::default().run(&graph, &lines, Some(dec!(550.00)), Utc::now());
        let finding = findings
            .iter()
            .find(|finding| finding.check == "balance_discontinuity")
            .expect("finding present");
        assert_eq!(finding.outcome, IntegrityOutcome::Failed);
    }

    #[test]
    fn integrity_checker_flags_unexplained_variance_on_completed_match() {
        let graph = InMemoryLinkGraph::new();
        let mut statement_line = StatementLine {
            id: "stmt-1".into(),
            amount: dec!(500.00),
            posted_at: Utc::now(),
            description: "Acme".into(),
            status: StatementLineStatus::Unmatched,
        };
        confirm_match(&graph, &mut statement_line, "gl-1", dec!(25.00), "evt-1").expect("confirms");

        let findings = IntegrityChecker::default().run(&graph, &[statement_line], None, Utc::now());
        let finding = findings
            .iter()
            .find(|finding| finding.check == "unexplained_variance")
            .expect("finding present");
        assert_eq!(finding.outcome, IntegrityOutcome::Warning);
    }
}
