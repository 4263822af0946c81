#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The interpretation coordinator (C5): `post_event`, the locked-counter
//! sequence allocator (C7), and the idempotency/period guard (C8). This is
//! the single entry point that turns a business event into a balanced,
//! audited journal entry or a deterministic rejection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono::Utc;
use ledger_audit::{AppendRequest, AuditLog, Decision};
use ledger_core::{
    is_balanced, AccountCode, Currency, EntryStatus, FiscalPeriod, JournalEntry, JournalLine,
    LegalEntityId, Money, Payload, PayloadValue, PeriodStatus, PostingSide, SubledgerEntry,
};
use ledger_engines::EngineRegistry;
use ledger_meaning::{build_meaning, Meaning, RoleResolver};
use ledger_policy::{LineSource, PolicyError, PolicyPack, Side};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Every variant carries the stable, machine-readable `code()` callers
/// branch on; `Display` supplies a free-form message that may change across
/// versions.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("journal entry does not balance within tolerance")]
    UnbalancedEntry,
    #[error("currency mismatch: {0}")]
    CurrencyMismatch(String),
    #[error("no policy matched event type {0}")]
    NoMatchingPolicy(String),
    #[error("ambiguous policy match for event type {0}")]
    AmbiguousPolicy(String),
    #[error("unresolved role {role} for ledger {ledger}")]
    UnresolvedRole { role: String, ledger: String },
    #[error("posting period is closed")]
    ClosedPeriod,
    #[error("posting into an adjustable closed period requires is_adjustment=true")]
    AdjustmentRequired,
    #[error("guard rejected posting: {0}")]
    GuardRejected(String),
    #[error("sequence space exhausted for legal entity {0}")]
    SequenceExhausted(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::UnbalancedEntry => "UNBALANCED_ENTRY",
            CoordinatorError::CurrencyMismatch(_) => "CURRENCY_MISMATCH",
            CoordinatorError::NoMatchingPolicy(_) => "NO_MATCHING_POLICY",
            CoordinatorError::AmbiguousPolicy(_) => "AMBIGUOUS_POLICY",
            CoordinatorError::UnresolvedRole { .. } => "UNRESOLVED_ROLE",
            CoordinatorError::ClosedPeriod => "CLOSED_PERIOD",
            CoordinatorError::AdjustmentRequired => "ADJUSTMENT_REQUIRED",
            CoordinatorError::GuardRejected(_) => "GUARD_REJECTED",
            CoordinatorError::SequenceExhausted(_) => "SEQUENCE_EXHAUSTED",
            CoordinatorError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<ledger_meaning::MeaningError> for CoordinatorError {
    fn from(err: ledger_meaning::MeaningError) -> Self {
        match err {
            ledger_meaning::MeaningError::UnresolvedRole { role, ledger } => {
                CoordinatorError::UnresolvedRole { role, ledger }
            }
            ledger_meaning::MeaningError::Engine(inner) => {
                CoordinatorError::Internal(inner.to_string())
            }
        }
    }
}

impl From<PolicyError> for CoordinatorError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NoMatchingPolicy { event_type } => CoordinatorError::NoMatchingPolicy(event_type),
            PolicyError::AmbiguousPolicy { event_type, .. } => CoordinatorError::AmbiguousPolicy(event_type),
            other => CoordinatorError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingStatus {
    Accepted,
    Duplicate,
    Rejected,
}

/// Whether `post_event` commits the posting or only previews it. A "module"
/// service (the external collaborator layer) that owns its own transaction
/// can call with `DryRun` to materialise and validate a posting without the
/// core allocating a sequence number or writing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingMode {
    DryRun,
    Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingResult {
    pub status: PostingStatus,
    pub entry_id: Option<String>,
    pub entry_number: Option<u64>,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostEventRequest {
    pub legal_entity: LegalEntityId,
    pub event_type: String,
    pub payload: Payload,
    pub effective_date: NaiveDate,
    pub actor_id: String,
    pub amount: Money,
    pub event_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub is_adjustment: bool,
    pub mode: PostingMode,
}

struct State {
    sequence_counters: HashMap<LegalEntityId, u64>,
    entries_by_idempotency_key: HashMap<(LegalEntityId, String), (String, u64)>,
    entries: HashMap<String, JournalEntry>,
    lines: HashMap<String, Vec<JournalLine>>,
    subledger_entries: Vec<SubledgerEntry>,
    periods: HashMap<LegalEntityId, Vec<FiscalPeriod>>,
    hash_prev: HashMap<LegalEntityId, String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            sequence_counters: HashMap::new(),
            entries_by_idempotency_key: HashMap::new(),
            entries: HashMap::new(),
            lines: HashMap::new(),
            subledger_entries: Vec::new(),
            periods: HashMap::new(),
            hash_prev: HashMap::new(),
        }
    }
}

/// The posting kernel's single external entry point. One `post_event` call
/// is one logical transaction start-to-commit: the state mutex is held for
/// the whole call, modelling the locked-counter row (C7) and the
/// insert-or-select-locked idempotency check (C8) as the two serialisation
/// points a real RDBMS transaction would also hold.
pub struct LedgerCoordinator {
    state: Mutex<State>,
    policy_pack: Arc<PolicyPack>,
    engine_registry: EngineRegistry,
    role_resolver: Box<dyn RoleResolver>,
    audit_log: Arc<dyn AuditLog>,
}

impl LedgerCoordinator {
    pub fn new(
        policy_pack: Arc<PolicyPack>,
        engine_registry: EngineRegistry,
        role_resolver: Box<dyn RoleResolver>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy_pack,
            engine_registry,
            role_resolver,
            audit_log,
        }
    }

    /// Registers a fiscal period for a legal entity. Periods must be
    /// registered explicitly; a date with no covering period is treated as
    /// open (no period tracking configured for that range).
    pub async fn register_period(&self, legal_entity: &str, period: FiscalPeriod) {
        let mut state = self.state.lock().await;
        state
            .periods
            .entry(legal_entity.to_string())
            .or_default()
            .push(period);
    }

    pub async fn post_event(&self, request: PostEventRequest) -> PostingResult {
        let result = match self.post_event_inner(&request).await {
            Ok(result) => result,
            Err(err) => {
                self.append_rejection_audit(&request, &err).await;
                PostingResult {
                    status: PostingStatus::Rejected,
                    entry_id: None,
                    entry_number: None,
                    error_code: Some(err.code().to_string()),
                    message: Some(err.to_string()),
                }
            }
        };

        tracing::info!(
            legal_entity = %request.legal_entity,
            event_type = %request.event_type,
            status = ?result.status,
            entry_id = result.entry_id.as_deref().unwrap_or(""),
            entry_number = result.entry_number.unwrap_or_default(),
            error_code = result.error_code.as_deref().unwrap_or(""),
            "posting trace"
        );

        result
    }

    async fn append_rejection_audit(&self, request: &PostEventRequest, err: &CoordinatorError) {
        let _ = self
            .audit_log
            .append(AppendRequest {
                legal_entity: request.legal_entity.clone(),
                actor: request.actor_id.clone(),
                event_id: request.event_id.clone().unwrap_or_default(),
                correlation_id: request.idempotency_key.clone().unwrap_or_default(),
                decision: Decision::Rejected,
                rationale: serde_json::json!({"error_code": err.code(), "message": err.to_string()}),
            })
            .await;
    }

    async fn post_event_inner(&self, request: &PostEventRequest) -> CoordinatorResult<PostingResult> {
        let mut state = self.state.lock().await;

        // --- C8: idempotency guard ---
        if let Some(key) = &request.idempotency_key
            && let Some((entry_id, entry_number)) = state
                .entries_by_idempotency_key
                .get(&(request.legal_entity.clone(), key.clone()))
                .cloned()
        {
            return Ok(PostingResult {
                status: PostingStatus::Duplicate,
                entry_id: Some(entry_id),
                entry_number: Some(entry_number),
                error_code: None,
                message: None,
            });
        }

        // --- C8: period guard ---
        self.check_period(&state, request)?;

        // --- C2: policy selection ---
        let profile = self
            .policy_pack
            .find_for_event(&request.event_type, request.effective_date, &request.payload)?
            .clone();

        // --- C4: meaning construction ---
        let (meaning, _traces) = build_meaning(
            &profile,
            &request.payload,
            &self.engine_registry,
            self.role_resolver.as_ref(),
        )?;

        // --- line materialisation ---
        let entry_id = Uuid::new_v4().to_string();
        let materialized = materialize_lines(&entry_id, &meaning, request)?;
        let mut lines: Vec<JournalLine> = materialized.iter().map(|(line, _ledger)| line.clone()).collect();
        let subledger_ledgers: HashMap<String, String> = materialized
            .iter()
            .filter(|(_line, ledger)| ledger != "GL")
            .map(|(line, ledger)| (line.id.clone(), ledger.clone()))
            .collect();

        // --- balance check + single rounding line ---
        balance_with_rounding(&mut lines, &request.amount.currency, &entry_id)?;

        // --- guard re-evaluation ---
        for guard in &profile.guards {
            if guard.expr.evaluate(&request.payload) {
                return Err(CoordinatorError::GuardRejected(guard.error_code.clone()));
            }
        }

        if request.mode == PostingMode::DryRun {
            // A preview never allocates a sequence number, never touches
            // idempotency/hash-chain state, and is never persisted or
            // audited: the caller owns a transaction it may still roll back.
            return Ok(PostingResult {
                status: PostingStatus::Accepted,
                entry_id: Some(entry_id),
                entry_number: None,
                error_code: None,
                message: Some("dry run: not persisted".into()),
            });
        }

        // --- C7: sequence allocation ---
        let counter = state.sequence_counters.entry(request.legal_entity.clone()).or_insert(0);
        *counter = counter.checked_add(1).ok_or_else(|| {
            CoordinatorError::SequenceExhausted(request.legal_entity.clone())
        })?;
        let entry_number = *counter;

        // --- persist ---
        let hash_prev = state
            .hash_prev
            .get(&request.legal_entity)
            .cloned()
            .unwrap_or_else(|| "genesis".into());
        let created_at = Utc::now();
        let mut entry = JournalEntry {
            id: entry_id.clone(),
            legal_entity: request.legal_entity.clone(),
            entry_number,
            status: EntryStatus::Posted,
            effective_date: request.effective_date,
            currency: request.amount.currency.clone(),
            source_event_id: request.event_id.clone().unwrap_or_else(|| entry_id.clone()),
            idempotency_key: request.idempotency_key.clone(),
            created_at,
            created_by: request.actor_id.clone(),
            hash_prev: hash_prev.clone(),
            hash_self: String::new(),
        };
        let hash_self = compute_entry_hash(&entry, &lines)
            .map_err(|err| CoordinatorError::Internal(err.to_string()))?;
        entry.hash_self = hash_self.clone();

        let subledger_lines: Vec<SubledgerEntry> = lines
            .iter()
            .filter_map(|line| {
                let ledger = subledger_ledgers.get(&line.id)?;
                Some(SubledgerEntry {
                    id: Uuid::new_v4().to_string(),
                    line_id: line.id.clone(),
                    subledger: ledger.clone(),
                    subledger_key: line.account_code.clone(),
                    amount: line.amount.clone(),
                    side: line.side,
                })
            })
            .collect();

        state.entries.insert(entry_id.clone(), entry.clone());
        state.lines.insert(entry_id.clone(), lines);
        state.subledger_entries.extend(subledger_lines);
        state.hash_prev.insert(request.legal_entity.clone(), hash_self);
        if let Some(key) = &request.idempotency_key {
            state
                .entries_by_idempotency_key
                .insert((request.legal_entity.clone(), key.clone()), (entry_id.clone(), entry_number));
        }
        drop(state);

        let _ = self
            .audit_log
            .append(AppendRequest {
                legal_entity: request.legal_entity.clone(),
                actor: request.actor_id.clone(),
                event_id: entry.source_event_id.clone(),
                correlation_id: request.idempotency_key.clone().unwrap_or_default(),
                decision: Decision::Accepted,
                rationale: serde_json::json!({
                    "profile": profile.name,
                    "profile_version": profile.version,
                    "entry_number": entry_number,
                }),
            })
            .await;

        Ok(PostingResult {
            status: PostingStatus::Accepted,
            entry_id: Some(entry_id),
            entry_number: Some(entry_number),
            error_code: None,
            message: None,
        })
    }

    fn check_period(&self, state: &State, request: &PostEventRequest) -> CoordinatorResult<()> {
        let Some(periods) = state.periods.get(&request.legal_entity) else {
            return Ok(());
        };
        let Some(period) = periods.iter().find(|period| period.contains(request.effective_date)) else {
            return Ok(());
        };
        match (period.status, period.allows_adjustments, request.is_adjustment) {
            (PeriodStatus::Open, _, _) => Ok(()),
            (PeriodStatus::Closed, false, _) => Err(CoordinatorError::ClosedPeriod),
            (PeriodStatus::Closed, true, false) => Err(CoordinatorError::AdjustmentRequired),
            (PeriodStatus::Closed, true, true) => Ok(()),
        }
    }

    pub async fn entry(&self, entry_id: &str) -> Option<(JournalEntry, Vec<JournalLine>)> {
        let state = self.state.lock().await;
        let entry = state.entries.get(entry_id)?.clone();
        let lines = state.lines.get(entry_id).cloned().unwrap_or_default();
        Some((entry, lines))
    }

    pub async fn subledger_entries(&self) -> Vec<SubledgerEntry> {
        self.state.lock().await.subledger_entries.clone()
    }

    /// Walks every posted entry's hash chain per legal entity and confirms
    /// each `hash_self` matches a recomputation from `hash_prev` + the
    /// canonical entry/lines encoding. Used by tests and external auditors;
    /// never called on the posting path itself.
    pub async fn verify_chain(&self, legal_entity: &str) -> CoordinatorResult<()> {
        let state = self.state.lock().await;
        let mut entries: Vec<&JournalEntry> = state
            .entries
            .values()
            .filter(|entry| entry.legal_entity == legal_entity)
            .collect();
        entries.sort_by_key(|entry| entry.entry_number);

        let mut expected_prev = "genesis".to_string();
        for entry in entries {
            if entry.hash_prev != expected_prev {
                return Err(CoordinatorError::Internal(format!(
                    "hash chain broken at entry {}",
                    entry.id
                )));
            }
            let lines = state.lines.get(&entry.id).cloned().unwrap_or_default();
            let recomputed = compute_entry_hash(entry, &lines)
                .map_err(|err| CoordinatorError::Internal(err.to_string()))?;
            if recomputed != entry.hash_self {
                return Err(CoordinatorError::Internal(format!(
                    "hash mismatch at entry {}",
                    entry.id
                )));
            }
            expected_prev = entry.hash_self.clone();
        }
        Ok(())
    }
}

fn sha256_hex(input: &str) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `hash_self = H(hash_prev || canonical(entry, lines))`. The entry's own
/// `hash_self` field is cleared before encoding so the same function
/// reproduces the original hash both at write time and on chain
/// verification, regardless of what `hash_self` already holds.
fn compute_entry_hash(entry: &JournalEntry, lines: &[JournalLine]) -> serde_json::Result<String> {
    let mut entry_for_hash = entry.clone();
    entry_for_hash.hash_self = String::new();
    let canonical = serde_json::to_string(&(&entry_for_hash, lines))?;
    Ok(sha256_hex(&format!("{}{canonical}", entry.hash_prev)))
}

fn materialize_lines(
    entry_id: &str,
    meaning: &Meaning,
    request: &PostEventRequest,
) -> CoordinatorResult<Vec<(JournalLine, String)>> {
    let mut lines = Vec::new();
    let mut sequence = 0_u32;

    for mapping in &meaning.profile.line_mappings {
        let account_code = meaning
            .resolved_roles
            .0
            .get(&mapping.role)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnresolvedRole {
                role: mapping.role.clone(),
                ledger: mapping.ledger.clone(),
            })?;
        let side = match mapping.side {
            Side::Debit => PostingSide::Debit,
            Side::Credit => PostingSide::Credit,
        };

        match &mapping.source {
            LineSource::Primary => {
                let line = new_line(entry_id, &mut sequence, &account_code, side, request.amount.clone());
                lines.push((line, mapping.ledger.clone()));
            }
            LineSource::FromContext { field } => {
                let amount = request
                    .payload
                    .get(field)
                    .and_then(PayloadValue::as_decimal)
                    .ok_or_else(|| {
                        CoordinatorError::Internal(format!("from_context field {field} missing or not numeric"))
                    })?;
                let money = Money::new(amount, request.amount.currency.clone());
                let line = new_line(entry_id, &mut sequence, &account_code, side, money);
                lines.push((line, mapping.ledger.clone()));
            }
            LineSource::Foreach { collection } => {
                let elements = request
                    .payload
                    .get(collection)
                    .and_then(PayloadValue::as_list)
                    .ok_or_else(|| {
                        CoordinatorError::Internal(format!("foreach collection {collection} missing or not a list"))
                    })?;
                for element in elements {
                    let amount = element
                        .as_map()
                        .and_then(|fields| fields.get("amount"))
                        .and_then(PayloadValue::as_decimal)
                        .ok_or_else(|| {
                            CoordinatorError::Internal(format!(
                                "foreach element in {collection} missing numeric amount field"
                            ))
                        })?;
                    let money = Money::new(amount, request.amount.currency.clone());
                    let line = new_line(entry_id, &mut sequence, &account_code, side, money);
                    lines.push((line, mapping.ledger.clone()));
                }
            }
        }
    }

    Ok(lines)
}

fn new_line(
    entry_id: &str,
    sequence: &mut u32,
    account_code: &AccountCode,
    side: PostingSide,
    amount: Money,
) -> JournalLine {
    let line = JournalLine {
        id: Uuid::new_v4().to_string(),
        entry_id: entry_id.to_string(),
        sequence_in_entry: *sequence,
        account_code: account_code.clone(),
        side,
        amount,
        dimensions: std::collections::BTreeMap::new(),
        is_rounding: false,
    };
    *sequence += 1;
    line
}

/// Checks I1 per currency. If the imbalance is within the currency's
/// tolerance (half a minor unit, see [`Currency::rounding_tolerance`]) a
/// single flagged rounding line absorbs it; otherwise fails `UnbalancedEntry`
/// without ever silently correcting further.
fn balance_with_rounding(
    lines: &mut Vec<JournalLine>,
    currency: &Currency,
    entry_id: &str,
) -> CoordinatorResult<()> {
    if is_balanced(lines) {
        return Ok(());
    }

    let totals = ledger_core::balance_totals(lines);
    let Some((debits, credits)) = totals.get(&currency.code).copied() else {
        return Ok(());
    };

    let diff = debits - credits;
    let tolerance = currency.rounding_tolerance();
    if diff.abs() > tolerance {
        return Err(CoordinatorError::UnbalancedEntry);
    }

    // Credits are lighter when diff > 0: add a rounding credit line of +diff.
    let side = if diff > rust_decimal::Decimal::ZERO {
        PostingSide::Credit
    } else {
        PostingSide::Debit
    };
    let amount = Money::new(diff.abs(), currency.clone()).quantize();
    let rounding_account = "ROUNDING".to_string();
    let mut sequence = lines.len() as u32;
    let mut line = new_line(entry_id, &mut sequence, &rounding_account, side, amount);
    line.is_rounding = true;
    lines.push(line);

    if !is_balanced(lines) {
        return Err(CoordinatorError::UnbalancedEntry);
    }
    Ok(())
}

/// Pluggable backing store for `journal_entries`/`journal_lines`/
/// `subledger_entries` (C6) — the counterpart to `ledger_audit::AuditLog`
/// and `ledger_reconcile::LinkGraph` for the write-blocker-once-posted
/// contract `State` enforces in memory.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn persist_entry(
        &self,
        entry: &JournalEntry,
        lines: &[JournalLine],
        subledger_entries: &[SubledgerEntry],
    ) -> CoordinatorResult<()>;
}

#[cfg(feature = "postgres-store")]
pub mod postgres {
    //! Not yet wired to a real pool. Schema mirrors the in-memory model:
    //!
    //! ```sql
    //! CREATE TABLE journal_entries (
    //!     id UUID PRIMARY KEY,
    //!     legal_entity TEXT NOT NULL,
    //!     entry_number BIGINT NOT NULL,
    //!     idempotency_key TEXT,
    //!     status TEXT NOT NULL,
    //!     effective_date DATE NOT NULL,
    //!     hash_prev TEXT NOT NULL,
    //!     hash_self TEXT NOT NULL,
    //!     UNIQUE (legal_entity, entry_number)
    //! );
    //! CREATE UNIQUE INDEX journal_entries_idempotency
    //!     ON journal_entries (legal_entity, idempotency_key)
    //!     WHERE status != 'rejected';
    //! CREATE TABLE journal_lines (
    //!     id UUID PRIMARY KEY,
    //!     entry_id UUID NOT NULL REFERENCES journal_entries (id),
    //!     sequence INT NOT NULL,
    //!     account_code TEXT NOT NULL,
    //!     side TEXT NOT NULL,
    //!     amount NUMERIC NOT NULL,
    //!     currency TEXT NOT NULL,
    //!     is_rounding BOOLEAN NOT NULL
    //! );
    //! CREATE TABLE subledger_entries (
    //!     id UUID PRIMARY KEY,
    //!     entry_id UUID NOT NULL REFERENCES journal_entries (id),
    //!     subledger TEXT NOT NULL,
    //!     account_code TEXT NOT NULL,
    //!     amount NUMERIC NOT NULL
    //! );
    //! CREATE RULE journal_entries_no_update AS ON UPDATE TO journal_entries
    //!     WHERE OLD.status = 'posted' DO INSTEAD NOTHING;
    //! CREATE RULE journal_entries_no_delete AS ON DELETE TO journal_entries
    //!     WHERE OLD.status = 'posted' DO INSTEAD NOTHING;
    //! ```
    use super::{CoordinatorError, CoordinatorResult, LedgerStore};
    use ledger_core::{JournalEntry, JournalLine, SubledgerEntry};

    pub struct PostgresLedgerStore;

    #[async_trait::async_trait]
    impl LedgerStore for PostgresLedgerStore {
        async fn persist_entry(
            &self,
            _entry: &JournalEntry,
            _lines: &[JournalLine],
            _subledger_entries: &[SubledgerEntry],
        ) -> CoordinatorResult<()> {
            Err(CoordinatorError::Internal("postgres ledger store not yet implemented".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ledger_audit::InMemoryAuditLog;
    use ledger_meaning::TableRoleResolver;
    use ledger_policy::{EconomicProfile, LineMapping, Trigger};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn invoice_profile() -> EconomicProfile {
        EconomicProfile {
            name: "inventory_receipt".into(),
            version: "1".into(),
            module: "inventory".into(),
            trigger: Trigger {
                event_type: "inventory.receipt".into(),
                where_clauses: Vec::new(),
            },
            line_mappings: vec![
                LineMapping {
                    side: Side::Debit,
                    role: "INVENTORY".into(),
                    ledger: "GL".into(),
                    source: LineSource::Primary,
                },
                LineMapping {
                    side: Side::Credit,
                    role: "GR_IR_CLEARING".into(),
                    ledger: "GL".into(),
                    source: LineSource::Primary,
                },
            ],
            guards: Vec::new(),
            required_engines: Vec::new(),
            engine_parameters: StdHashMap::new(),
            effective_from: date(2024, 1, 1),
        }
    }

    fn resolver() -> TableRoleResolver {
        let mut table = StdHashMap::new();
        table.insert(("INVENTORY".to_string(), "GL".to_string()), "1300".to_string());
        table.insert(("GR_IR_CLEARING".to_string(), "GL".to_string()), "2100".to_string());
        TableRoleResolver::new(table)
    }

    fn coordinator() -> LedgerCoordinator {
        let pack = PolicyPack::compile(vec![invoice_profile()]).expect("compiles");
        LedgerCoordinator::new(
            pack,
            EngineRegistry::new(),
            Box::new(resolver()),
            InMemoryAuditLog::shared(),
        )
    }

    fn request(idempotency_key: Option<&str>) -> PostEventRequest {
        PostEventRequest {
            legal_entity: "ACME".into(),
            event_type: "inventory.receipt".into(),
            payload: Payload::new().insert("quantity", PayloadValue::Number(dec!(500))),
            effective_date: date(2025, 6, 1),
            actor_id: "system".into(),
            amount: Money::new(dec!(25000.00), Currency::usd()),
            event_id: Some("evt-1".into()),
            idempotency_key: idempotency_key.map(str::to_string),
            is_adjustment: false,
            mode: PostingMode::Commit,
        }
    }

    #[tokio::test]
    async fn simple_inventory_receipt_balances_with_no_rounding() {
        let coordinator = coordinator();
        let result = coordinator.post_event(request(Some("key-1"))).await;
        assert_eq!(result.status, PostingStatus::Accepted);
        let (entry, lines) = coordinator
            .entry(&result.entry_id.expect("has entry id"))
            .await
            .expect("entry exists");
        assert_eq!(entry.entry_number, 1);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| !line.is_rounding));
        assert!(is_balanced(&lines));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_short_circuits() {
        let coordinator = coordinator();
        let first = coordinator.post_event(request(Some("key-1"))).await;
        let second = coordinator.post_event(request(Some("key-1"))).await;
        assert_eq!(first.status, PostingStatus::Accepted);
        assert_eq!(second.status, PostingStatus::Duplicate);
        assert_eq!(first.entry_id, second.entry_id);
    }

    #[tokio::test]
    async fn closed_period_rejects_without_audit_chain_gap() {
        let coordinator = coordinator();
        coordinator
            .register_period(
                "ACME",
                FiscalPeriod {
                    period_code: "2025-06".into(),
                    start_date: date(2025, 6, 1),
                    end_date: date(2025, 6, 30),
                    status: PeriodStatus::Closed,
                    allows_adjustments: false,
                },
            )
            .await;

        let result = coordinator.post_event(request(Some("key-1"))).await;
        assert_eq!(result.status, PostingStatus::Rejected);
        assert_eq!(result.error_code.as_deref(), Some("CLOSED_PERIOD"));
    }

    #[tokio::test]
    async fn adjustable_closed_period_requires_is_adjustment_flag() {
        let coordinator = coordinator();
        coordinator
            .register_period(
                "ACME",
                FiscalPeriod {
                    period_code: "2025-06".into(),
                    start_date: date(2025, 6, 1),
                    end_date: date(2025, 6, 30),
                    status: PeriodStatus::Closed,
                    allows_adjustments: true,
                },
            )
            .await;

        let rejected = coordinator.post_event(request(Some("key-1"))).await;
        assert_eq!(rejected.error_code.as_deref(), Some("ADJUSTMENT_REQUIRED"));

        let mut adjusting = request(Some("key-2"));
        adjusting.is_adjustment = true;
        let accepted = coordinator.post_event(adjusting).await;
        assert_eq!(accepted.status, PostingStatus::Accepted);
    }

    #[tokio::test]
    async fn no_matching_policy_is_rejected_explicitly() {
        let coordinator = coordinator();
        let mut req = request(Some("key-1"));
        req.event_type = "unknown.event".into();
        let result = coordinator.post_event(req).await;
        assert_eq!(result.status, PostingStatus::Rejected);
        assert_eq!(result.error_code.as_deref(), Some("NO_MATCHING_POLICY"));
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_increasing() {
        let coordinator = coordinator();
        let first = coordinator.post_event(request(Some("key-1"))).await;
        let second = coordinator.post_event(request(Some("key-2"))).await;
        assert_eq!(first.entry_number, Some(1));
        assert_eq!(second.entry_number, Some(2));
    }

    #[tokio::test]
    async fn hash_chain_verifies_after_multiple_postings() {
        let coordinator = coordinator();
        coordinator.post_event(request(Some("key-1"))).await;
        coordinator.post_event(request(Some("key-2"))).await;
        assert!(coordinator.verify_chain("ACME").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_idempotent_posters_yield_exactly_one_entry() {
        let coordinator = Arc::new(coordinator());
        let a = coordinator.clone();
        let b = coordinator.clone();
        let req_a = request(Some("concurrent-key"));
        let req_b = request(Some("concurrent-key"));

        let (result_a, result_b) = tokio::join!(
            async move { a.post_event(req_a).await },
            async move { b.post_event(req_b).await }
        );

        let statuses = [result_a.status.clone(), result_b.status.clone()];
        assert!(statuses.contains(&PostingStatus::Accepted));
        assert!(statuses.contains(&PostingStatus::Duplicate));
        assert_eq!(result_a.entry_id, result_b.entry_id);
    }

    #[tokio::test]
    async fn dry_run_validates_without_persisting_or_allocating_a_sequence() {
        let coordinator = coordinator();
        let mut preview_request = request(Some("key-1"));
        preview_request.mode = PostingMode::DryRun;

        let preview = coordinator.post_event(preview_request).await;
        assert_eq!(preview.status, PostingStatus::Accepted);
        assert!(preview.entry_number.is_none());
        assert!(coordinator.entry(preview.entry_id.as_deref().unwrap_or_default()).await.is_none());

        let committed = coordinator.post_event(request(Some("key-1"))).await;
        assert_eq!(committed.status, PostingStatus::Accepted);
        assert_eq!(committed.entry_number, Some(1));
    }
}
