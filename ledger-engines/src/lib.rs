#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The engine dispatcher registry (open/closed, name -> invoker, no central
//! switch on event type) plus the two reference engines: allocation and
//! variance.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ledger_core::{Currency, Money};
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not registered: {0}")]
    NotRegistered(String),
    #[error("invalid engine input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// A pure `(payload, frozen_params) -> result` calculation. Implementations
/// must not perform I/O and must be deterministic for identical inputs.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn invoke(
        &self,
        payload: &serde_json::Value,
        params: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTraceRecord {
    pub engine: String,
    pub version: String,
    pub input_fingerprint: String,
    pub duration: Duration,
    pub outcome: TraceOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceOutcome {
    Ok,
    Err,
}

/// `H(canonical(subset_of_payload, params))`: two calls with identical
/// payload subset and params always fingerprint identically, regardless of
/// field insertion order (JSON map keys are sorted before hashing).
pub fn fingerprint(payload: &serde_json::Value, params: &HashMap<String, serde_json::Value>) -> String {
    let sorted_params: std::collections::BTreeMap<_, _> = params.iter().collect();
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(payload).as_bytes());
    hasher.update(
        serde_json::to_string(&sorted_params)
            .unwrap_or_default()
            .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    // serde_json::Value does not guarantee sorted map keys on its own;
    // round-trip through a BTreeMap-backed structure for objects.
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> = map.iter().collect();
            serde_json::to_string(&sorted).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Open/closed registry: adding an engine is a `register` call, never a
/// change to this type's own code.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Box<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Box<dyn Engine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn dispatch(
        &self,
        name: &str,
        payload: &serde_json::Value,
        params: &HashMap<String, serde_json::Value>,
    ) -> (EngineResult<serde_json::Value>, EngineTraceRecord) {
        let input_fingerprint = fingerprint(payload, params);
        let started = Instant::now();

        let Some(engine) = self.engines.get(name) else {
            let record = EngineTraceRecord {
                engine: name.to_string(),
                version: "unknown".into(),
                input_fingerprint,
                duration: started.elapsed(),
                outcome: TraceOutcome::Err,
            };
            return (Err(EngineError::NotRegistered(name.to_string())), record);
        };

        let result = engine.invoke(payload, params);
        let record = EngineTraceRecord {
            engine: engine.name().to_string(),
            version: engine.version().to_string(),
            input_fingerprint,
            duration: started.elapsed(),
            outcome: if result.is_ok() { TraceOutcome::Ok } else { TraceOutcome::Err },
        };
        (result, record)
    }
}

/// Registers the reference engines this crate ships: allocation and
/// variance. Additional engines (aging, tax, matching, cost cascades,
/// billing) register the same way without touching this function's body.
pub fn register_standard_engines(registry: &mut EngineRegistry) {
    registry.register(Box::new(allocation::AllocationEngine));
    registry.register(Box::new(variance::VarianceEngine));
}

pub mod allocation {
    //! Multi-method allocation, grounded on the exact rounding-absorption
    //! algorithm used elsewhere in this problem domain: every
    //! non-designated target's share is rounded half-up at currency
    //! precision, and the single designated rounding target absorbs the
    //! precise remainder so the total always reconciles exactly (R4).

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AllocationMethod {
        ProRata,
        Fifo,
        Lifo,
        Specific,
        Weighted,
        Equal,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllocationTarget {
        pub id: String,
        pub eligible_amount: Decimal,
        pub weight: Option<Decimal>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllocationLine {
        pub target_id: String,
        pub amount: Decimal,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllocationResult {
        pub lines: Vec<AllocationLine>,
        pub total_allocated: Decimal,
        pub unallocated: Decimal,
    }

    pub struct AllocationEngine;

    impl Engine for AllocationEngine {
        fn name(&self) -> &str {
            "allocation"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn invoke(
            &self,
            payload: &serde_json::Value,
            params: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<serde_json::Value> {
            let request: AllocationRequest = serde_json::from_value(payload.clone())
                .map_err(|err| EngineError::InvalidInput(err.to_string()))?;
            let rounding_target_index = params
                .get("rounding_target_index")
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as usize);
            let result = allocate(
                request.method,
                request.amount,
                request.decimal_places,
                &request.targets,
                rounding_target_index,
            )?;
            serde_json::to_value(result).map_err(|err| EngineError::Internal(err.to_string()))
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AllocationRequest {
        pub method: AllocationMethod,
        pub amount: Decimal,
        pub decimal_places: u32,
        pub targets: Vec<AllocationTarget>,
    }

    /// Dispatches by method. `rounding_target_index` defaults to the last
    /// target (index `targets.len() - 1`) when `None`, matching the default
    /// used by the ratio-based methods elsewhere in this domain.
    pub fn allocate(
        method: AllocationMethod,
        amount: Decimal,
        decimal_places: u32,
        targets: &[AllocationTarget],
        rounding_target_index: Option<usize>,
    ) -> EngineResult<AllocationResult> {
        if targets.is_empty() {
            return Err(EngineError::InvalidInput("no allocation targets".into()));
        }

        match method {
            AllocationMethod::ProRata => {
                let total_eligible: Decimal = targets.iter().map(|t| t.eligible_amount).sum();
                if total_eligible.is_zero() {
                    return Err(EngineError::InvalidInput("total eligible amount is zero".into()));
                }
                let ratios: Vec<Decimal> = targets
                    .iter()
                    .map(|t| t.eligible_amount / total_eligible)
                    .collect();
                allocate_by_ratio(amount, decimal_places, targets, &ratios, rounding_target_index)
            }
            AllocationMethod::Weighted => {
                let total_weight: Decimal = targets
                    .iter()
                    .map(|t| t.weight.unwrap_or(Decimal::ZERO))
                    .sum();
                if total_weight.is_zero() {
                    return Err(EngineError::InvalidInput("total weight is zero".into()));
                }
                let ratios: Vec<Decimal> = targets
                    .iter()
                    .map(|t| t.weight.unwrap_or(Decimal::ZERO) / total_weight)
                    .collect();
                allocate_by_ratio(amount, decimal_places, targets, &ratios, rounding_target_index)
            }
            AllocationMethod::Equal => {
                let ratio = Decimal::ONE / Decimal::from(targets.len() as u64);
                let ratios = vec![ratio; targets.len()];
                allocate_by_ratio(amount, decimal_places, targets, &ratios, rounding_target_index)
            }
            AllocationMethod::Fifo => allocate_sequential(amount, targets, false),
            AllocationMethod::Lifo => allocate_sequential(amount, targets, true),
            AllocationMethod::Specific => allocate_specific(amount, targets),
        }
    }

    /// The shared ratio-allocation algorithm. Every target except the
    /// designated rounding target is rounded half-up at `decimal_places`
    /// and capped against its own `eligible_amount` (over-allocation
    /// capping); the rounding target takes the exact remainder
    /// `amount - allocated_so_far`, guaranteeing
    /// `total_allocated + unallocated == amount`.
    fn allocate_by_ratio(
        amount: Decimal,
        decimal_places: u32,
        targets: &[AllocationTarget],
        ratios: &[Decimal],
        rounding_target_index: Option<usize>,
    ) -> EngineResult<AllocationResult> {
        let rounding_index = rounding_target_index.unwrap_or(targets.len() - 1);
        if rounding_index >= targets.len() {
            return Err(EngineError::InvalidInput("rounding_target_index out of range".into()));
        }

        let mut lines = Vec::with_capacity(targets.len());
        let mut allocated_so_far = Decimal::ZERO;

        for (index, target) in targets.iter().enumerate() {
            if index == rounding_index {
                continue;
            }
            let raw_share = amount * ratios[index];
            let mut share = raw_share.round_dp_with_strategy(decimal_places, RoundingStrategy::MidpointAwayFromZero);
            if share > target.eligible_amount {
                share = target.eligible_amount;
            }
            allocated_so_far += share;
            lines.push((index, AllocationLine {
                target_id: target.id.clone(),
                amount: share,
            }));
        }

        let remainder = amount - allocated_so_far;
        lines.push((rounding_index, AllocationLine {
            target_id: targets[rounding_index].id.clone(),
            amount: remainder,
        }));

        lines.sort_by_key(|(index, _)| *index);
        let ordered: Vec<AllocationLine> = lines.into_iter().map(|(_, line)| line).collect();
        let total_allocated: Decimal = ordered.iter().map(|line| line.amount).sum();

        Ok(AllocationResult {
            unallocated: amount - total_allocated,
            total_allocated,
            lines: ordered,
        })
    }

    /// FIFO/LIFO: walk targets in (reversed, for LIFO) order, each consuming
    /// `min(remaining, eligible_amount)` until the amount is exhausted.
    fn allocate_sequential(
        amount: Decimal,
        targets: &[AllocationTarget],
        reverse: bool,
    ) -> EngineResult<AllocationResult> {
        let mut order: Vec<usize> = (0..targets.len()).collect();
        if reverse {
            order.reverse();
        }

        let mut remaining = amount;
        let mut lines_by_index: HashMap<usize, Decimal> = HashMap::new();
        for index in order {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(targets[index].eligible_amount);
            if take > Decimal::ZERO {
                lines_by_index.insert(index, take);
                remaining -= take;
            }
        }

        let lines: Vec<AllocationLine> = (0..targets.len())
            .filter_map(|index| {
                lines_by_index.get(&index).map(|amount| AllocationLine {
                    target_id: targets[index].id.clone(),
                    amount: *amount,
                })
            })
            .collect();
        let total_allocated: Decimal = lines.iter().map(|line| line.amount).sum();

        Ok(AllocationResult {
            unallocated: amount - total_allocated,
            total_allocated,
            lines,
        })
    }

    /// Each target takes exactly its own `eligible_amount`; the caller is
    /// responsible for ensuring those sum to `amount` (a mismatch is
    /// reported via `unallocated`, never silently corrected).
    fn allocate_specific(amount: Decimal, targets: &[AllocationTarget]) -> EngineResult<AllocationResult> {
        let lines: Vec<AllocationLine> = targets
            .iter()
            .map(|target| AllocationLine {
                target_id: target.id.clone(),
                amount: target.eligible_amount,
            })
            .collect();
        let total_allocated: Decimal = lines.iter().map(|line| line.amount).sum();

        Ok(AllocationResult {
            unallocated: amount - total_allocated,
            total_allocated,
            lines,
        })
    }

    /// Convenience wrapper returning [`Money`]-typed lines for callers that
    /// already hold a [`Currency`].
    pub fn allocate_money(
        method: AllocationMethod,
        amount: &Money,
        targets: &[AllocationTarget],
        rounding_target_index: Option<usize>,
    ) -> EngineResult<Vec<(String, Money)>> {
        let result = allocate(
            method,
            amount.amount,
            amount.currency.decimal_places,
            targets,
            rounding_target_index,
        )?;
        Ok(result
            .lines
            .into_iter()
            .map(|line| (line.target_id, Money::new(line.amount, amount.currency.clone())))
            .collect())
    }
}

pub mod variance {
    //! Price/quantity/fx/standard-cost variance computation.

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum VarianceType {
        Price,
        Quantity,
        Fx,
        StandardCost,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VarianceRequest {
        pub variance_type: VarianceType,
        pub actual: Decimal,
        pub standard: Decimal,
        pub quantity: Decimal,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VarianceResult {
        pub variance_type: VarianceType,
        pub variance_amount: Decimal,
        pub is_favorable: bool,
    }

    pub struct VarianceEngine;

    impl Engine for VarianceEngine {
        fn name(&self) -> &str {
            "variance"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn invoke(
            &self,
            payload: &serde_json::Value,
            _params: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<serde_json::Value> {
            let request: VarianceRequest = serde_json::from_value(payload.clone())
                .map_err(|err| EngineError::InvalidInput(err.to_string()))?;
            let result = compute(&request);
            serde_json::to_value(result).map_err(|err| EngineError::Internal(err.to_string()))
        }
    }

    /// `variance_amount = (actual - standard) * quantity`; favorable when
    /// actual cost is below standard (a lower cost than planned).
    pub fn compute(request: &VarianceRequest) -> VarianceResult {
        let variance_amount = (request.actual - request.standard) * request.quantity;
        VarianceResult {
            variance_type: request.variance_type,
            is_favorable: variance_amount.is_sign_negative() || variance_amount.is_zero(),
            variance_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::allocation::{allocate, AllocationMethod, AllocationTarget};
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn pro_rata_allocation_absorbs_rounding_into_last_target() {
        let targets = vec![
            AllocationTarget { id: "a".into(), eligible_amount: dec!(33.33), weight: None },
            AllocationTarget { id: "b".into(), eligible_amount: dec!(33.33), weight: None },
            AllocationTarget { id: "c".into(), eligible_amount: dec!(33.34), weight: None },
        ];
        let result = allocate(AllocationMethod::ProRata, dec!(100.00), 2, &targets, None)
            .expect("allocates");
        assert_eq!(result.total_allocated, dec!(100.00));
        assert_eq!(result.unallocated, dec!(0.00));
        assert_eq!(result.lines[0].amount, dec!(33.33));
        assert_eq!(result.lines[1].amount, dec!(33.33));
        assert_eq!(result.lines[2].amount, dec!(33.34));
    }

    #[test]
    fn equal_allocation_splits_evenly_with_remainder_absorbed() {
        let targets = vec![
            AllocationTarget { id: "a".into(), eligible_amount: dec!(1000), weight: None },
            AllocationTarget { id: "b".into(), eligible_amount: dec!(1000), weight: None },
            AllocationTarget { id: "c".into(), eligible_amount: dec!(1000), weight: None },
        ];
        let result = allocate(AllocationMethod::Equal, dec!(10.00), 2, &targets, None)
            .expect("allocates");
        assert_eq!(result.total_allocated, dec!(10.00));
    }

    #[test]
    fn fifo_consumes_targets_in_order() {
        let targets = vec![
            AllocationTarget { id: "a".into(), eligible_amount: dec!(60.00), weight: None },
            AllocationTarget { id: "b".into(), eligible_amount: dec!(60.00), weight: None },
        ];
        let result = allocate(AllocationMethod::Fifo, dec!(100.00), 2, &targets, None)
            .expect("allocates");
        assert_eq!(result.lines[0].amount, dec!(60.00));
        assert_eq!(result.lines[1].amount, dec!(40.00));
        assert_eq!(result.total_allocated, dec!(100.00));
    }

    #[test]
    fn lifo_consumes_targets_in_reverse_order() {
        let targets = vec![
            AllocationTarget { id: "a".into(), eligible_amount: dec!(60.00), weight: None },
            AllocationTarget { id: "b".into(), eligible_amount: dec!(60.00), weight: None },
        ];
        let result = allocate(AllocationMethod::Lifo, dec!(100.00), 2, &targets, None)
            .expect("allocates");
        assert_eq!(result.lines[0].amount, dec!(40.00));
        assert_eq!(result.lines[1].amount, dec!(60.00));
    }

    #[test]
    fn fingerprint_is_stable_across_field_order() {
        let payload_a = serde_json::json!({"a": 1, "b": 2});
        let payload_b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(
            fingerprint(&payload_a, &HashMap::new()),
            fingerprint(&payload_b, &HashMap::new())
        );
    }

    #[test]
    fn dispatch_reports_not_registered() {
        let registry = EngineRegistry::new();
        let (result, trace) = registry.dispatch("unknown", &serde_json::json!({}), &HashMap::new());
        assert!(result.is_err());
        assert_eq!(trace.outcome, TraceOutcome::Err);
    }

    #[test]
    fn variance_price_variance_matches_scenario() {
        let request = variance::VarianceRequest {
            variance_type: variance::VarianceType::Price,
            actual: dec!(10.50),
            standard: dec!(10.00),
            quantity: dec!(100),
        };
        let result = variance::compute(&request);
        assert_eq!(result.variance_amount, dec!(50.00));
        assert!(!result.is_favorable);
    }
}
