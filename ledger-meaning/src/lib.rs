#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The meaning builder (C4): composes an immutable [`Meaning`] from a
//! selected [`EconomicProfile`], its engine outputs, and a resolved-roles
//! snapshot. Performs no I/O beyond the role resolver and engine
//! dispatcher, making a `Meaning` cacheable by
//! `(profile.version, engine fingerprints, role snapshot)`.

use std::collections::HashMap;

use ledger_core::{AccountCode, Payload};
use ledger_engines::{EngineRegistry, EngineTraceRecord};
use ledger_policy::EconomicProfile;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MeaningResult<T> = Result<T, MeaningError>;

#[derive(Debug, Error)]
pub enum MeaningError {
    #[error("unresolved role {role} for ledger {ledger}")]
    UnresolvedRole { role: String, ledger: String },
    #[error("engine error: {0}")]
    Engine(#[from] ledger_engines::EngineError),
}

/// Maps a logical account role (e.g. `ACCOUNTS_PAYABLE`, `CASH`, `REVENUE`,
/// `ROUNDING`) to a COA account code for a given ledger. Immutable once
/// built from a policy-pack version; no locking required for reads.
pub trait RoleResolver: Send + Sync {
    fn resolve(&self, role: &str, ledger: &str) -> Option<AccountCode>;
}

/// A resolver backed by a flat `(role, ledger) -> account_code` table,
/// the common case for a single chart of accounts per legal entity.
pub struct TableRoleResolver {
    table: HashMap<(String, String), AccountCode>,
}

impl TableRoleResolver {
    pub fn new(table: HashMap<(String, String), AccountCode>) -> Self {
        Self { table }
    }
}

impl RoleResolver for TableRoleResolver {
    fn resolve(&self, role: &str, ledger: &str) -> Option<AccountCode> {
        self.table.get(&(role.to_string(), ledger.to_string())).cloned()
    }
}

/// A snapshot of every role the selected profile's line mappings reference,
/// resolved once and frozen into the `Meaning`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRoles(pub HashMap<String, AccountCode>);

/// The output of the meaning builder: an immutable composition of the
/// selected profile, every required engine's output, and the roles that
/// profile's line mappings will need, already resolved to account codes.
#[derive(Debug, Clone)]
pub struct Meaning {
    pub profile: EconomicProfile,
    pub engine_outputs: HashMap<String, serde_json::Value>,
    pub resolved_roles: ResolvedRoles,
}

/// Builds a [`Meaning`] for `profile` against `payload`: invokes every
/// engine the profile requires, resolves every role its line mappings
/// reference, and fails fast (`UnresolvedRole`) rather than posting with a
/// placeholder account.
pub fn build_meaning(
    profile: &EconomicProfile,
    payload: &Payload,
    registry: &EngineRegistry,
    resolver: &dyn RoleResolver,
) -> MeaningResult<(Meaning, Vec<EngineTraceRecord>)> {
    let payload_json = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);

    let mut engine_outputs = HashMap::new();
    let mut traces = Vec::new();
    for engine_name in &profile.required_engines {
        let params = profile.engine_parameters.clone();
        let (result, trace) = registry.dispatch(engine_name, &payload_json, &params);
        traces.push(trace);
        let output = result?;
        engine_outputs.insert(engine_name.clone(), output);
    }

    let mut resolved = HashMap::new();
    for mapping in &profile.line_mappings {
        if resolved.contains_key(&mapping.role) {
            continue;
        }
        let account_code = resolver
            .resolve(&mapping.role, &mapping.ledger)
            .ok_or_else(|| MeaningError::UnresolvedRole {
                role: mapping.role.clone(),
                ledger: mapping.ledger.clone(),
            })?;
        resolved.insert(mapping.role.clone(), account_code);
    }

    Ok((
        Meaning {
            profile: profile.clone(),
            engine_outputs,
            resolved_roles: ResolvedRoles(resolved),
        },
        traces,
    ))
}
