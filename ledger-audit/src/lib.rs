#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Hash-chained audit log for posting decisions (I5). Every accepted or
//! rejected posting attempt appends one record; the chain is verified on
//! every read so tampering with a stored record is detected immediately.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("corrupted chain: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub legal_entity: String,
    pub actor: String,
    pub event_id: String,
    pub correlation_id: String,
    pub decision: Decision,
    pub rationale: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub legal_entity: String,
    pub actor: String,
    pub event_id: String,
    pub correlation_id: String,
    pub decision: Decision,
    pub occurred_at: DateTime<Utc>,
    pub rationale: serde_json::Value,
    pub prev_hash: String,
    pub self_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditEventFilter {
    pub legal_entity: Option<String>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, request: AppendRequest) -> AuditResult<AuditEvent>;

    async fn events(&self, filter: AuditEventFilter) -> AuditResult<Vec<AuditEvent>>;
}

/// Genesis sentinel every chain starts from, matching the convention used
/// for other hash-chained logs in this codebase.
const GENESIS: &str = "genesis";

#[derive(Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn compute_hash(
        previous: &str,
        legal_entity: &str,
        event_id: &str,
        decision: Decision,
        occurred_at: DateTime<Utc>,
        rationale: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(legal_entity.as_bytes());
        hasher.update(event_id.as_bytes());
        hasher.update(format!("{decision:?}").as_bytes());
        let nanos = occurred_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| occurred_at.timestamp_micros() * 1_000);
        hasher.update(nanos.to_be_bytes());
        hasher.update(rationale.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn validate_request(request: &AppendRequest) -> AuditResult<()> {
        if request.legal_entity.trim().is_empty() {
            return Err(AuditError::Validation("legal_entity must be provided".into()));
        }
        if request.event_id.trim().is_empty() {
            return Err(AuditError::Validation("event_id must be provided".into()));
        }
        if request.actor.trim().is_empty() {
            return Err(AuditError::Validation("actor must be provided".into()));
        }
        Ok(())
    }

    /// Walks the chain verifying each record's `self_hash` against its
    /// predecessor. Used on every read so corruption surfaces immediately
    /// rather than silently.
    async fn verify_chain(events: &[AuditEvent]) -> AuditResult<()> {
        let mut previous = String::from(GENESIS);
        for event in events {
            if event.prev_hash != previous {
                return Err(AuditError::Corrupted(format!(
                    "unexpected previous hash for {}",
                    event.id
                )));
            }
            let expected = Self::compute_hash(
                &event.prev_hash,
                &event.legal_entity,
                &event.event_id,
                event.decision,
                event.occurred_at,
                &event.rationale,
            );
            if expected != event.self_hash {
                return Err(AuditError::Corrupted(format!("hash mismatch for {}", event.id)));
            }
            previous = event.self_hash.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, request: AppendRequest) -> AuditResult<AuditEvent> {
        Self::validate_request(&request)?;

        let mut guard = self.events.write().await;
        let prev_hash = guard
            .last()
            .map(|event| event.self_hash.clone())
            .unwrap_or_else(|| GENESIS.into());

        let occurred_at = Utc::now();
        let self_hash = Self::compute_hash(
            &prev_hash,
            &request.legal_entity,
            &request.event_id,
            request.decision,
            occurred_at,
            &request.rationale,
        );

        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            legal_entity: request.legal_entity,
            actor: request.actor,
            event_id: request.event_id,
            correlation_id: request.correlation_id,
            decision: request.decision,
            occurred_at,
            rationale: request.rationale,
            prev_hash,
            self_hash,
        };

        guard.push(event.clone());
        Ok(event)
    }

    async fn events(&self, filter: AuditEventFilter) -> AuditResult<Vec<AuditEvent>> {
        let guard = self.events.read().await;
        Self::verify_chain(&guard).await?;
        let mut filtered = guard.clone();

        if let Some(legal_entity) = filter.legal_entity {
            filtered.retain(|event| event.legal_entity == legal_entity);
        }
        if let Some(correlation_id) = filter.correlation_id {
            filtered.retain(|event| event.correlation_id == correlation_id);
        }
        if let Some(limit) = filter.limit
            && filtered.len() > limit
        {
            filtered.truncate(limit);
        }

        Ok(filtered)
    }
}

#[cfg(feature = "postgres-store")]
pub mod postgres {
    //! Not yet wired to a real pool. Schema mirrors the in-memory model:
    //!
    //! ```sql
    //! CREATE TABLE audit_events (
    //!     id UUID PRIMARY KEY,
    //!     legal_entity TEXT NOT NULL,
    //!     actor TEXT NOT NULL,
    //!     event_id TEXT NOT NULL,
    //!     correlation_id TEXT NOT NULL,
    //!     decision TEXT NOT NULL,
    //!     occurred_at TIMESTAMPTZ NOT NULL,
    //!     rationale JSONB NOT NULL,
    //!     prev_hash TEXT NOT NULL,
    //!     self_hash TEXT NOT NULL
    //! );
    //! CREATE RULE audit_events_no_update AS ON UPDATE TO audit_events DO INSTEAD NOTHING;
    //! CREATE RULE audit_events_no_delete AS ON DELETE TO audit_events DO INSTEAD NOTHING;
    //! ```
    use super::{AppendRequest, AuditError, AuditEvent, AuditEventFilter, AuditLog, AuditResult};
    use async_trait::async_trait;

    pub struct PostgresAuditLog;

    #[async_trait]
    impl AuditLog for PostgresAuditLog {
        async fn append(&self, _request: AppendRequest) -> AuditResult<AuditEvent> {
            Err(AuditError::Storage("postgres audit log not yet implemented".into()))
        }

        async fn events(&self, _filter: AuditEventFilter) -> AuditResult<Vec<AuditEvent>> {
            Err(AuditError::Storage("postgres audit log not yet implemented".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rationale() -> serde_json::Value {
        serde_json::json!({"profile": "invoice.v1"})
    }

    #[tokio::test]
    async fn appends_events_with_hash_chain() {
        let log = InMemoryAuditLog::shared();

        let first = log
            .append(AppendRequest {
                legal_entity: "ACME".into(),
                actor: "system".into(),
                event_id: "evt-1".into(),
                correlation_id: "corr-1".into(),
                decision: Decision::Accepted,
                rationale: rationale(),
            })
            .await
            .expect("append event");

        assert_eq!(first.prev_hash, "genesis");
        assert!(!first.self_hash.is_empty());

        let second = log
            .append(AppendRequest {
                legal_entity: "ACME".into(),
                actor: "system".into(),
                event_id: "evt-2".into(),
                correlation_id: "corr-2".into(),
                decision: Decision::Rejected,
                rationale: rationale(),
            })
            .await
            .expect("append event");

        assert_eq!(second.prev_hash, first.self_hash);

        let events = log
            .events(AuditEventFilter::default())
            .await
            .expect("events");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn rejections_still_extend_the_chain() {
        let log = InMemoryAuditLog::shared();
        log.append(AppendRequest {
            legal_entity: "ACME".into(),
            actor: "system".into(),
            event_id: "evt-1".into(),
            correlation_id: "corr-1".into(),
            decision: Decision::Rejected,
            rationale: serde_json::json!({"error_code": "CLOSED_PERIOD"}),
        })
        .await
        .expect("append event");

        let events = log
            .events(AuditEventFilter::default())
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, Decision::Rejected);
    }

    #[tokio::test]
    async fn detects_tampering() {
        let log = InMemoryAuditLog::shared();

        log.append(AppendRequest {
            legal_entity: "ACME".into(),
            actor: "system".into(),
            event_id: "evt-1".into(),
            correlation_id: "corr-1".into(),
            decision: Decision::Accepted,
            rationale: rationale(),
        })
        .await
        .expect("append");

        log.append(AppendRequest {
            legal_entity: "ACME".into(),
            actor: "system".into(),
            event_id: "evt-2".into(),
            correlation_id: "corr-2".into(),
            decision: Decision::Accepted,
            rationale: rationale(),
        })
        .await
        .expect("append");

        {
            let mut guard = log.events.write().await;
            guard[1].prev_hash = "tampered".into();
        }

        let err = log.events(AuditEventFilter::default()).await.unwrap_err();
        assert!(matches!(err, AuditError::Corrupted(_)));
    }
}
