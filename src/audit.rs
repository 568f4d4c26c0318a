//! Append-only audit log with per-run hash chaining.
//!
//! Chains live keyed by `(message_id, run_id)`. Each event's `event_hash`
//! is the SHA-256 of the canonical JSON of the event body without the
//! `event_hash` member; `prev_event_hash` links to the predecessor, the
//! genesis event carries the fixed zero hash. Verification recomputes every
//! hash and reports the index of the first broken link.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifacts::{ArtifactRef, EvidenceSpan, ModelRef, SCHEMA_AUDIT_EVENT};
use crate::canonical::jcs;
use crate::config::ConfigRef;
use crate::error::{AuditError, ValidationError};
use crate::registry::Stage;

/// `prev_event_hash` of the first event in every chain.
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Who produced an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    System,
    Reviewer,
}

/// One link in an audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub message_id: String,
    pub run_id: String,
    pub stage: Stage,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub input_ref: ArtifactRef,
    pub output_ref: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ConfigRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_ref: Option<crate::artifacts::RulesetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<ModelRef>,
    /// Redacted evidence only; never full account or document numbers.
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    pub prev_event_hash: String,
    pub event_hash: String,
}

/// Everything an event carries except the chain linkage, which the log
/// fills in at append time.
#[derive(Debug, Clone)]
pub struct AuditEventDraft {
    pub message_id: String,
    pub run_id: String,
    pub stage: Stage,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub input_ref: ArtifactRef,
    pub output_ref: ArtifactRef,
    pub decision_hash: Option<String>,
    pub config_ref: Option<ConfigRef>,
    pub rules_ref: Option<crate::artifacts::RulesetRef>,
    pub model_ref: Option<ModelRef>,
    pub evidence: Vec<EvidenceSpan>,
}

impl AuditEventDraft {
    pub fn new(
        message_id: impl Into<String>,
        run_id: impl Into<String>,
        stage: Stage,
        input_ref: ArtifactRef,
        output_ref: ArtifactRef,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            run_id: run_id.into(),
            stage,
            actor_type: ActorType::System,
            actor_id: None,
            created_at: Utc::now(),
            input_ref,
            output_ref,
            decision_hash: None,
            config_ref: None,
            rules_ref: None,
            model_ref: None,
            evidence: Vec::new(),
        }
    }

    pub fn with_decision_hash(mut self, hash: impl Into<String>) -> Self {
        self.decision_hash = Some(hash.into());
        self
    }

    pub fn with_config_ref(mut self, config_ref: ConfigRef) -> Self {
        self.config_ref = Some(config_ref);
        self
    }

    pub fn with_rules_ref(mut self, rules_ref: crate::artifacts::RulesetRef) -> Self {
        self.rules_ref = Some(rules_ref);
        self
    }

    pub fn with_model_ref(mut self, model_ref: ModelRef) -> Self {
        self.model_ref = Some(model_ref);
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceSpan>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Deterministic event id: UUIDv5 over the chain position identifiers, so
/// replays of identical stage outputs reproduce identical ids.
fn event_id(draft: &AuditEventDraft) -> String {
    let name = format!(
        "audit:{}:{}:{}:{}",
        draft.message_id,
        draft.run_id,
        draft.stage,
        draft.output_ref.sha256
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Computes the hash of an event with its `event_hash` member removed.
fn event_hash(event: &AuditEvent) -> Result<String, ValidationError> {
    let mut value = serde_json::to_value(event)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("event_hash");
    }
    jcs::canonical_sha256(&value).map_err(|e| ValidationError::Rejected {
        schema_id: SCHEMA_AUDIT_EVENT.into(),
        reason: e.to_string(),
    })
}

/// Result of verifying one audit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub events_checked: usize,
    /// Index and description of the first broken link, if any.
    pub first_error: Option<(usize, String)>,
}

impl ChainVerification {
    pub fn ok(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Verifies a chain: linkage, recomputed hashes, and stage ordering (the
/// chain must open with INGEST or NORMALIZE).
pub fn verify_chain(events: &[AuditEvent]) -> ChainVerification {
    let mut prev_hash = GENESIS_HASH.to_string();
    for (idx, event) in events.iter().enumerate() {
        if idx == 0 && !matches!(event.stage, Stage::Ingest | Stage::Normalize) {
            return broken(idx, format!("chain starts with {}", event.stage));
        }
        if event.prev_event_hash != prev_hash {
            return broken(
                idx,
                format!(
                    "prev_event_hash mismatch: {} != {}",
                    event.prev_event_hash, prev_hash
                ),
            );
        }
        match event_hash(event) {
            Ok(expected) if expected == event.event_hash => {}
            Ok(expected) => {
                return broken(
                    idx,
                    format!("event_hash mismatch: {} != {}", event.event_hash, expected),
                );
            }
            Err(e) => return broken(idx, e.to_string()),
        }
        prev_hash = event.event_hash.clone();
    }
    ChainVerification {
        events_checked: events.len(),
        first_error: None,
    }
}

fn broken(idx: usize, reason: String) -> ChainVerification {
    ChainVerification {
        events_checked: idx,
        first_error: Some((idx, reason)),
    }
}

/// Durable audit store interface. Appends are atomic: an event is only
/// acknowledged once persisted.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError>;
    async fn read_chain(
        &self,
        message_id: &str,
        run_id: &str,
    ) -> Result<Vec<AuditEvent>, AuditError>;
}

/// The audit log: seals drafts into chained events and appends them.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    /// Per-chain tail hashes; acts as the chain lease for this process.
    tails: Mutex<HashMap<(String, String), String>>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            tails: Mutex::new(HashMap::new()),
        }
    }

    /// Seals and appends a draft, linking it to the current chain tail.
    /// Holding the tail lock across read-then-write keeps the chain linear
    /// under concurrent workers.
    pub async fn append(&self, draft: AuditEventDraft) -> Result<AuditEvent, AuditError> {
        let key = (draft.message_id.clone(), draft.run_id.clone());
        let mut tails = self.tails.lock().await;

        let prev_hash = match tails.get(&key) {
            Some(hash) => hash.clone(),
            None => {
                let chain = self
                    .store
                    .read_chain(&draft.message_id, &draft.run_id)
                    .await
                    .unwrap_or_default();
                chain
                    .last()
                    .map(|e| e.event_hash.clone())
                    .unwrap_or_else(|| GENESIS_HASH.to_string())
            }
        };

        let mut event = AuditEvent {
            event_id: event_id(&draft),
            message_id: draft.message_id,
            run_id: draft.run_id,
            stage: draft.stage,
            actor_type: draft.actor_type,
            actor_id: draft.actor_id,
            created_at: draft.created_at,
            input_ref: draft.input_ref,
            output_ref: draft.output_ref,
            decision_hash: draft.decision_hash,
            config_ref: draft.config_ref,
            rules_ref: draft.rules_ref,
            model_ref: draft.model_ref,
            evidence: draft.evidence,
            prev_event_hash: prev_hash,
            event_hash: String::new(),
        };
        event.event_hash =
            event_hash(&event).map_err(|e| AuditError::AppendRejected(e.to_string()))?;

        self.store.append(event.clone()).await?;
        tails.insert(key, event.event_hash.clone());

        tracing::debug!(
            message_id = %event.message_id,
            run_id = %event.run_id,
            stage = %event.stage,
            event_id = %event.event_id,
            "Audit event appended"
        );
        Ok(event)
    }

    /// Reads and verifies the chain for one run.
    pub async fn verify(
        &self,
        message_id: &str,
        run_id: &str,
    ) -> Result<ChainVerification, AuditError> {
        let chain = self.store.read_chain(message_id, run_id).await?;
        if chain.is_empty() {
            return Err(AuditError::ChainNotFound {
                message_id: message_id.to_string(),
                run_id: run_id.to_string(),
            });
        }
        Ok(verify_chain(&chain))
    }
}

/// In-memory audit store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryAuditStore {
    chains: Mutex<HashMap<(String, String), Vec<AuditEvent>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        let key = (event.message_id.clone(), event.run_id.clone());
        self.chains.lock().await.entry(key).or_default().push(event);
        Ok(())
    }

    async fn read_chain(
        &self,
        message_id: &str,
        run_id: &str,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .chains
            .lock()
            .await
            .get(&(message_id.to_string(), run_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
