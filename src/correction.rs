//! Reviewer correction records.
//!
//! Corrections never mutate earlier artifacts. A reviewer submits an
//! append-only record referencing the affected artifacts by
//! `(schema_id, sha256)`; a later reprocess run may consume it offline.
//! The HITL audit event's `output_ref` points at the stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifacts::ArtifactRef;
use crate::canonical::jcs;
use crate::error::ValidationError;

/// One field-level correction, JSON-patch style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPatch {
    /// Path into the corrected artifact, e.g. `/primary_intent/label`.
    pub path: String,
    /// The corrected value.
    pub value: serde_json::Value,
    /// Optional reviewer note for this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// An append-only correction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub correction_id: String,
    pub message_id: String,
    pub run_id: String,
    pub review_item_id: Option<String>,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
    pub target_artifact_refs: Vec<ArtifactRef>,
    pub patch: Vec<CorrectionPatch>,
}

impl CorrectionRecord {
    /// Builds a record with a deterministic id derived from its content:
    /// re-submitting the same correction yields the same id.
    pub fn new(
        message_id: impl Into<String>,
        run_id: impl Into<String>,
        actor_id: impl Into<String>,
        target_artifact_refs: Vec<ArtifactRef>,
        patch: Vec<CorrectionPatch>,
    ) -> Result<Self, ValidationError> {
        let message_id = message_id.into();
        let run_id = run_id.into();
        let actor_id = actor_id.into();
        let patch_value = serde_json::to_value(&patch)?;
        let patch_sha = jcs::canonical_sha256(&patch_value).map_err(|e| {
            ValidationError::Rejected {
                schema_id: crate::artifacts::SCHEMA_CORRECTION_RECORD.into(),
                reason: e.to_string(),
            }
        })?;
        let name = format!("correction:{message_id}:{run_id}:{actor_id}:{patch_sha}");
        Ok(Self {
            correction_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string(),
            message_id,
            run_id,
            review_item_id: None,
            actor_id,
            created_at: Utc::now(),
            target_artifact_refs,
            patch,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.patch.is_empty() {
            return Err(ValidationError::MissingField {
                schema_id: crate::artifacts::SCHEMA_CORRECTION_RECORD.into(),
                field: "patch".into(),
            });
        }
        if self.target_artifact_refs.is_empty() {
            return Err(ValidationError::MissingField {
                schema_id: crate::artifacts::SCHEMA_CORRECTION_RECORD.into(),
                field: "target_artifact_refs".into(),
            });
        }
        Ok(())
    }
}

/// Submits a reviewer correction: appends it to the sink and writes the
/// HITL audit event whose `output_ref` points at the stored record. The
/// corrected artifact is the event's input; nothing it references is
/// mutated.
pub async fn submit_correction(
    sink: &dyn CorrectionSink,
    audit: &crate::audit::AuditLog,
    record: CorrectionRecord,
) -> Result<ArtifactRef, crate::error::Error> {
    let message_id = record.message_id.clone();
    let run_id = record.run_id.clone();
    let actor_id = record.actor_id.clone();
    let reviewed_ref = record
        .target_artifact_refs
        .first()
        .cloned()
        .ok_or_else(|| ValidationError::MissingField {
            schema_id: crate::artifacts::SCHEMA_CORRECTION_RECORD.into(),
            field: "target_artifact_refs".into(),
        })?;
    let record_ref = sink.append(record).await?;

    let mut draft = crate::audit::AuditEventDraft::new(
        message_id,
        run_id,
        crate::registry::Stage::Hitl,
        reviewed_ref,
        record_ref.clone(),
    );
    draft.actor_type = crate::audit::ActorType::Reviewer;
    draft.actor_id = Some(actor_id);
    audit.append(draft).await?;
    Ok(record_ref)
}

/// Append-only correction store.
#[async_trait::async_trait]
pub trait CorrectionSink: Send + Sync {
    /// Appends a record; returns the stored record's reference for the
    /// HITL audit event. Duplicate submissions return the existing ref.
    async fn append(&self, record: CorrectionRecord) -> Result<ArtifactRef, ValidationError>;

    async fn list(&self, message_id: &str) -> Vec<CorrectionRecord>;
}

/// In-memory correction sink.
#[derive(Default)]
pub struct MemoryCorrectionSink {
    records: Mutex<Vec<CorrectionRecord>>,
}

impl MemoryCorrectionSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CorrectionSink for MemoryCorrectionSink {
    async fn append(&self, record: CorrectionRecord) -> Result<ArtifactRef, ValidationError> {
        record.validate()?;
        let value = serde_json::to_value(&record)?;
        let sha256 = jcs::canonical_sha256(&value).map_err(|e| ValidationError::Rejected {
            schema_id: crate::artifacts::SCHEMA_CORRECTION_RECORD.into(),
            reason: e.to_string(),
        })?;
        let artifact_ref = ArtifactRef::new(
            crate::artifacts::SCHEMA_CORRECTION_RECORD,
            format!("correction://{}", record.correction_id),
            sha256,
        );
        let mut records = self.records.lock().await;
        if !records
            .iter()
            .any(|r| r.correction_id == record.correction_id)
        {
            records.push(record);
        }
        Ok(artifact_ref)
    }

    async fn list(&self, message_id: &str) -> Vec<CorrectionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> ArtifactRef {
        ArtifactRef::new(
            crate::artifacts::SCHEMA_CLASSIFICATION_RESULT,
            "artifact://msg-1/CLASSIFY/aa",
            "sha256:aa",
        )
    }

    fn patch() -> Vec<CorrectionPatch> {
        vec![CorrectionPatch {
            path: "/primary_intent/label".into(),
            value: json!("INTENT_COMPLAINT"),
            note: Some("customer is clearly complaining".into()),
        }]
    }

    #[test]
    fn correction_ids_are_deterministic() {
        let a = CorrectionRecord::new("m", "r", "reviewer-1", vec![target()], patch()).unwrap();
        let b = CorrectionRecord::new("m", "r", "reviewer-1", vec![target()], patch()).unwrap();
        assert_eq!(a.correction_id, b.correction_id);

        let other = CorrectionRecord::new("m", "r", "reviewer-2", vec![target()], patch()).unwrap();
        assert_ne!(a.correction_id, other.correction_id);
    }

    #[test]
    fn empty_patch_is_rejected() {
        let record = CorrectionRecord::new("m", "r", "reviewer-1", vec![target()], vec![]).unwrap();
        assert!(record.validate().is_err());
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let sink = MemoryCorrectionSink::new();
        let record = CorrectionRecord::new("m", "r", "reviewer-1", vec![target()], patch()).unwrap();
        sink.append(record.clone()).await.unwrap();
        sink.append(record).await.unwrap();
        assert_eq!(sink.list("m").await.len(), 1);
    }

    #[tokio::test]
    async fn submit_links_record_into_audit_chain() {
        use crate::audit::{AuditLog, AuditStore, MemoryAuditStore};
        use std::sync::Arc;

        let store = Arc::new(MemoryAuditStore::new());
        let audit = AuditLog::new(store.clone());
        let sink = MemoryCorrectionSink::new();

        let record =
            CorrectionRecord::new("m", "r", "reviewer-1", vec![target()], patch()).unwrap();
        let record_ref = submit_correction(&sink, &audit, record).await.unwrap();

        let chain = store.read_chain("m", "r").await.unwrap();
        assert_eq!(chain.len(), 1);
        let event = &chain[0];
        assert_eq!(event.stage, crate::registry::Stage::Hitl);
        assert_eq!(event.output_ref, record_ref);
        assert_eq!(event.actor_type, crate::audit::ActorType::Reviewer);
        assert_eq!(event.actor_id.as_deref(), Some("reviewer-1"));
    }

    #[tokio::test]
    async fn list_filters_by_message() {
        let sink = MemoryCorrectionSink::new();
        let record = CorrectionRecord::new("m1", "r", "reviewer-1", vec![target()], patch()).unwrap();
        sink.append(record).await.unwrap();
        assert!(sink.list("m2").await.is_empty());
    }
}
