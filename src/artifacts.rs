//! Stage artifacts and artifact references.
//!
//! Every artifact is schema-validated before persistence, content-addressed
//! by SHA-256 and referenced by `{schema_id, uri, sha256}`. Components hold
//! references, never mutable artifacts; new versions replace references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::jcs;
use crate::config::{IbanStoreMode, LlmParams};
use crate::error::ValidationError;
use crate::registry::{
    Action, AvStatus, CandidateType, EntityType, EvidenceSource, IdentityStatus, InferencePurpose,
    Intent, ProductLine, Queue, RiskFlag, Sla, Urgency,
};

pub const SCHEMA_NORMALIZED_MESSAGE: &str = "urn:ire:schema:normalized-message:1.0.0";
pub const SCHEMA_ATTACHMENT: &str = "urn:ire:schema:attachment-artifact:1.0.0";
pub const SCHEMA_IDENTITY_RESULT: &str = "urn:ire:schema:identity-resolution-result:1.0.0";
pub const SCHEMA_CLASSIFICATION_RESULT: &str = "urn:ire:schema:classification-result:1.0.0";
pub const SCHEMA_EXTRACTION_RESULT: &str = "urn:ire:schema:extraction-result:1.0.0";
pub const SCHEMA_ROUTING_DECISION: &str = "urn:ire:schema:routing-decision:1.0.0";
pub const SCHEMA_AUDIT_EVENT: &str = "urn:ire:schema:audit-event:1.0.0";
pub const SCHEMA_CORRECTION_RECORD: &str = "urn:ire:schema:correction-record:1.0.0";
pub const SCHEMA_LLM_INFERENCE: &str = "urn:ire:schema:llm-inference:1.0.0";
pub const SCHEMA_RAW_MIME: &str = "urn:ire:schema:raw-mime:1.0.0";

/// Maximum evidence snippet length carried in artifacts and audit events.
pub const MAX_SNIPPET_BYTES: usize = 200;

/// Content-addressed handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub schema_id: String,
    pub uri: String,
    pub sha256: String,
}

impl ArtifactRef {
    pub fn new(
        schema_id: impl Into<String>,
        uri: impl Into<String>,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            schema_id: schema_id.into(),
            uri: uri.into(),
            sha256: sha256.into(),
        }
    }
}

/// A redacted evidence span pointing into canonical text.
///
/// `snippet_redacted` is a verbatim substring of the canonical source text
/// at `[start, end)`, truncated to [`MAX_SNIPPET_BYTES`]; `snippet_sha256`
/// hashes the untruncated span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub source: EvidenceSource,
    pub start: usize,
    pub end: usize,
    pub snippet_redacted: String,
    pub snippet_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl EvidenceSpan {
    /// Builds a span over `text[start..end]`, computing the snippet hash.
    pub fn new(source: EvidenceSource, text: &str, start: usize, end: usize) -> Self {
        let snippet = &text[start..end.min(text.len())];
        let mut redacted = snippet.to_string();
        if redacted.len() > MAX_SNIPPET_BYTES {
            let mut cut = MAX_SNIPPET_BYTES;
            while !redacted.is_char_boundary(cut) {
                cut -= 1;
            }
            redacted.truncate(cut);
        }
        Self {
            source,
            start,
            end,
            snippet_redacted: redacted,
            snippet_sha256: jcs::snippet_sha256(snippet),
            attachment_id: None,
        }
    }

    /// Span over the first word of `text`; fallback evidence when no
    /// keyword hit is available.
    pub fn first_word(source: EvidenceSource, text: &str) -> Self {
        let end = text
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        Self::new(source, text, 0, end)
    }

    /// Verifies the span against its canonical source text: offsets must be
    /// in bounds and the stored hash must match the text at those offsets.
    pub fn verify(&self, text: &str) -> Result<(), ValidationError> {
        if self.start > self.end || self.end > text.len() {
            return Err(ValidationError::EvidenceMismatch {
                reason: format!("offsets {}..{} out of bounds", self.start, self.end),
            });
        }
        if !text.is_char_boundary(self.start) || !text.is_char_boundary(self.end) {
            return Err(ValidationError::EvidenceMismatch {
                reason: "offsets split a UTF-8 character".into(),
            });
        }
        let actual = jcs::snippet_sha256(&text[self.start..self.end]);
        if actual != self.snippet_sha256 {
            return Err(ValidationError::EvidenceMismatch {
                reason: "snippet_sha256 does not match text at stated offsets".into(),
            });
        }
        Ok(())
    }
}

/// A label with confidence and supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labeled<T> {
    pub label: T,
    pub confidence: f64,
    pub evidence: Vec<EvidenceSpan>,
}

impl<T> Labeled<T> {
    pub fn new(label: T, confidence: f64, evidence: Vec<EvidenceSpan>) -> Self {
        Self {
            label,
            confidence,
            evidence,
        }
    }
}

/// Threading headers preserved from the wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadKeys {
    pub internet_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub conversation_id: Option<String>,
}

/// Canonical form of one inbound message. Immutable after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub ingestion_source: String,
    pub ingested_at: DateTime<Utc>,
    pub raw_mime_uri: String,
    pub raw_mime_sha256: String,
    pub from_email: String,
    pub from_display_name: Option<String>,
    pub reply_to_email: Option<String>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    /// Original header/body text, preserved for operator display.
    pub subject: String,
    pub body_text: String,
    /// Canonical forms every evidence offset indexes into.
    pub subject_c14n: String,
    pub body_text_c14n: String,
    pub language: String,
    pub thread_keys: ThreadKeys,
    pub attachment_ids: Vec<String>,
    pub message_fingerprint: String,
}

/// Candidate document type detected on an attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocTypeCandidate {
    pub doc_type_label: String,
    pub confidence: f64,
    pub evidence: Vec<EvidenceSpan>,
}

/// One scanned attachment. The AV status is stamped before any downstream
/// stage may read the extracted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentArtifact {
    pub attachment_id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: usize,
    pub sha256: String,
    pub av_status: AvStatus,
    pub scanner_version: String,
    pub extracted_text_uri: Option<String>,
    pub extracted_text_sha256: Option<String>,
    pub ocr_applied: bool,
    pub ocr_confidence: Option<f64>,
    pub doc_type_candidates: Vec<DocTypeCandidate>,
    pub created_at: DateTime<Utc>,
}

/// One identity signal contributing to a candidate's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub weight: f64,
    pub strength: crate::config::SignalStrength,
}

/// A scored identity candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCandidate {
    pub rank: usize,
    pub entity_type: CandidateType,
    pub entity_id: String,
    pub score: f64,
    pub signals: Vec<Signal>,
    pub evidence: Vec<EvidenceSpan>,
}

impl IdentityCandidate {
    pub fn has_hard_signal(&self) -> bool {
        self.signals
            .iter()
            .any(|s| s.strength == crate::config::SignalStrength::Hard)
    }

    pub fn has_medium_signal(&self) -> bool {
        self.signals
            .iter()
            .any(|s| s.strength == crate::config::SignalStrength::Medium)
    }
}

/// Threshold values in effect when an identity decision was made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsOut {
    pub confirmed_min_score: f64,
    pub confirmed_min_margin: f64,
    pub probable_min_score: f64,
    pub probable_min_margin: f64,
}

/// Identity resolution output. Written once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResolutionResult {
    pub message_id: String,
    pub run_id: String,
    pub status: IdentityStatus,
    pub selected: Option<IdentityCandidate>,
    pub top_k: Vec<IdentityCandidate>,
    pub thresholds: ThresholdsOut,
    pub status_reason: Option<String>,
    pub decision_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Reference to the model and prompt that produced an LLM-derived result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
    pub prompt_sha256: String,
}

/// Classification output. Written once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: String,
    pub run_id: String,
    pub intents: Vec<Labeled<Intent>>,
    pub primary_intent: Labeled<Intent>,
    pub product_line: Labeled<ProductLine>,
    pub urgency: Labeled<Urgency>,
    pub risk_flags: Vec<Labeled<RiskFlag>>,
    pub rules_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<ModelRef>,
    pub decision_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ClassificationResult {
    pub fn risk_flag_labels(&self) -> Vec<RiskFlag> {
        self.risk_flags.iter().map(|r| r.label).collect()
    }

    pub fn has_risk_flag(&self, flag: RiskFlag) -> bool {
        self.risk_flags.iter().any(|r| r.label == flag)
    }
}

/// One extracted entity, stored redacted when sensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub entity_type: EntityType,
    /// Full value; `None` when the store mode is hash-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub value_redacted: String,
    pub value_sha256: String,
    pub store_mode: IbanStoreMode,
    pub confidence: f64,
    /// Pattern-valid but unknown to the directory.
    #[serde(default)]
    pub directory_miss: bool,
    pub provenance: EvidenceSpan,
}

/// Extraction output. Written once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub message_id: String,
    pub run_id: String,
    pub entities: Vec<ExtractedEntity>,
    pub created_at: DateTime<Utc>,
}

/// Reference to the routing ruleset a decision was evaluated under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetRef {
    pub path: String,
    pub sha256: String,
    pub version: String,
}

/// The routing decision. Written once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub message_id: String,
    pub run_id: String,
    pub queue_id: Queue,
    pub sla_id: Sla,
    pub priority: i32,
    pub actions: Vec<Action>,
    pub rule_id: String,
    pub ruleset_ref: RulesetRef,
    pub fail_closed: bool,
    pub fail_closed_reason: Option<String>,
    pub decision_hash: String,
    pub created_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Schema validation beyond what the types enforce: action set must be
    /// non-empty and duplicate-free, and a fail-closed decision must name
    /// its reason.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.actions.is_empty() {
            return Err(ValidationError::MissingField {
                schema_id: SCHEMA_ROUTING_DECISION.into(),
                field: "actions".into(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for action in &self.actions {
            if !seen.insert(*action) {
                return Err(ValidationError::Rejected {
                    schema_id: SCHEMA_ROUTING_DECISION.into(),
                    reason: format!("duplicate action {action}"),
                });
            }
        }
        if self.fail_closed && self.fail_closed_reason.is_none() {
            return Err(ValidationError::MissingField {
                schema_id: SCHEMA_ROUTING_DECISION.into(),
                field: "fail_closed_reason".into(),
            });
        }
        if self.actions.contains(&Action::BlockCaseCreate)
            && self.actions.contains(&Action::CreateCase)
        {
            return Err(ValidationError::Rejected {
                schema_id: SCHEMA_ROUTING_DECISION.into(),
                reason: "BLOCK_CASE_CREATE and CREATE_CASE are mutually exclusive".into(),
            });
        }
        Ok(())
    }
}

/// Immutable record of one LLM inference, the unit the cache stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmInferenceArtifact {
    pub purpose: InferencePurpose,
    pub model_id: String,
    pub params: LlmParams,
    pub prompt_sha256: String,
    pub input_digest_sha256: String,
    pub output_json: serde_json::Value,
    pub output_sha256: String,
}

impl LlmInferenceArtifact {
    pub fn new(
        purpose: InferencePurpose,
        model_id: impl Into<String>,
        params: LlmParams,
        prompt_sha256: impl Into<String>,
        input_digest_sha256: impl Into<String>,
        output_json: serde_json::Value,
    ) -> Result<Self, ValidationError> {
        let output_sha256 = jcs::canonical_sha256(&output_json)
            .map_err(|e| ValidationError::Rejected {
                schema_id: SCHEMA_LLM_INFERENCE.into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            purpose,
            model_id: model_id.into(),
            params,
            prompt_sha256: prompt_sha256.into(),
            input_digest_sha256: input_digest_sha256.into(),
            output_json,
            output_sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_span_hashes_verbatim_substring() {
        let text = "unfall gestern a2, polizzennr 12-3456789";
        let span = EvidenceSpan::new(EvidenceSource::Body, text, 0, 6);
        assert_eq!(span.snippet_redacted, "unfall");
        span.verify(text).unwrap();
    }

    #[test]
    fn evidence_verify_rejects_wrong_offsets() {
        let text = "schaden melden bitte";
        let mut span = EvidenceSpan::new(EvidenceSource::Body, text, 0, 7);
        span.start = 8;
        span.end = 14;
        assert!(span.verify(text).is_err());
    }

    #[test]
    fn evidence_verify_rejects_out_of_bounds() {
        let text = "kurz";
        let mut span = EvidenceSpan::new(EvidenceSource::Body, text, 0, 4);
        span.end = 99;
        assert!(span.verify(text).is_err());
    }

    #[test]
    fn evidence_snippet_truncates_to_limit() {
        let text = "x".repeat(500);
        let span = EvidenceSpan::new(EvidenceSource::Body, &text, 0, 500);
        assert_eq!(span.snippet_redacted.len(), MAX_SNIPPET_BYTES);
        // The hash covers the full span, not the truncated display form.
        assert_eq!(span.snippet_sha256, jcs::snippet_sha256(&text));
    }

    #[test]
    fn first_word_span() {
        let span = EvidenceSpan::first_word(EvidenceSource::Subject, "nachreichung zum schaden");
        assert_eq!(span.snippet_redacted, "nachreichung");
    }

    #[test]
    fn routing_decision_validation_catches_duplicates() {
        let decision = RoutingDecision {
            message_id: "m1".into(),
            run_id: "r1".into(),
            queue_id: Queue::ClaimsAuto,
            sla_id: Sla::FourHours,
            priority: 50,
            actions: vec![Action::CreateCase, Action::CreateCase],
            rule_id: "R1".into(),
            ruleset_ref: RulesetRef {
                path: "routes".into(),
                sha256: "sha256:00".into(),
                version: "v1".into(),
            },
            fail_closed: false,
            fail_closed_reason: None,
            decision_hash: "sha256:00".into(),
            created_at: Utc::now(),
        };
        assert!(decision.validate().is_err());
    }

    #[test]
    fn routing_decision_fail_closed_requires_reason() {
        let decision = RoutingDecision {
            message_id: "m1".into(),
            run_id: "r1".into(),
            queue_id: Queue::IntakeReviewGeneral,
            sla_id: Sla::OneBusinessDay,
            priority: 0,
            actions: vec![Action::AttachOriginalEmail],
            rule_id: "ROUTE_FALLBACK".into(),
            ruleset_ref: RulesetRef {
                path: "routes".into(),
                sha256: "sha256:00".into(),
                version: "v1".into(),
            },
            fail_closed: true,
            fail_closed_reason: None,
            decision_hash: "sha256:00".into(),
            created_at: Utc::now(),
        };
        assert!(decision.validate().is_err());
    }

    #[test]
    fn block_and_create_are_exclusive() {
        let decision = RoutingDecision {
            message_id: "m1".into(),
            run_id: "r1".into(),
            queue_id: Queue::SecurityReview,
            sla_id: Sla::OneHour,
            priority: 100,
            actions: vec![Action::BlockCaseCreate, Action::CreateCase],
            rule_id: "RISK_OVERRIDE_MALWARE".into(),
            ruleset_ref: RulesetRef {
                path: "routes".into(),
                sha256: "sha256:00".into(),
                version: "v1".into(),
            },
            fail_closed: true,
            fail_closed_reason: Some("security_override".into()),
            decision_hash: "sha256:00".into(),
            created_at: Utc::now(),
        };
        assert!(decision.validate().is_err());
    }

    #[test]
    fn llm_inference_artifact_hashes_output() {
        let artifact = LlmInferenceArtifact::new(
            InferencePurpose::Classify,
            "het-7b",
            LlmParams::default(),
            "sha256:aa",
            "sha256:bb",
            serde_json::json!({"intents": []}),
        )
        .unwrap();
        assert!(artifact.output_sha256.starts_with("sha256:"));
    }

    #[test]
    fn candidate_signal_strength_helpers() {
        let candidate = IdentityCandidate {
            rank: 1,
            entity_type: CandidateType::Policy,
            entity_id: "POL-1".into(),
            score: 0.9,
            signals: vec![Signal {
                name: "SIG_POLICY_NUMBER_LOOKUP_MATCH".into(),
                value: None,
                weight: 0.85,
                strength: crate::config::SignalStrength::Hard,
            }],
            evidence: vec![],
        };
        assert!(candidate.has_hard_signal());
        assert!(!candidate.has_medium_signal());
    }
}
