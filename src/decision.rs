//! Timestamp-free decision hashing.
//!
//! A decision hash is the SHA-256 of the RFC 8785 canonical JSON of a
//! stage's canonical decision input. The input binds the message
//! fingerprint, the sealed config, the ruleset (for routing) and the
//! decision itself, and nothing volatile: no wall clock, no run id, no
//! worker identity. [`assert_decision_input_clean`] enforces the exclusion
//! list structurally before hashing.

use serde_json::{json, Value};

use crate::artifacts::{
    ClassificationResult, EvidenceSpan, IdentityResolutionResult, RoutingDecision, RulesetRef,
};
use crate::canonical::jcs;
use crate::config::{ConfigRef, ConfigSnapshot};
use crate::error::{Result, ValidationError};
use crate::registry::Stage;

/// Field names that must never appear in a canonical decision input.
const FORBIDDEN_FIELDS: &[&str] = &[
    "run_id",
    "event_id",
    "hostname",
    "worker_id",
    "random_seed",
];

/// Rejects decision inputs containing volatile members: any forbidden name
/// or any key ending in `_at` (wall-clock timestamps).
pub fn assert_decision_input_clean(value: &Value) -> std::result::Result<(), ValidationError> {
    walk(value, "$")
}

fn walk(value: &Value, path: &str) -> std::result::Result<(), ValidationError> {
    match value {
        Value::Object(obj) => {
            for (key, val) in obj {
                if FORBIDDEN_FIELDS.contains(&key.as_str()) || key.ends_with("_at") {
                    return Err(ValidationError::Rejected {
                        schema_id: "decision-input".into(),
                        reason: format!("volatile field {path}.{key} in decision input"),
                    });
                }
                walk(val, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Hashes a canonical decision input after checking the exclusion list.
pub fn decision_hash(input: &Value) -> Result<String> {
    assert_decision_input_clean(input)?;
    Ok(jcs::canonical_sha256(input)?)
}

fn evidence_hashes(evidence: &[EvidenceSpan]) -> Value {
    Value::Array(
        evidence
            .iter()
            .map(|e| {
                json!({
                    "source": e.source,
                    "start": e.start,
                    "end": e.end,
                    "snippet_sha256": e.snippet_sha256,
                })
            })
            .collect(),
    )
}

/// Common header of every canonical decision input.
fn header(
    config: &ConfigSnapshot,
    config_ref: &ConfigRef,
    stage: Stage,
    message_fingerprint: &str,
    raw_mime_sha256: &str,
) -> Value {
    json!({
        "system_id": config.system_id,
        "spec_semver": config.spec_semver,
        "stage": stage,
        "message_fingerprint": message_fingerprint,
        "raw_mime_sha256": raw_mime_sha256,
        "config_ref": {
            "path": config_ref.path,
            "sha256": config_ref.sha256,
        },
        "determinism_mode": config.determinism_mode,
    })
}

/// Canonical decision input for the IDENTITY stage.
pub fn identity_decision_input(
    config: &ConfigSnapshot,
    config_ref: &ConfigRef,
    message_fingerprint: &str,
    raw_mime_sha256: &str,
    result: &IdentityResolutionResult,
) -> Value {
    let mut input = header(config, config_ref, Stage::Identity, message_fingerprint, raw_mime_sha256);
    let selected = result.selected.as_ref().map(|c| {
        json!({
            "entity_type": c.entity_type,
            "entity_id": c.entity_id,
            "score": c.score,
        })
    });
    let top_k: Vec<Value> = result
        .top_k
        .iter()
        .map(|c| {
            json!({
                "rank": c.rank,
                "entity_type": c.entity_type,
                "entity_id": c.entity_id,
                "score": c.score,
                "signals": c.signals.iter().map(|s| json!({
                    "name": s.name,
                    "value": s.value,
                    "weight": s.weight,
                })).collect::<Vec<_>>(),
                "evidence": evidence_hashes(&c.evidence),
            })
        })
        .collect();
    input["decision"] = json!({
        "status": result.status,
        "selected": selected,
        "top_k": top_k,
        "thresholds": {
            "confirmed_min_score": result.thresholds.confirmed_min_score,
            "confirmed_min_margin": result.thresholds.confirmed_min_margin,
            "probable_min_score": result.thresholds.probable_min_score,
            "probable_min_margin": result.thresholds.probable_min_margin,
        },
    });
    input
}

/// Canonical decision input for the CLASSIFY stage.
pub fn classify_decision_input(
    config: &ConfigSnapshot,
    config_ref: &ConfigRef,
    message_fingerprint: &str,
    raw_mime_sha256: &str,
    result: &ClassificationResult,
) -> Value {
    let mut input = header(config, config_ref, Stage::Classify, message_fingerprint, raw_mime_sha256);
    let llm = &config.classification.llm;
    input["llm"] = match &result.model_ref {
        Some(model_ref) => json!({
            "enabled": true,
            "provider": model_ref.provider,
            "model_id": model_ref.model_id,
            "prompt_sha256": model_ref.prompt_sha256,
        }),
        None => json!({ "enabled": llm.enabled && !config.incident.disable_llm }),
    };
    input["decision"] = json!({
        "intents": result.intents.iter().map(|i| json!({
            "label": i.label,
            "confidence": i.confidence,
            "evidence": evidence_hashes(&i.evidence),
        })).collect::<Vec<_>>(),
        "primary_intent": {
            "label": result.primary_intent.label,
            "confidence": result.primary_intent.confidence,
        },
        "product_line": result.product_line.label,
        "urgency": result.urgency.label,
        "risk_flags": result.risk_flags.iter().map(|r| json!({
            "label": r.label,
            "confidence": r.confidence,
            "evidence": evidence_hashes(&r.evidence),
        })).collect::<Vec<_>>(),
        "rules_version": result.rules_version,
    });
    input
}

/// Canonical decision input for the ROUTE stage.
pub fn route_decision_input(
    config: &ConfigSnapshot,
    config_ref: &ConfigRef,
    message_fingerprint: &str,
    raw_mime_sha256: &str,
    rules_ref: &RulesetRef,
    identity: &IdentityResolutionResult,
    classification: &ClassificationResult,
    decision: &RoutingDecision,
) -> Value {
    let mut input = header(config, config_ref, Stage::Route, message_fingerprint, raw_mime_sha256);
    let mut risk_flags: Vec<&'static str> = classification
        .risk_flags
        .iter()
        .map(|r| r.label.as_str())
        .collect();
    risk_flags.sort_unstable();
    risk_flags.dedup();
    input["rules_ref"] = json!({
        "path": rules_ref.path,
        "sha256": rules_ref.sha256,
        "version": rules_ref.version,
    });
    input["input"] = json!({
        "identity_status": identity.status,
        "primary_intent": classification.primary_intent.label,
        "product_line": classification.product_line.label,
        "urgency": classification.urgency.label,
        "risk_flags": risk_flags,
    });
    input["decision"] = json!({
        "queue_id": decision.queue_id,
        "sla_id": decision.sla_id,
        "priority": decision.priority,
        "actions": decision.actions,
        "rule_id": decision.rule_id,
        "fail_closed": decision.fail_closed,
        "fail_closed_reason": decision.fail_closed_reason,
    });
    input
}
