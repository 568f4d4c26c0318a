//! Strict-JSON output contracts for LLM calls.
//!
//! The model must answer with exactly the documented object shape; unknown
//! fields, missing fields or out-of-range confidences are contract
//! violations, which the classify stage treats as one failed attempt of
//! its retry budget.

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::strip_code_fences;

/// Contract name/version pinned into prompts and error messages.
pub const CLASSIFY_CONTRACT: &str = "ClassifyLlmOutput:1.0.0";
pub const EXTRACT_CONTRACT: &str = "ExtractLlmOutput:1.0.0";

/// Maximum characters per evidence snippet the model may return.
pub const MAX_EVIDENCE_SNIPPET_CHARS: usize = 200;

/// One labeled finding with free-text evidence snippets. Labels are plain
/// strings at this layer; canonical-registry validation happens in the
/// acceptance gate, where a bad label is a gate rejection rather than a
/// parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmLabeled {
    pub label: String,
    pub confidence: f64,
    pub evidence_snippets: Vec<String>,
}

/// Expected classify output shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifyLlmOutput {
    pub intents: Vec<LlmLabeled>,
    pub primary_intent: String,
    pub product_line: LlmLabeled,
    pub urgency: LlmLabeled,
    pub risk_flags: Vec<LlmLabeled>,
}

/// One extracted entity proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmEntity {
    pub entity_type: String,
    pub value_redacted: String,
    pub confidence: f64,
    pub evidence_snippets: Vec<String>,
}

/// Expected extract output shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractLlmOutput {
    pub entities: Vec<LlmEntity>,
}

fn check_labeled(item: &LlmLabeled, contract: &str, path: &str) -> Result<(), LlmError> {
    if item.label.trim().is_empty() {
        return Err(LlmError::ContractViolation {
            contract: contract.into(),
            reason: format!("{path}.label is empty"),
        });
    }
    if !(0.0..=1.0).contains(&item.confidence) {
        return Err(LlmError::ContractViolation {
            contract: contract.into(),
            reason: format!("{path}.confidence {} out of range", item.confidence),
        });
    }
    if item.evidence_snippets.is_empty() {
        return Err(LlmError::ContractViolation {
            contract: contract.into(),
            reason: format!("{path}.evidence_snippets is empty"),
        });
    }
    for (i, snippet) in item.evidence_snippets.iter().enumerate() {
        if snippet.trim().is_empty() || snippet.chars().count() > MAX_EVIDENCE_SNIPPET_CHARS {
            return Err(LlmError::ContractViolation {
                contract: contract.into(),
                reason: format!("{path}.evidence_snippets[{i}] empty or over limit"),
            });
        }
    }
    Ok(())
}

/// Parses and structurally validates a classify response.
pub fn parse_classify_output(raw: &str) -> Result<ClassifyLlmOutput, LlmError> {
    let cleaned = strip_code_fences(raw);
    let output: ClassifyLlmOutput =
        serde_json::from_str(cleaned).map_err(|e| LlmError::InvalidJson(e.to_string()))?;
    if output.intents.is_empty() {
        return Err(LlmError::ContractViolation {
            contract: CLASSIFY_CONTRACT.into(),
            reason: "intents must not be empty".into(),
        });
    }
    for (i, intent) in output.intents.iter().enumerate() {
        check_labeled(intent, CLASSIFY_CONTRACT, &format!("intents[{i}]"))?;
    }
    check_labeled(&output.product_line, CLASSIFY_CONTRACT, "product_line")?;
    check_labeled(&output.urgency, CLASSIFY_CONTRACT, "urgency")?;
    for (i, flag) in output.risk_flags.iter().enumerate() {
        check_labeled(flag, CLASSIFY_CONTRACT, &format!("risk_flags[{i}]"))?;
    }
    Ok(output)
}

/// Parses and structurally validates an extract response.
pub fn parse_extract_output(raw: &str) -> Result<ExtractLlmOutput, LlmError> {
    let cleaned = strip_code_fences(raw);
    let output: ExtractLlmOutput =
        serde_json::from_str(cleaned).map_err(|e| LlmError::InvalidJson(e.to_string()))?;
    for (i, entity) in output.entities.iter().enumerate() {
        if entity.entity_type.trim().is_empty() {
            return Err(LlmError::ContractViolation {
                contract: EXTRACT_CONTRACT.into(),
                reason: format!("entities[{i}].entity_type is empty"),
            });
        }
        if !(0.0..=1.0).contains(&entity.confidence) {
            return Err(LlmError::ContractViolation {
                contract: EXTRACT_CONTRACT.into(),
                reason: format!("entities[{i}].confidence out of range"),
            });
        }
        if entity.value_redacted.chars().count() > MAX_EVIDENCE_SNIPPET_CHARS {
            return Err(LlmError::ContractViolation {
                contract: EXTRACT_CONTRACT.into(),
                reason: format!("entities[{i}].value_redacted over limit"),
            });
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_classify_json() -> String {
        json!({
            "intents": [
                {"label": "INTENT_CLAIM_NEW", "confidence": 0.9, "evidence_snippets": ["unfall"]}
            ],
            "primary_intent": "INTENT_CLAIM_NEW",
            "product_line": {"label": "PROD_AUTO", "confidence": 0.8, "evidence_snippets": ["a2"]},
            "urgency": {"label": "URG_HIGH", "confidence": 0.7, "evidence_snippets": ["sofort"]},
            "risk_flags": []
        })
        .to_string()
    }

    #[test]
    fn parses_valid_classify_output() {
        let output = parse_classify_output(&valid_classify_json()).unwrap();
        assert_eq!(output.primary_intent, "INTENT_CLAIM_NEW");
        assert_eq!(output.intents.len(), 1);
    }

    #[test]
    fn parses_fenced_output() {
        let fenced = format!("```json\n{}\n```", valid_classify_json());
        assert!(parse_classify_output(&fenced).is_ok());
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_classify_json()).unwrap();
        value["extra"] = json!("nope");
        let err = parse_classify_output(&value.to_string()).unwrap_err();
        assert!(matches!(err, LlmError::InvalidJson(_)));
    }

    #[test]
    fn rejects_empty_intents() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_classify_json()).unwrap();
        value["intents"] = json!([]);
        let err = parse_classify_output(&value.to_string()).unwrap_err();
        assert!(matches!(err, LlmError::ContractViolation { .. }));
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_classify_json()).unwrap();
        value["urgency"]["confidence"] = json!(1.2);
        let err = parse_classify_output(&value.to_string()).unwrap_err();
        assert!(matches!(err, LlmError::ContractViolation { .. }));
    }

    #[test]
    fn rejects_missing_evidence() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_classify_json()).unwrap();
        value["product_line"]["evidence_snippets"] = json!([]);
        assert!(parse_classify_output(&value.to_string()).is_err());
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_classify_output("the intent is probably a claim").unwrap_err();
        assert!(matches!(err, LlmError::InvalidJson(_)));
    }

    #[test]
    fn parses_extract_output() {
        let raw = json!({
            "entities": [
                {"entity_type": "ENT_POLICY_NUMBER", "value_redacted": "12-3456789",
                 "confidence": 0.9, "evidence_snippets": ["polizzennr 12-3456789"]}
            ]
        })
        .to_string();
        let output = parse_extract_output(&raw).unwrap();
        assert_eq!(output.entities.len(), 1);
    }

    #[test]
    fn rejects_oversized_snippet() {
        let long = "x".repeat(MAX_EVIDENCE_SNIPPET_CHARS + 1);
        let raw = json!({
            "intents": [
                {"label": "INTENT_CLAIM_NEW", "confidence": 0.9, "evidence_snippets": [long]}
            ],
            "primary_intent": "INTENT_CLAIM_NEW",
            "product_line": {"label": "PROD_AUTO", "confidence": 0.8, "evidence_snippets": ["a"]},
            "urgency": {"label": "URG_HIGH", "confidence": 0.7, "evidence_snippets": ["b"]},
            "risk_flags": []
        })
        .to_string();
        assert!(parse_classify_output(&raw).is_err());
    }
}
