//! Classification stage.
//!
//! Two modes. BASELINE: the deterministic rules classifier decides, the
//! LLM is off by default. LLM_FIRST: the LLM produces the classification
//! as strict JSON and must survive the acceptance gates (canonical
//! labels, confidence floors, verbatim evidence, and the disagreement gate
//! against the rules classifier) or the message routes to classification
//! review. The risk prescan runs first in both modes and its flags are
//! never removed.

pub mod prescan;
pub mod rules;

pub use prescan::{merge_flag, RiskPrescan};
pub use rules::{RulesClassification, RulesClassifier};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifacts::{
    AttachmentArtifact, ClassificationResult, EvidenceSpan, Labeled, ModelRef, NormalizedMessage,
};
use crate::canonical::jcs;
use crate::config::{ConfigRef, ConfigSnapshot, PipelineMode};
use crate::decision;
use crate::error::{LlmError, Result};
use crate::llm::cache::{llm_cache_key, InferenceCache};
use crate::llm::contracts::{parse_classify_output, ClassifyLlmOutput, LlmLabeled};
use crate::llm::redaction::Redactor;
use crate::llm::{classify_gate, DailyCallCounter, LlmProvider};
use crate::registry::{InferencePurpose, Intent, ProductLine, RiskFlag, Urgency};

/// Classification stage output.
#[derive(Debug, Clone)]
pub struct ClassifyOutput {
    pub result: ClassificationResult,
    /// Present when the stage must route to classification review.
    pub fail_closed_reason: Option<String>,
    pub llm_used: bool,
}

/// The classifier bound to one config snapshot.
pub struct Classifier<'a> {
    pub config: &'a ConfigSnapshot,
    pub config_ref: &'a ConfigRef,
    pub provider: Option<&'a dyn LlmProvider>,
    pub cache: &'a dyn InferenceCache,
    /// Resolve inference from the cache only, never the provider. Set by
    /// the config's determinism mode or by orchestrator replay. Execution
    /// behavior only; the decision hash binds the pinned config value,
    /// so a replay of a live run still reproduces the original hash.
    cache_only: bool,
    counter: Option<&'a DailyCallCounter>,
    rules: RulesClassifier,
    prescan: RiskPrescan,
    redactor: Redactor,
}

impl<'a> Classifier<'a> {
    pub fn new(
        config: &'a ConfigSnapshot,
        config_ref: &'a ConfigRef,
        provider: Option<&'a dyn LlmProvider>,
        cache: &'a dyn InferenceCache,
    ) -> Self {
        Self {
            config,
            config_ref,
            provider,
            cache,
            cache_only: config.determinism_mode,
            counter: None,
            rules: RulesClassifier::new(),
            prescan: RiskPrescan::new(),
            redactor: Redactor::new(),
        }
    }

    /// Forces cache-only inference resolution (orchestrator replay).
    pub fn with_cache_only(mut self) -> Self {
        self.cache_only = true;
        self
    }

    /// Attaches the process-wide daily call counter.
    pub fn with_call_counter(mut self, counter: &'a DailyCallCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Classifies one message.
    pub async fn classify(
        &self,
        nm: &NormalizedMessage,
        attachments: &[AttachmentArtifact],
    ) -> Result<ClassifyOutput> {
        let risk_flags = self.prescan.evaluate(self.config, nm, attachments);
        let deterministic = self.rules.classify(nm);

        match self.config.pipeline_mode {
            PipelineMode::Baseline => {
                // Rules decide. The LLM is optional refinement: when the
                // gate lets it run and it survives the acceptance gates,
                // its result is taken; any rejection degrades silently to
                // the deterministic answer, never to review.
                let calls_today = self.counter.map(|c| c.calls_today()).unwrap_or(0);
                let gate = classify_gate(
                    self.config,
                    deterministic.primary_intent.confidence,
                    !risk_flags.is_empty(),
                    calls_today,
                );
                if gate.allowed && self.provider.is_some() {
                    let mut output = self
                        .classify_llm_first(nm, deterministic.clone(), risk_flags.clone())
                        .await?;
                    if output.fail_closed_reason.take().is_some() {
                        let result = self.deterministic_result(nm, &deterministic, risk_flags)?;
                        return Ok(ClassifyOutput {
                            result,
                            fail_closed_reason: None,
                            llm_used: false,
                        });
                    }
                    return Ok(output);
                }
                let result = self.deterministic_result(nm, &deterministic, risk_flags)?;
                Ok(ClassifyOutput {
                    result,
                    fail_closed_reason: None,
                    llm_used: false,
                })
            }
            PipelineMode::LlmFirst => {
                self.classify_llm_first(nm, deterministic, risk_flags).await
            }
        }
    }

    async fn classify_llm_first(
        &self,
        nm: &NormalizedMessage,
        deterministic: RulesClassification,
        prescan_flags: Vec<Labeled<RiskFlag>>,
    ) -> Result<ClassifyOutput> {
        let llm = &self.config.classification.llm;

        // Incident kill-switch and disabled provider degrade to the rules
        // classifier without failing closed: the message still flows.
        if self.config.incident.disable_llm || !llm.enabled || llm.provider == "disabled" {
            debug!(message_id = %nm.message_id, "LLM disabled, using rules classification");
            let result = self.deterministic_result(nm, &deterministic, prescan_flags)?;
            return Ok(ClassifyOutput {
                result,
                fail_closed_reason: None,
                llm_used: false,
            });
        }

        let subject_redacted = self.redactor.redact_preserve_length(&nm.subject_c14n);
        let body_redacted = self.redactor.redact_preserve_length(&nm.body_text_c14n);
        let prompt = build_classify_prompt(&subject_redacted, &body_redacted, &nm.language);
        let prompt_sha256 = jcs::snippet_sha256(&prompt);
        let input_digest = jcs::canonical_sha256(&json!({
            "body_redacted": body_redacted,
            "language": nm.language,
            "subject_redacted": subject_redacted,
        }))?;
        let cache_key = llm_cache_key(
            InferencePurpose::Classify,
            &llm.model_id,
            &llm.params,
            &prompt_sha256,
            &input_digest,
        );

        let output = match self.cache.get(&cache_key).await {
            Some(artifact) => {
                debug!(message_id = %nm.message_id, "Inference cache hit");
                match parse_classify_output(&artifact.output_json.to_string()) {
                    Ok(output) => output,
                    Err(e) => {
                        return self.rejected(nm, &deterministic, prescan_flags, format!("cached_output_invalid: {e}"));
                    }
                }
            }
            None if self.cache_only => {
                warn!(
                    message_id = %nm.message_id,
                    "Determinism mode cache miss, failing closed"
                );
                return self.rejected(
                    nm,
                    &deterministic,
                    prescan_flags,
                    "determinism_cache_miss".to_string(),
                );
            }
            None => {
                let calls_today = self.counter.map(|c| c.calls_today()).unwrap_or(0);
                let gate = classify_gate(
                    self.config,
                    deterministic.primary_intent.confidence,
                    !prescan_flags.is_empty(),
                    calls_today,
                );
                if !gate.allowed {
                    return self.rejected(
                        nm,
                        &deterministic,
                        prescan_flags,
                        format!("llm_gate_denied: {}", gate.reason),
                    );
                }
                let Some(provider) = self.provider else {
                    return self.rejected(
                        nm,
                        &deterministic,
                        prescan_flags,
                        "llm_provider_unavailable".to_string(),
                    );
                };
                if let Some(counter) = self.counter {
                    counter.consume();
                }
                match self.infer_with_repair(provider, &prompt).await {
                    Ok(output) => {
                        let artifact = crate::artifacts::LlmInferenceArtifact::new(
                            InferencePurpose::Classify,
                            llm.model_id.clone(),
                            llm.params.clone(),
                            prompt_sha256.clone(),
                            input_digest.clone(),
                            serde_json::to_value(&output)
                                .map_err(crate::error::ValidationError::Json)?,
                        )?;
                        self.cache.put(&cache_key, artifact).await?;
                        output
                    }
                    Err(e) => {
                        return self.rejected(
                            nm,
                            &deterministic,
                            prescan_flags,
                            format!("llm_invalid_output: {e}"),
                        );
                    }
                }
            }
        };

        match self.accept(&output, &deterministic, &subject_redacted, &body_redacted) {
            Ok(accepted) => {
                let mut risk_flags = prescan_flags;
                for flag in accepted.risk_flags {
                    merge_flag(&mut risk_flags, flag);
                }
                let model_ref = ModelRef {
                    provider: llm.provider.clone(),
                    model_id: llm.model_id.clone(),
                    prompt_sha256,
                };
                let result = self.build_result(
                    nm,
                    accepted.intents,
                    accepted.primary_intent,
                    accepted.product_line,
                    accepted.urgency,
                    risk_flags,
                    Some(model_ref),
                )?;
                info!(
                    message_id = %nm.message_id,
                    primary = %result.primary_intent.label,
                    "LLM classification accepted"
                );
                Ok(ClassifyOutput {
                    result,
                    fail_closed_reason: None,
                    llm_used: true,
                })
            }
            Err(reason) => self.rejected(nm, &deterministic, prescan_flags, reason),
        }
    }

    /// Max two attempts: the primary prompt, then one repair prompt when
    /// the answer was not valid JSON. Anything further fails closed.
    async fn infer_with_repair(
        &self,
        provider: &dyn LlmProvider,
        prompt: &str,
    ) -> std::result::Result<ClassifyLlmOutput, LlmError> {
        let params = &self.config.classification.llm.params;
        let deadline = self.config.deadlines.llm();

        let raw = tokio::time::timeout(deadline, provider.infer(prompt, params))
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: provider.provider_name().to_string(),
                reason: "deadline exceeded".into(),
            })??;
        match parse_classify_output(&raw) {
            Ok(output) => Ok(output),
            Err(first_error) => {
                warn!(error = %first_error, "Classify output invalid, sending repair prompt");
                let repair = format!(
                    "{prompt}\n\nYour previous answer was rejected: {first_error}.\n\
                     Answer again with ONLY the JSON object, no prose, no code fences."
                );
                let raw = tokio::time::timeout(deadline, provider.infer(&repair, params))
                    .await
                    .map_err(|_| LlmError::RequestFailed {
                        provider: provider.provider_name().to_string(),
                        reason: "deadline exceeded".into(),
                    })??;
                parse_classify_output(&raw)
            }
        }
    }

    /// The acceptance gates. Returns the mapped result or the rejection
    /// reason that routes to classification review.
    fn accept(
        &self,
        output: &ClassifyLlmOutput,
        deterministic: &RulesClassification,
        subject_redacted: &str,
        body_redacted: &str,
    ) -> std::result::Result<AcceptedClassification, String> {
        let accept = &self.config.classification.accept;

        let mut intents = Vec::new();
        for item in &output.intents {
            let label: Intent = item
                .label
                .parse()
                .map_err(|_| format!("llm_non_canonical_label: {}", item.label))?;
            let evidence = self.verify_evidence(item, subject_redacted, body_redacted)?;
            intents.push(Labeled::new(label, item.confidence, evidence));
        }
        if intents.is_empty() {
            return Err("llm_empty_intents".into());
        }

        // The stated primary must be one of the returned intents; the
        // canonical priority order then picks the primary authoritatively.
        let stated: Intent = output
            .primary_intent
            .parse()
            .map_err(|_| format!("llm_non_canonical_label: {}", output.primary_intent))?;
        if !intents.iter().any(|i| i.label == stated) {
            return Err("llm_primary_not_in_intents".into());
        }
        let primary = intents
            .iter()
            .min_by_key(|i| i.label.priority())
            .cloned()
            .expect("intents checked non-empty");

        let product_label: ProductLine = output
            .product_line
            .label
            .parse()
            .map_err(|_| format!("llm_non_canonical_label: {}", output.product_line.label))?;
        let product_evidence =
            self.verify_evidence(&output.product_line, subject_redacted, body_redacted)?;
        let product = Labeled::new(product_label, output.product_line.confidence, product_evidence);

        let urgency_label: Urgency = output
            .urgency
            .label
            .parse()
            .map_err(|_| format!("llm_non_canonical_label: {}", output.urgency.label))?;
        let urgency_evidence =
            self.verify_evidence(&output.urgency, subject_redacted, body_redacted)?;
        let urgency = Labeled::new(urgency_label, output.urgency.confidence, urgency_evidence);

        if primary.confidence < accept.primary_intent {
            return Err(format!(
                "llm_confidence_below_threshold: primary_intent {} < {}",
                primary.confidence, accept.primary_intent
            ));
        }
        if product.confidence < accept.product_line {
            return Err(format!(
                "llm_confidence_below_threshold: product_line {} < {}",
                product.confidence, accept.product_line
            ));
        }
        if urgency.confidence < accept.urgency {
            return Err(format!(
                "llm_confidence_below_threshold: urgency {} < {}",
                urgency.confidence, accept.urgency
            ));
        }

        let mut risk_flags = Vec::new();
        for item in &output.risk_flags {
            let label: RiskFlag = item
                .label
                .parse()
                .map_err(|_| format!("llm_non_canonical_label: {}", item.label))?;
            if item.confidence < accept.risk_flag {
                return Err(format!(
                    "llm_confidence_below_threshold: risk_flag {} {} < {}",
                    label, item.confidence, accept.risk_flag
                ));
            }
            let evidence = self.verify_evidence(item, subject_redacted, body_redacted)?;
            risk_flags.push(Labeled::new(label, item.confidence, evidence));
        }

        // Disagreement gate: a confident deterministic rule on a different
        // primary intent wins a trip to review.
        let min_rule = self.config.classification.disagreement_min_rule_confidence;
        if deterministic.primary_intent.label != primary.label
            && deterministic.primary_intent.confidence >= min_rule
        {
            return Err(format!(
                "llm_rules_disagreement: rules say {} ({}), llm says {}",
                deterministic.primary_intent.label,
                deterministic.primary_intent.confidence,
                primary.label
            ));
        }

        Ok(AcceptedClassification {
            intents,
            primary_intent: primary,
            product_line: product,
            urgency,
            risk_flags,
        })
    }

    /// Verifies that at least one evidence snippet is a verbatim substring
    /// of the redacted canonical text, and converts it to a span whose
    /// hash matches by construction.
    fn verify_evidence(
        &self,
        item: &LlmLabeled,
        subject_redacted: &str,
        body_redacted: &str,
    ) -> std::result::Result<Vec<EvidenceSpan>, String> {
        let mut spans = Vec::new();
        for snippet in &item.evidence_snippets {
            let needle = snippet.trim().to_lowercase();
            if needle.is_empty() {
                continue;
            }
            if let Some(idx) = subject_redacted.find(&needle) {
                spans.push(EvidenceSpan::new(
                    crate::registry::EvidenceSource::Subject,
                    subject_redacted,
                    idx,
                    idx + needle.len(),
                ));
            } else if let Some(idx) = body_redacted.find(&needle) {
                spans.push(EvidenceSpan::new(
                    crate::registry::EvidenceSource::Body,
                    body_redacted,
                    idx,
                    idx + needle.len(),
                ));
            }
        }
        if spans.is_empty() {
            return Err(format!(
                "llm_evidence_unverified: no snippet for {} found in canonical text",
                item.label
            ));
        }
        Ok(spans)
    }

    fn deterministic_result(
        &self,
        nm: &NormalizedMessage,
        deterministic: &RulesClassification,
        risk_flags: Vec<Labeled<RiskFlag>>,
    ) -> Result<ClassificationResult> {
        self.build_result(
            nm,
            deterministic.intents.clone(),
            deterministic.primary_intent.clone(),
            deterministic.product_line.clone(),
            deterministic.urgency.clone(),
            risk_flags,
            None,
        )
    }

    /// Fail-closed path: the schema-valid deterministic result plus the
    /// reason routing sends to classification review.
    fn rejected(
        &self,
        nm: &NormalizedMessage,
        deterministic: &RulesClassification,
        risk_flags: Vec<Labeled<RiskFlag>>,
        reason: String,
    ) -> Result<ClassifyOutput> {
        warn!(message_id = %nm.message_id, reason = %reason, "Classification failing closed");
        let result = self.deterministic_result(nm, deterministic, risk_flags)?;
        Ok(ClassifyOutput {
            result,
            fail_closed_reason: Some(reason),
            llm_used: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        nm: &NormalizedMessage,
        intents: Vec<Labeled<Intent>>,
        primary_intent: Labeled<Intent>,
        product_line: Labeled<ProductLine>,
        urgency: Labeled<Urgency>,
        risk_flags: Vec<Labeled<RiskFlag>>,
        model_ref: Option<ModelRef>,
    ) -> Result<ClassificationResult> {
        let mut result = ClassificationResult {
            message_id: nm.message_id.clone(),
            run_id: String::new(),
            intents,
            primary_intent,
            product_line,
            urgency,
            risk_flags,
            rules_version: self.config.classification.rules_version.clone(),
            model_ref,
            decision_hash: String::new(),
            created_at: nm.ingested_at,
        };
        let input = decision::classify_decision_input(
            self.config,
            self.config_ref,
            &nm.message_fingerprint,
            &nm.raw_mime_sha256,
            &result,
        );
        result.decision_hash = decision::decision_hash(&input)?;
        Ok(result)
    }
}

/// Mapped, gate-approved classification.
struct AcceptedClassification {
    intents: Vec<Labeled<Intent>>,
    primary_intent: Labeled<Intent>,
    product_line: Labeled<ProductLine>,
    urgency: Labeled<Urgency>,
    risk_flags: Vec<Labeled<RiskFlag>>,
}

/// Builds the classify prompt over redacted canonical text. The canonical
/// label sets are spelled out so the model cannot invent labels.
fn build_classify_prompt(subject_redacted: &str, body_redacted: &str, language: &str) -> String {
    let intents: Vec<&str> = Intent::ALL.iter().map(|i| i.as_str()).collect();
    let products: Vec<&str> = ProductLine::ALL.iter().map(|p| p.as_str()).collect();
    let urgencies: Vec<&str> = Urgency::ALL.iter().map(|u| u.as_str()).collect();
    let risks: Vec<&str> = RiskFlag::ALL.iter().map(|r| r.as_str()).collect();
    format!(
        "You classify inbound insurance emails. Answer with ONLY a JSON object of this shape:\n\
         {{\"intents\": [{{\"label\", \"confidence\", \"evidence_snippets\"}}], \
         \"primary_intent\": \"...\", \
         \"product_line\": {{\"label\", \"confidence\", \"evidence_snippets\"}}, \
         \"urgency\": {{\"label\", \"confidence\", \"evidence_snippets\"}}, \
         \"risk_flags\": [...]}}\n\
         Every label MUST come from these sets.\n\
         intents: {intents:?}\n\
         product_lines: {products:?}\n\
         urgencies: {urgencies:?}\n\
         risk_flags: {risks:?}\n\
         Evidence snippets MUST be verbatim substrings of the text below (max 200 chars).\n\
         language: {language}\n\
         subject: {subject_redacted}\n\
         body:\n{body_redacted}\n"
    )
}
