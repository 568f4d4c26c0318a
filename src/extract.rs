//! Entity extraction.
//!
//! Deterministic pattern extraction first (policy/claim numbers, dates,
//! locations, IBAN with mod-97 checksum), then an optional merge of LLM
//! proposals. An LLM proposal only survives pattern validation, evidence
//! verification against the redacted canonical text, and a directory
//! existence check; pattern-valid but unknown identifiers are kept with
//! `directory_miss` and count as medium signals at best downstream.
//! Sensitive values are stored redacted per the configured policy.

use regex::Regex;
use tracing::{debug, warn};

use crate::adapters::{with_deadline, DirectoryAdapter};
use crate::artifacts::{
    AttachmentArtifact, EvidenceSpan, ExtractedEntity, ExtractionResult, NormalizedMessage,
};
use crate::canonical::jcs;
use crate::config::{ConfigSnapshot, IbanStoreMode};
use crate::error::Result;
use crate::llm::contracts::ExtractLlmOutput;
use crate::registry::{AvStatus, EntityType, EvidenceSource};

/// IBAN mod-97 checksum (ISO 13616). Rejects pattern-shaped strings that
/// are not actual IBANs.
pub fn iban_checksum_ok(iban: &str) -> bool {
    let compact: String = iban.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 15 || compact.len() > 34 {
        return false;
    }
    let upper = compact.to_uppercase();
    let (head, tail) = upper.split_at(4);
    let rearranged = format!("{tail}{head}");
    let mut remainder: u64 = 0;
    for c in rearranged.chars() {
        let value = match c {
            '0'..='9' => c as u64 - '0' as u64,
            'A'..='Z' => c as u64 - 'A' as u64 + 10,
            _ => return false,
        };
        remainder = if value >= 10 {
            (remainder * 100 + value) % 97
        } else {
            (remainder * 10 + value) % 97
        };
    }
    remainder == 1
}

/// Redacted display form of an IBAN: first four and last four characters.
fn iban_redact(value: &str) -> String {
    if value.len() <= 8 {
        return value.to_lowercase();
    }
    format!(
        "{}…{}",
        value[..4].to_lowercase(),
        value[value.len() - 4..].to_lowercase()
    )
}

fn full_entity(
    entity_type: EntityType,
    value: &str,
    confidence: f64,
    provenance: EvidenceSpan,
) -> ExtractedEntity {
    ExtractedEntity {
        entity_type,
        value: Some(value.to_string()),
        value_redacted: value.to_string(),
        value_sha256: jcs::snippet_sha256(value),
        store_mode: IbanStoreMode::Full,
        confidence,
        directory_miss: false,
        provenance,
    }
}

/// The extraction stage.
pub struct Extractor<'a> {
    pub config: &'a ConfigSnapshot,
    pub directory: &'a dyn DirectoryAdapter,
    patterns: ExtractPatterns,
}

struct ExtractPatterns {
    policy: Regex,
    claim: Regex,
    date: Regex,
    location_ort: Regex,
    location_in: Regex,
    iban: Regex,
}

impl<'a> Extractor<'a> {
    pub fn new(config: &'a ConfigSnapshot, directory: &'a dyn DirectoryAdapter) -> Self {
        Self {
            config,
            directory,
            patterns: ExtractPatterns {
                policy: Regex::new(r"\b(pol-\d{4}-\d{8}|\d{2}-\d{7})\b").unwrap(),
                claim: Regex::new(r"\b(clm-\d{4}-\d{4})\b").unwrap(),
                date: Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap(),
                location_ort: Regex::new(r"\bort:\s+([a-zäöüß-]{2,})\b").unwrap(),
                location_in: Regex::new(r"\bin\s+([a-zäöüß-]{2,})\b").unwrap(),
                iban: Regex::new(r"\b([a-z]{2}\d{2}[a-z0-9]{10,30})\b").unwrap(),
            },
        }
    }

    /// Runs deterministic extraction over the canonical texts.
    pub async fn extract(
        &self,
        nm: &NormalizedMessage,
        attachments: &[AttachmentArtifact],
    ) -> Result<ExtractionResult> {
        let subject = &nm.subject_c14n;
        let body = &nm.body_text_c14n;
        let mut entities: Vec<ExtractedEntity> = Vec::new();

        if let Some((value, source, text, start, end)) =
            first_match(&self.patterns.policy, subject, body)
        {
            if crate::identity::signals::is_valid_policy_number(&value) {
                let canonical_value = crate::identity::signals::canonical_policy_value(&value);
                let mut entity = full_entity(
                    EntityType::PolicyNumber,
                    &canonical_value,
                    0.95,
                    EvidenceSpan::new(source, text, start, end),
                );
                entity.directory_miss = self.directory_miss_policy(&canonical_value).await;
                entities.push(entity);
            }
        }

        if let Some((value, source, text, start, end)) =
            first_match(&self.patterns.claim, subject, body)
        {
            if crate::identity::signals::is_valid_claim_number(&value) {
                let canonical_value = value.to_uppercase();
                let mut entity = full_entity(
                    EntityType::ClaimNumber,
                    &canonical_value,
                    0.95,
                    EvidenceSpan::new(source, text, start, end),
                );
                entity.directory_miss = self.directory_miss_claim(&canonical_value).await;
                entities.push(entity);
            }
        }

        if let Some(found) = self.patterns.date.find(body) {
            entities.push(full_entity(
                EntityType::Date,
                found.as_str(),
                0.9,
                EvidenceSpan::new(EvidenceSource::Body, body, found.start(), found.end()),
            ));
        }

        if let Some(found) = self.patterns.location_ort.captures(body) {
            let whole = found.get(0).unwrap();
            let name = capitalized(found.get(1).unwrap().as_str());
            entities.push(full_entity(
                EntityType::Location,
                &name,
                0.8,
                EvidenceSpan::new(EvidenceSource::Body, body, whole.start(), whole.end()),
            ));
        } else if let Some(found) = self.patterns.location_in.captures(body) {
            let group = found.get(1).unwrap();
            let name = capitalized(group.as_str());
            entities.push(full_entity(
                EntityType::Location,
                &name,
                0.8,
                EvidenceSpan::new(EvidenceSource::Body, body, group.start(), group.end()),
            ));
        }

        if self.config.extraction.iban.enabled {
            if let Some(found) = self.patterns.iban.find(body) {
                let raw = found.as_str();
                let normalized = raw.to_uppercase();
                if iban_checksum_ok(&normalized) {
                    let store_mode = self.config.extraction.iban.store_mode;
                    entities.push(ExtractedEntity {
                        entity_type: EntityType::Iban,
                        value: match store_mode {
                            IbanStoreMode::Full => Some(normalized.clone()),
                            IbanStoreMode::HashOnly => None,
                        },
                        value_redacted: iban_redact(&normalized),
                        value_sha256: jcs::snippet_sha256(&normalized),
                        store_mode,
                        confidence: 0.85,
                        directory_miss: false,
                        provenance: EvidenceSpan::new(
                            EvidenceSource::Body,
                            body,
                            found.start(),
                            found.end(),
                        ),
                    });
                } else {
                    debug!(message_id = %nm.message_id, "IBAN-shaped string failed checksum");
                }
            }
        }

        // Document-type entities from CLEAN attachments only.
        if attachments.iter().all(|a| a.av_status == AvStatus::Clean) {
            for attachment in attachments {
                if let Some(candidate) = attachment.doc_type_candidates.first() {
                    if let Some(span) = candidate.evidence.first() {
                        entities.push(full_entity(
                            EntityType::DocumentType,
                            &candidate.doc_type_label,
                            candidate.confidence,
                            span.clone(),
                        ));
                        break;
                    }
                }
            }
        }

        Ok(ExtractionResult {
            message_id: nm.message_id.clone(),
            run_id: String::new(),
            entities,
            created_at: nm.ingested_at,
        })
    }

    async fn directory_miss_policy(&self, value: &str) -> bool {
        match with_deadline(
            self.config.deadlines.directory(),
            self.directory.lookup_policy(value),
        )
        .await
        {
            Ok(record) => record.is_none(),
            Err(e) => {
                warn!(error = %e, "Directory unavailable during extraction, marking miss");
                true
            }
        }
    }

    async fn directory_miss_claim(&self, value: &str) -> bool {
        match with_deadline(
            self.config.deadlines.directory(),
            self.directory.lookup_claim(value),
        )
        .await
        {
            Ok(record) => record.is_none(),
            Err(e) => {
                warn!(error = %e, "Directory unavailable during extraction, marking miss");
                true
            }
        }
    }

    /// Merges validated LLM proposals into a deterministic result.
    ///
    /// Proposals must re-match the entity pattern inside their own
    /// snippets, locate verbatim in the redacted canonical text, and pass
    /// the directory existence check; duplicates of deterministic finds
    /// are dropped.
    pub async fn merge_llm_output(
        &self,
        result: &mut ExtractionResult,
        output: &ExtractLlmOutput,
        subject_redacted: &str,
        body_redacted: &str,
    ) -> Result<()> {
        let mut existing: std::collections::BTreeSet<(String, String)> = result
            .entities
            .iter()
            .map(|e| (e.entity_type.to_string(), e.value_sha256.clone()))
            .collect();

        for proposal in &output.entities {
            let Ok(entity_type) = proposal.entity_type.parse::<EntityType>() else {
                debug!(label = %proposal.entity_type, "Dropping non-canonical entity type");
                continue;
            };

            let value = proposal.evidence_snippets.iter().find_map(|snippet| {
                self.pattern_value(entity_type, &snippet.to_lowercase())
            });
            let Some(value) = value else {
                continue;
            };

            let needle = value.to_lowercase();
            let provenance = if let Some(idx) = subject_redacted.find(&needle) {
                EvidenceSpan::new(
                    EvidenceSource::Subject,
                    subject_redacted,
                    idx,
                    idx + needle.len(),
                )
            } else if let Some(idx) = body_redacted.find(&needle) {
                EvidenceSpan::new(EvidenceSource::Body, body_redacted, idx, idx + needle.len())
            } else {
                continue;
            };

            let directory_miss = match entity_type {
                EntityType::PolicyNumber => self.directory_miss_policy(&value).await,
                EntityType::ClaimNumber => self.directory_miss_claim(&value).await,
                _ => false,
            };

            let (stored_value, value_redacted, store_mode) = if entity_type == EntityType::Iban {
                let store_mode = self.config.extraction.iban.store_mode;
                let stored = match store_mode {
                    IbanStoreMode::Full => Some(value.clone()),
                    IbanStoreMode::HashOnly => None,
                };
                (stored, iban_redact(&value), store_mode)
            } else {
                (Some(value.clone()), value.clone(), IbanStoreMode::Full)
            };

            let key = (entity_type.to_string(), jcs::snippet_sha256(&value));
            if !existing.insert(key) {
                continue;
            }

            result.entities.push(ExtractedEntity {
                entity_type,
                value: stored_value,
                value_redacted,
                value_sha256: jcs::snippet_sha256(&value),
                store_mode,
                confidence: proposal.confidence,
                directory_miss,
                provenance,
            });
        }
        Ok(())
    }

    /// Runs the optional LLM extraction pass and merges what survives
    /// validation. Extraction gaps never fail the pipeline: every error
    /// path logs and keeps the deterministic result.
    pub async fn llm_assist(
        &self,
        nm: &NormalizedMessage,
        result: &mut ExtractionResult,
        provider: Option<&dyn crate::llm::LlmProvider>,
        cache: &dyn crate::llm::InferenceCache,
        cache_only: bool,
        redactor: &crate::llm::redaction::Redactor,
    ) -> Result<()> {
        let llm = &self.config.classification.llm;
        let subject_redacted = redactor.redact_preserve_length(&nm.subject_c14n);
        let body_redacted = redactor.redact_preserve_length(&nm.body_text_c14n);
        let prompt = build_extract_prompt(&subject_redacted, &body_redacted);
        let prompt_sha256 = jcs::snippet_sha256(&prompt);
        let input_digest = jcs::canonical_sha256(&serde_json::json!({
            "body_redacted": body_redacted,
            "subject_redacted": subject_redacted,
        }))?;
        let key = crate::llm::llm_cache_key(
            crate::registry::InferencePurpose::Extract,
            &llm.model_id,
            &llm.params,
            &prompt_sha256,
            &input_digest,
        );

        let output = match cache.get(&key).await {
            Some(artifact) => {
                crate::llm::contracts::parse_extract_output(&artifact.output_json.to_string()).ok()
            }
            None if cache_only => {
                debug!(message_id = %nm.message_id, "Extract inference not cached, skipping");
                None
            }
            None => match provider {
                Some(provider) => {
                    let inference = tokio::time::timeout(
                        self.config.deadlines.llm(),
                        provider.infer(&prompt, &llm.params),
                    )
                    .await;
                    match inference {
                        Ok(Ok(raw)) => match crate::llm::contracts::parse_extract_output(&raw) {
                            Ok(output) => {
                                let artifact = crate::artifacts::LlmInferenceArtifact::new(
                                    crate::registry::InferencePurpose::Extract,
                                    llm.model_id.clone(),
                                    llm.params.clone(),
                                    prompt_sha256,
                                    input_digest,
                                    serde_json::to_value(&output)
                                        .map_err(crate::error::ValidationError::Json)?,
                                )?;
                                cache.put(&key, artifact).await?;
                                Some(output)
                            }
                            Err(e) => {
                                warn!(error = %e, "Extract output invalid, keeping deterministic result");
                                None
                            }
                        },
                        Ok(Err(e)) => {
                            warn!(error = %e, "Extract inference failed, keeping deterministic result");
                            None
                        }
                        Err(_) => {
                            warn!("Extract inference timed out, keeping deterministic result");
                            None
                        }
                    }
                }
                None => None,
            },
        };

        if let Some(output) = output {
            self.merge_llm_output(result, &output, &subject_redacted, &body_redacted)
                .await?;
        }
        Ok(())
    }

    /// Re-matches the typed pattern inside an LLM snippet; the canonical
    /// value comes from the pattern, never from the model's free text.
    fn pattern_value(&self, entity_type: EntityType, text: &str) -> Option<String> {
        match entity_type {
            EntityType::PolicyNumber => self
                .patterns
                .policy
                .find(text)
                .filter(|m| crate::identity::signals::is_valid_policy_number(m.as_str()))
                .map(|m| crate::identity::signals::canonical_policy_value(m.as_str())),
            EntityType::ClaimNumber => self
                .patterns
                .claim
                .find(text)
                .map(|m| m.as_str().to_uppercase())
                .filter(|v| crate::identity::signals::is_valid_claim_number(v)),
            EntityType::Date => self.patterns.date.find(text).map(|m| m.as_str().to_string()),
            EntityType::Iban => self
                .patterns
                .iban
                .find(text)
                .map(|m| m.as_str().to_uppercase())
                .filter(|v| iban_checksum_ok(v)),
            _ => None,
        }
    }
}

/// Builds the extract prompt over redacted canonical text.
fn build_extract_prompt(subject_redacted: &str, body_redacted: &str) -> String {
    let entity_types: Vec<&str> = crate::registry::EntityType::ALL
        .iter()
        .map(|e| e.as_str())
        .collect();
    format!(
        "Extract entities from this insurance email. Answer with ONLY a JSON object:\n\
         {{\"entities\": [{{\"entity_type\", \"value_redacted\", \"confidence\", \"evidence_snippets\"}}]}}\n\
         entity_type MUST come from: {entity_types:?}\n\
         Evidence snippets MUST be verbatim substrings of the text below.\n\
         subject: {subject_redacted}\n\
         body:\n{body_redacted}\n"
    )
}

fn first_match<'t>(
    regex: &Regex,
    subject: &'t str,
    body: &'t str,
) -> Option<(String, EvidenceSource, &'t str, usize, usize)> {
    if let Some(found) = regex.find(subject) {
        return Some((
            found.as_str().to_string(),
            EvidenceSource::Subject,
            subject,
            found.start(),
            found.end(),
        ));
    }
    regex.find(body).map(|found| {
        (
            found.as_str().to_string(),
            EvidenceSource::Body,
            body,
            found.start(),
            found.end(),
        )
    })
}

fn capitalized(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
