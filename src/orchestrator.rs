//! The stage orchestrator.
//!
//! Drives one message through Ingest → Normalize → Attachments → Identity
//! → Classify → Extract → Route → Case under a pinned config snapshot.
//! Every stage write is idempotent under its job key, every stage emits an
//! audit event after its artifact is persisted, and any stage failure
//! converts to a fail-closed routing decision instead of propagating.
//! Replay mode re-executes the decision stages cache-only against a prior
//! run's artifacts and compares decision hashes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{
    with_deadline, with_retry, AvScanner, Broker, CaseAdapter, DirectoryAdapter, MailIngest,
    RawAttachment, RawInboundMessage, TextExtractor,
};
use crate::artifacts::{
    ArtifactRef, AttachmentArtifact, ClassificationResult, ExtractionResult,
    IdentityResolutionResult, NormalizedMessage, RoutingDecision, SCHEMA_ATTACHMENT,
    SCHEMA_CLASSIFICATION_RESULT, SCHEMA_EXTRACTION_RESULT, SCHEMA_IDENTITY_RESULT,
    SCHEMA_NORMALIZED_MESSAGE, SCHEMA_RAW_MIME, SCHEMA_ROUTING_DECISION,
};
use crate::attachments::AttachmentStage;
use crate::audit::{AuditEventDraft, AuditLog};
use crate::canonical::jcs;
use crate::classify::{Classifier, RulesClassifier};
use crate::config::{ConfigRef, ConfigSnapshot};
use crate::error::{Error, Result, StageError};
use crate::extract::Extractor;
use crate::identity::IdentityResolver;
use crate::llm::{DailyCallCounter, InferenceCache, LlmProvider};
use crate::registry::{Action, Queue, Sla, Stage};
use crate::route::{evaluate_routing, RouteInputs, RoutingRuleset};
use crate::store::{put_artifact, PutOutcome, Stores};

/// Stage execution states. `FailedClosed` is terminal for the run but
/// still yields a schema-valid review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Pending,
    Running,
    Done,
    FailedClosed,
    DeadLettered,
}

impl StageState {
    /// Legal transitions of the stage state machine.
    pub fn can_transition_to(self, next: StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::Running)
                | (StageState::Running, StageState::Done)
                | (StageState::Running, StageState::FailedClosed)
                | (StageState::Running, StageState::DeadLettered)
        )
    }
}

/// Deterministic per-stage job key. Identical inputs under the same config
/// and ruleset produce the same key across retries and redeliveries.
pub fn job_id(
    message_id: &str,
    stage: Stage,
    config_sha256: &str,
    ruleset_sha256: Option<&str>,
    input_refs: &[&ArtifactRef],
) -> String {
    let refs: Vec<&str> = input_refs.iter().map(|r| r.sha256.as_str()).collect();
    let value = json!({
        "config_sha256": config_sha256,
        "input_refs": refs,
        "message_id": message_id,
        "ruleset_sha256": ruleset_sha256,
        "stage": stage,
    });
    jcs::canonical_sha256(&value).expect("job key input is canonical-safe")
}

/// Everything one finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub message_id: String,
    pub run_id: String,
    pub nm: NormalizedMessage,
    pub attachments: Vec<AttachmentArtifact>,
    pub clean_texts: Vec<(String, String)>,
    pub identity: IdentityResolutionResult,
    pub classification: ClassificationResult,
    pub classify_fail_closed_reason: Option<String>,
    pub extraction: ExtractionResult,
    pub decision: RoutingDecision,
    pub request_info_draft: Option<String>,
    pub stage_states: BTreeMap<Stage, StageState>,
    pub job_ids: BTreeMap<Stage, String>,
    pub artifact_refs: BTreeMap<Stage, ArtifactRef>,
}

/// One stage's hash comparison during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayComparison {
    pub stage: Stage,
    pub original: String,
    pub replayed: String,
}

impl ReplayComparison {
    pub fn matches(&self) -> bool {
        self.original == self.replayed
    }
}

/// Replay outcome: mismatches are incidents, never silent.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub run_id: String,
    pub comparisons: Vec<ReplayComparison>,
}

impl ReplayReport {
    pub fn all_match(&self) -> bool {
        self.comparisons.iter().all(ReplayComparison::matches)
    }
}

/// The orchestrator: shared dependencies for processing runs.
pub struct Orchestrator {
    pub config: Arc<ConfigSnapshot>,
    pub config_ref: ConfigRef,
    pub stores: Stores,
    pub audit: Arc<AuditLog>,
    pub directory: Arc<dyn DirectoryAdapter>,
    pub scanner: Arc<dyn AvScanner>,
    pub text_extractor: Arc<dyn TextExtractor>,
    pub llm_provider: Option<Arc<dyn LlmProvider>>,
    pub inference_cache: Arc<dyn InferenceCache>,
    pub case_adapter: Option<Arc<dyn CaseAdapter>>,
    pub ruleset: RoutingRuleset,
    pub rules_ref: crate::artifacts::RulesetRef,
    pub call_counter: Arc<DailyCallCounter>,
}

/// Deterministic message id derived from the source id.
pub fn derive_message_id(source_message_id: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("msg:{source_message_id}").as_bytes(),
    )
    .to_string()
}

impl Orchestrator {
    /// Processes one message end to end. Stage failures do not propagate:
    /// they produce a fail-closed decision for a stage-matching review
    /// queue.
    pub async fn process_message(
        &self,
        raw: &RawInboundMessage,
        attachments: &[RawAttachment],
        run_id: &str,
    ) -> Result<RunReport> {
        let message_id = derive_message_id(&raw.source_message_id);
        match self
            .run_stages(&message_id, raw, attachments, run_id)
            .await
        {
            Ok(report) => Ok(report),
            Err(Error::Stage(stage_error)) => {
                error!(
                    message_id = %message_id,
                    run_id = %run_id,
                    stage = %stage_error.stage,
                    reason = %stage_error.reason,
                    "Stage failed, producing fail-closed outcome"
                );
                self.fail_closed_run(&message_id, raw, run_id, stage_error)
                    .await
            }
            Err(other) => {
                let stage_error =
                    StageError::internal(Stage::Reprocess, other.to_string());
                self.fail_closed_run(&message_id, raw, run_id, stage_error)
                    .await
            }
        }
    }

    async fn run_stages(
        &self,
        message_id: &str,
        raw: &RawInboundMessage,
        raw_attachments: &[RawAttachment],
        run_id: &str,
    ) -> Result<RunReport> {
        let mut stage_states = BTreeMap::new();
        let mut job_ids = BTreeMap::new();
        let mut artifact_refs = BTreeMap::new();
        // The source-stamped receive time keeps artifact bytes identical
        // across redeliveries of the same message; wall clock is the
        // fallback only.
        let ingested_at = raw
            .source_metadata
            .get("received_at")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        // INGEST: raw bytes become the content-addressed root of the run.
        let raw_sha = self
            .stores
            .attachments
            .put(raw.raw_mime_bytes.clone())
            .await
            .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
        let raw_ref = ArtifactRef::new(SCHEMA_RAW_MIME, format!("blob://{raw_sha}"), raw_sha.clone());
        self.audit
            .append(AuditEventDraft::new(
                message_id,
                run_id,
                Stage::Ingest,
                raw_ref.clone(),
                raw_ref.clone(),
            ))
            .await?;
        stage_states.insert(Stage::Ingest, StageState::Done);

        // NORMALIZE.
        let ctx = crate::normalize::NormalizeContext {
            message_id: message_id.to_string(),
            ingestion_source: raw
                .source_metadata
                .get("source")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            ingested_at,
            raw_mime_uri: raw_ref.uri.clone(),
        };
        let nm = crate::normalize::build_normalized_message(&ctx, &raw.raw_mime_bytes, raw_attachments)
            .map_err(|e| StageError::validation(Stage::Normalize, e.to_string()))?;
        let (nm_ref, outcome) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_NORMALIZED_MESSAGE,
            message_id,
            Stage::Normalize,
            &nm,
        )
        .await?;
        job_ids.insert(
            Stage::Normalize,
            job_id(message_id, Stage::Normalize, &self.config_ref.sha256, None, &[&raw_ref]),
        );
        if outcome == PutOutcome::Written {
            self.audit
                .append(
                    AuditEventDraft::new(
                        message_id,
                        run_id,
                        Stage::Normalize,
                        raw_ref.clone(),
                        nm_ref.clone(),
                    )
                    .with_config_ref(self.config_ref.clone()),
                )
                .await?;
        }
        stage_states.insert(Stage::Normalize, StageState::Done);
        artifact_refs.insert(Stage::Normalize, nm_ref.clone());

        // ATTACHMENTS.
        let attachment_stage = AttachmentStage {
            store: self.stores.attachments.as_ref(),
            scanner: self.scanner.as_ref(),
            text_extractor: self.text_extractor.as_ref(),
        };
        let processed = attachment_stage
            .process(message_id, raw_attachments, ingested_at)
            .await?;
        let mut attachment_refs: Vec<ArtifactRef> = Vec::new();
        for artifact in &processed.artifacts {
            let (artifact_ref, outcome) = put_artifact(
                self.stores.artifacts.as_ref(),
                SCHEMA_ATTACHMENT,
                message_id,
                Stage::Attachments,
                artifact,
            )
            .await?;
            if outcome == PutOutcome::Written {
                self.audit
                    .append(AuditEventDraft::new(
                        message_id,
                        run_id,
                        Stage::Attachments,
                        raw_ref.clone(),
                        artifact_ref.clone(),
                    ))
                    .await?;
            }
            attachment_refs.push(artifact_ref);
        }
        stage_states.insert(Stage::Attachments, StageState::Done);

        let clean_texts = processed.clean_texts_c14n.clone();

        let identity_inputs: Vec<&ArtifactRef> =
            std::iter::once(&nm_ref).chain(attachment_refs.iter()).collect();

        // IDENTITY.
        let rules = RulesClassifier::new();
        let claim_hint = rules.claim_intent_hint(&nm);
        let resolver = IdentityResolver {
            config: &self.config,
            config_ref: &self.config_ref,
            directory: self.directory.as_ref(),
        };
        let mut resolver_output = resolver.resolve(&nm, &clean_texts, claim_hint).await?;
        resolver_output.result.run_id = run_id.to_string();
        let identity_job = job_id(
            message_id,
            Stage::Identity,
            &self.config_ref.sha256,
            None,
            &identity_inputs,
        );
        job_ids.insert(Stage::Identity, identity_job);
        let (identity_ref, outcome) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_IDENTITY_RESULT,
            message_id,
            Stage::Identity,
            &resolver_output.result,
        )
        .await?;
        if outcome == PutOutcome::Written {
            self.audit
                .append(
                    AuditEventDraft::new(
                        message_id,
                        run_id,
                        Stage::Identity,
                        nm_ref.clone(),
                        identity_ref.clone(),
                    )
                    .with_config_ref(self.config_ref.clone())
                    .with_decision_hash(resolver_output.result.decision_hash.clone())
                    .with_evidence(resolver_output.evidence.clone()),
                )
                .await?;
        }
        stage_states.insert(Stage::Identity, StageState::Done);
        artifact_refs.insert(Stage::Identity, identity_ref.clone());

        // CLASSIFY.
        let classifier = Classifier::new(
            &self.config,
            &self.config_ref,
            self.llm_provider.as_deref(),
            self.inference_cache.as_ref(),
        )
        .with_call_counter(&self.call_counter);
        let mut classify_output = classifier.classify(&nm, &processed.artifacts).await?;
        classify_output.result.run_id = run_id.to_string();
        job_ids.insert(
            Stage::Classify,
            job_id(message_id, Stage::Classify, &self.config_ref.sha256, None, &identity_inputs),
        );
        let (classify_ref, outcome) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_CLASSIFICATION_RESULT,
            message_id,
            Stage::Classify,
            &classify_output.result,
        )
        .await?;
        if outcome == PutOutcome::Written {
            let mut draft = AuditEventDraft::new(
                message_id,
                run_id,
                Stage::Classify,
                nm_ref.clone(),
                classify_ref.clone(),
            )
            .with_config_ref(self.config_ref.clone())
            .with_decision_hash(classify_output.result.decision_hash.clone());
            if let Some(model_ref) = classify_output.result.model_ref.clone() {
                draft = draft.with_model_ref(model_ref);
            }
            self.audit.append(draft).await?;
        }
        stage_states.insert(
            Stage::Classify,
            if classify_output.fail_closed_reason.is_some() {
                StageState::FailedClosed
            } else {
                StageState::Done
            },
        );
        artifact_refs.insert(Stage::Classify, classify_ref.clone());

        // EXTRACT.
        let extractor = Extractor::new(&self.config, self.directory.as_ref());
        let mut extraction = extractor.extract(&nm, &processed.artifacts).await?;
        if classify_output.llm_used && extraction.entities.is_empty() {
            let redactor = crate::llm::redaction::Redactor::new();
            extractor
                .llm_assist(
                    &nm,
                    &mut extraction,
                    self.llm_provider.as_deref(),
                    self.inference_cache.as_ref(),
                    self.config.determinism_mode,
                    &redactor,
                )
                .await?;
        }
        extraction.run_id = run_id.to_string();
        let (extract_ref, outcome) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_EXTRACTION_RESULT,
            message_id,
            Stage::Extract,
            &extraction,
        )
        .await?;
        if outcome == PutOutcome::Written {
            self.audit
                .append(AuditEventDraft::new(
                    message_id,
                    run_id,
                    Stage::Extract,
                    nm_ref.clone(),
                    extract_ref.clone(),
                ))
                .await?;
        }
        stage_states.insert(Stage::Extract, StageState::Done);
        artifact_refs.insert(Stage::Extract, extract_ref);

        // ROUTE.
        let mut decision = evaluate_routing(
            &self.config,
            &self.config_ref,
            &self.ruleset,
            &self.rules_ref,
            &RouteInputs {
                nm: &nm,
                identity: &resolver_output.result,
                classification: &classify_output.result,
                classify_fail_closed_reason: classify_output.fail_closed_reason.as_deref(),
                has_request_info_draft: resolver_output.request_info_draft.is_some(),
            },
        )?;
        decision.run_id = run_id.to_string();
        job_ids.insert(
            Stage::Route,
            job_id(
                message_id,
                Stage::Route,
                &self.config_ref.sha256,
                Some(&self.rules_ref.sha256),
                &[&identity_ref, &classify_ref],
            ),
        );
        let (route_ref, outcome) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_ROUTING_DECISION,
            message_id,
            Stage::Route,
            &decision,
        )
        .await?;
        if outcome == PutOutcome::Written {
            self.audit
                .append(
                    AuditEventDraft::new(
                        message_id,
                        run_id,
                        Stage::Route,
                        classify_ref.clone(),
                        route_ref.clone(),
                    )
                    .with_config_ref(self.config_ref.clone())
                    .with_rules_ref(self.rules_ref.clone())
                    .with_decision_hash(decision.decision_hash.clone()),
                )
                .await?;
        }
        stage_states.insert(Stage::Route, StageState::Done);
        artifact_refs.insert(Stage::Route, route_ref.clone());

        // CASE: side effects only when routing allows them.
        if decision.actions.contains(&Action::CreateCase) {
            self.execute_case_actions(message_id, run_id, &nm, &decision, &route_ref, &attachment_refs)
                .await?;
            stage_states.insert(Stage::Case, StageState::Done);
        }

        info!(
            message_id,
            run_id,
            queue = %decision.queue_id,
            "Run complete"
        );

        Ok(RunReport {
            message_id: message_id.to_string(),
            run_id: run_id.to_string(),
            nm,
            attachments: processed.artifacts,
            clean_texts,
            identity: resolver_output.result,
            classification: classify_output.result,
            classify_fail_closed_reason: classify_output.fail_closed_reason,
            extraction,
            decision,
            request_info_draft: resolver_output.request_info_draft,
            stage_states,
            job_ids,
            artifact_refs,
        })
    }

    async fn execute_case_actions(
        &self,
        message_id: &str,
        run_id: &str,
        nm: &NormalizedMessage,
        decision: &RoutingDecision,
        route_ref: &ArtifactRef,
        attachment_refs: &[ArtifactRef],
    ) -> Result<()> {
        let Some(case_adapter) = &self.case_adapter else {
            return Ok(());
        };
        let idempotency_key = case_idempotency_key(
            &nm.message_fingerprint,
            &decision.rule_id,
            &decision.ruleset_ref.version,
            "create_case",
        );
        let payload = json!({
            "queue_id": decision.queue_id,
            "sla_id": decision.sla_id,
            "priority": decision.priority,
            "subject": nm.subject,
            "from_email": nm.from_email,
        });
        let case_id = with_retry(&self.config.retry, "case.create_or_update", || {
            let payload = payload.clone();
            let key = idempotency_key.clone();
            async move {
                with_deadline(
                    self.config.deadlines.case_adapter(),
                    case_adapter.create_or_update(&key, payload),
                )
                .await
            }
        })
        .await
        .map_err(|e| StageError::dependency(Stage::Case, e.to_string()))?;

        if decision.actions.contains(&Action::AttachAllFiles) {
            for artifact_ref in attachment_refs {
                case_adapter
                    .attach(&case_id, artifact_ref)
                    .await
                    .map_err(|e| StageError::dependency(Stage::Case, e.to_string()))?;
            }
        }

        self.audit
            .append(AuditEventDraft::new(
                message_id,
                run_id,
                Stage::Case,
                route_ref.clone(),
                route_ref.clone(),
            ))
            .await?;
        Ok(())
    }

    /// Builds the schema-valid fail-closed outcome for a broken stage.
    async fn fail_closed_run(
        &self,
        message_id: &str,
        raw: &RawInboundMessage,
        run_id: &str,
        stage_error: StageError,
    ) -> Result<RunReport> {
        let queue_id = match stage_error.stage {
            Stage::Identity => Queue::IdentityReview,
            Stage::Classify => Queue::ClassificationReview,
            _ => Queue::IntakeReviewGeneral,
        };
        let raw_sha = jcs::sha256_prefixed(&raw.raw_mime_bytes);

        // A minimal normalized shell so the report and hash inputs stay
        // well-formed even when normalization itself broke.
        let nm = NormalizedMessage {
            message_id: message_id.to_string(),
            ingestion_source: "unknown".into(),
            ingested_at: Utc::now(),
            raw_mime_uri: format!("blob://{raw_sha}"),
            raw_mime_sha256: raw_sha,
            from_email: String::new(),
            from_display_name: None,
            reply_to_email: None,
            to_emails: vec![],
            cc_emails: vec![],
            subject: String::new(),
            body_text: String::new(),
            subject_c14n: String::new(),
            body_text_c14n: String::new(),
            language: "en".into(),
            thread_keys: Default::default(),
            attachment_ids: vec![],
            message_fingerprint: crate::canonical::text::message_fingerprint("", "", &[]),
        };

        let mut decision = RoutingDecision {
            message_id: message_id.to_string(),
            run_id: run_id.to_string(),
            queue_id,
            sla_id: Sla::OneBusinessDay,
            priority: 100,
            actions: vec![Action::AttachOriginalEmail],
            rule_id: "STAGE_FAIL_CLOSED".into(),
            ruleset_ref: self.rules_ref.clone(),
            fail_closed: true,
            fail_closed_reason: Some(stage_error.reason.clone()),
            decision_hash: String::new(),
            created_at: nm.ingested_at,
        };
        decision.validate()?;
        decision.decision_hash = crate::decision::decision_hash(&json!({
            "stage": stage_error.stage,
            "kind": stage_error.kind,
            "reason": stage_error.reason,
            "message_fingerprint": nm.message_fingerprint,
            "queue_id": decision.queue_id,
        }))?;

        let (route_ref, _) = put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_ROUTING_DECISION,
            message_id,
            Stage::Route,
            &decision,
        )
        .await?;
        self.audit
            .append(
                AuditEventDraft::new(
                    message_id,
                    run_id,
                    Stage::Route,
                    route_ref.clone(),
                    route_ref.clone(),
                )
                .with_config_ref(self.config_ref.clone())
                .with_decision_hash(decision.decision_hash.clone()),
            )
            .await
            .ok();

        let mut stage_states = BTreeMap::new();
        stage_states.insert(stage_error.stage, StageState::FailedClosed);

        Ok(RunReport {
            message_id: message_id.to_string(),
            run_id: run_id.to_string(),
            identity: IdentityResolutionResult {
                message_id: message_id.to_string(),
                run_id: run_id.to_string(),
                status: crate::registry::IdentityStatus::NeedsReview,
                selected: None,
                top_k: vec![],
                thresholds: crate::artifacts::ThresholdsOut {
                    confirmed_min_score: 0.0,
                    confirmed_min_margin: 0.0,
                    probable_min_score: 0.0,
                    probable_min_margin: 0.0,
                },
                status_reason: Some(stage_error.reason.clone()),
                decision_hash: decision.decision_hash.clone(),
                created_at: nm.ingested_at,
            },
            classification: ClassificationResult {
                message_id: message_id.to_string(),
                run_id: run_id.to_string(),
                intents: vec![],
                primary_intent: crate::artifacts::Labeled::new(
                    crate::registry::Intent::GeneralInquiry,
                    0.0,
                    vec![],
                ),
                product_line: crate::artifacts::Labeled::new(
                    crate::registry::ProductLine::Unknown,
                    0.0,
                    vec![],
                ),
                urgency: crate::artifacts::Labeled::new(
                    crate::registry::Urgency::Normal,
                    0.0,
                    vec![],
                ),
                risk_flags: vec![],
                rules_version: self.config.classification.rules_version.clone(),
                model_ref: None,
                decision_hash: decision.decision_hash.clone(),
                created_at: nm.ingested_at,
            },
            classify_fail_closed_reason: Some(stage_error.reason),
            extraction: ExtractionResult {
                message_id: message_id.to_string(),
                run_id: run_id.to_string(),
                entities: vec![],
                created_at: nm.ingested_at,
            },
            decision,
            request_info_draft: None,
            nm,
            attachments: vec![],
            clean_texts: vec![],
            stage_states,
            job_ids: BTreeMap::new(),
            artifact_refs: BTreeMap::new(),
        })
    }

    /// Replays a prior run's decision stages cache-only and compares
    /// decision hashes. New artifacts are versioned under the new run id;
    /// nothing is overwritten.
    pub async fn replay(&self, prior: &RunReport, new_run_id: &str) -> Result<ReplayReport> {
        let nm = &prior.nm;
        let mut comparisons = Vec::new();

        let rules = RulesClassifier::new();
        let claim_hint = rules.claim_intent_hint(nm);
        let resolver = IdentityResolver {
            config: &self.config,
            config_ref: &self.config_ref,
            directory: self.directory.as_ref(),
        };
        let mut identity = resolver
            .resolve(nm, &prior.clean_texts, claim_hint)
            .await?;
        identity.result.run_id = new_run_id.to_string();
        comparisons.push(ReplayComparison {
            stage: Stage::Identity,
            original: prior.identity.decision_hash.clone(),
            replayed: identity.result.decision_hash.clone(),
        });
        put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_IDENTITY_RESULT,
            &prior.message_id,
            Stage::Identity,
            &identity.result,
        )
        .await?;

        let classifier = Classifier::new(
            &self.config,
            &self.config_ref,
            None,
            self.inference_cache.as_ref(),
        )
        .with_cache_only();
        let mut classify_output = classifier.classify(nm, &prior.attachments).await?;
        classify_output.result.run_id = new_run_id.to_string();
        comparisons.push(ReplayComparison {
            stage: Stage::Classify,
            original: prior.classification.decision_hash.clone(),
            replayed: classify_output.result.decision_hash.clone(),
        });
        put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_CLASSIFICATION_RESULT,
            &prior.message_id,
            Stage::Classify,
            &classify_output.result,
        )
        .await?;

        let mut decision = evaluate_routing(
            &self.config,
            &self.config_ref,
            &self.ruleset,
            &self.rules_ref,
            &RouteInputs {
                nm,
                identity: &identity.result,
                classification: &classify_output.result,
                classify_fail_closed_reason: classify_output.fail_closed_reason.as_deref(),
                has_request_info_draft: identity.request_info_draft.is_some(),
            },
        )?;
        decision.run_id = new_run_id.to_string();
        comparisons.push(ReplayComparison {
            stage: Stage::Route,
            original: prior.decision.decision_hash.clone(),
            replayed: decision.decision_hash.clone(),
        });
        put_artifact(
            self.stores.artifacts.as_ref(),
            SCHEMA_ROUTING_DECISION,
            &prior.message_id,
            Stage::Route,
            &decision,
        )
        .await?;

        for comparison in &comparisons {
            if !comparison.matches() {
                warn!(
                    stage = %comparison.stage,
                    original = %comparison.original,
                    replayed = %comparison.replayed,
                    "Replay hash mismatch"
                );
            }
        }

        self.audit
            .append(AuditEventDraft::new(
                &prior.message_id,
                new_run_id,
                Stage::Reprocess,
                prior
                    .artifact_refs
                    .get(&Stage::Route)
                    .cloned()
                    .unwrap_or_else(|| {
                        ArtifactRef::new(SCHEMA_ROUTING_DECISION, "artifact://unknown", "sha256:0")
                    }),
                ArtifactRef::new(
                    SCHEMA_ROUTING_DECISION,
                    format!("replay://{new_run_id}"),
                    decision.decision_hash.clone(),
                ),
            ))
            .await
            .ok();

        Ok(ReplayReport {
            run_id: new_run_id.to_string(),
            comparisons,
        })
    }
}

/// Stable case idempotency key: re-delivery of the same routing outcome
/// never opens a second case.
pub fn case_idempotency_key(
    message_fingerprint: &str,
    rule_id: &str,
    ruleset_version: &str,
    operation: &str,
) -> String {
    let raw = format!("{message_fingerprint}|{rule_id}|{ruleset_version}|{operation}");
    format!("idem:{}", jcs::sha256_prefixed(raw.as_bytes()).trim_start_matches("sha256:"))
}

/// Broker-driven intake loop: fetch from the mail source, enqueue, and
/// drain. Delivery is at-least-once; the job key contract makes
/// re-processing idempotent at the artifact layer.
pub struct Dispatcher<'a> {
    pub orchestrator: &'a Orchestrator,
    pub mail: &'a dyn MailIngest,
    pub broker: &'a dyn Broker,
}

impl<'a> Dispatcher<'a> {
    /// Pulls new messages and enqueues one job per message.
    pub async fn ingest_batch(&self) -> Result<usize> {
        let messages = with_retry(&self.orchestrator.config.retry, "mail.fetch_new", || {
            self.mail.fetch_new()
        })
        .await
        .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;

        let count = messages.len();
        for message in messages {
            self.broker
                .enqueue(json!({
                    "source_message_id": message.source_message_id,
                }))
                .await
                .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
        }
        Ok(count)
    }

    /// Processes one queued job. Returns the report, or `None` when the
    /// queue is empty. Transport failures nack for redelivery; a
    /// poisoned job (unparseable payload) dead-letters.
    pub async fn run_once(&self, run_id: &str) -> Result<Option<RunReport>> {
        let Some((job, ack_token)) = self
            .broker
            .dequeue()
            .await
            .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?
        else {
            return Ok(None);
        };

        let Some(source_message_id) = job.get("source_message_id").and_then(|v| v.as_str()) else {
            warn!("Job without source_message_id, dead-lettering");
            self.broker
                .nack(&ack_token, true)
                .await
                .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
            return Ok(None);
        };

        let fetched = with_retry(&self.orchestrator.config.retry, "mail.fetch_new", || {
            self.mail.fetch_new()
        })
        .await;
        let raw = match fetched {
            Ok(messages) => messages
                .into_iter()
                .find(|m| m.source_message_id == source_message_id),
            Err(e) => {
                warn!(error = %e, "Mail source unavailable, nacking for redelivery");
                self.broker
                    .nack(&ack_token, false)
                    .await
                    .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
                return Ok(None);
            }
        };
        let Some(raw) = raw else {
            self.broker
                .nack(&ack_token, true)
                .await
                .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
            return Ok(None);
        };

        let attachments = self
            .mail
            .list_attachments(source_message_id)
            .await
            .unwrap_or_default();

        let report = self
            .orchestrator
            .process_message(&raw, &attachments, run_id)
            .await?;
        self.broker
            .ack(&ack_token)
            .await
            .map_err(|e| StageError::dependency(Stage::Ingest, e.to_string()))?;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_deterministic_and_input_sensitive() {
        let input = ArtifactRef::new("urn:ire:schema:test:1.0.0", "artifact://m/NORMALIZE/aa", "sha256:aa");
        let a = job_id("m", Stage::Identity, "sha256:cfg", None, &[&input]);
        let b = job_id("m", Stage::Identity, "sha256:cfg", None, &[&input]);
        assert_eq!(a, b);

        let other_input =
            ArtifactRef::new("urn:ire:schema:test:1.0.0", "artifact://m/NORMALIZE/bb", "sha256:bb");
        let c = job_id("m", Stage::Identity, "sha256:cfg", None, &[&other_input]);
        assert_ne!(a, c);

        let d = job_id("m", Stage::Route, "sha256:cfg", Some("sha256:rules"), &[&input]);
        assert_ne!(a, d);
    }

    #[test]
    fn stage_state_transitions() {
        assert!(StageState::Pending.can_transition_to(StageState::Running));
        assert!(StageState::Running.can_transition_to(StageState::Done));
        assert!(StageState::Running.can_transition_to(StageState::FailedClosed));
        assert!(!StageState::Done.can_transition_to(StageState::Running));
        assert!(!StageState::FailedClosed.can_transition_to(StageState::Done));
        assert!(!StageState::Pending.can_transition_to(StageState::Done));
    }

    #[test]
    fn message_ids_are_stable() {
        assert_eq!(derive_message_id("imap:42"), derive_message_id("imap:42"));
        assert_ne!(derive_message_id("imap:42"), derive_message_id("imap:43"));
    }

    #[test]
    fn case_idempotency_key_shape() {
        let key = case_idempotency_key("sha256:fp", "CLAIMS_AUTO", "routes-1", "create_case");
        assert!(key.starts_with("idem:"));
        assert_eq!(
            key,
            case_idempotency_key("sha256:fp", "CLAIMS_AUTO", "routes-1", "create_case")
        );
        assert_ne!(
            key,
            case_idempotency_key("sha256:fp", "CLAIMS_AUTO", "routes-2", "create_case")
        );
    }
}
