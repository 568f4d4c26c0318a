//! The identity resolver: signals → weighted scores → ranked candidates →
//! status.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::adapters::{with_deadline, DirectoryAdapter, DirectoryRecord, RecordStatus};
use crate::artifacts::{
    EvidenceSpan, IdentityCandidate, IdentityResolutionResult, NormalizedMessage, Signal,
    ThresholdsOut,
};
use crate::canonical::text::normalized_levenshtein;
use crate::config::{ConfigRef, ConfigSnapshot, SignalStrength};
use crate::decision;
use crate::error::{DirectoryError, Result};
use crate::identity::signals::{IdentifierHit, IdentifierPatterns};
use crate::identity::render_request_info_draft;
use crate::registry::{CandidateType, EvidenceSource, IdentityStatus};

/// Resolver output: the artifact plus the review draft and the evidence
/// spans the audit event carries.
#[derive(Debug, Clone)]
pub struct ResolverOutput {
    pub result: IdentityResolutionResult,
    pub request_info_draft: Option<String>,
    pub evidence: Vec<EvidenceSpan>,
}

/// A candidate under construction, before ranking strips the working
/// fields.
struct CandidateDraft {
    entity_type: CandidateType,
    entity_id: String,
    record_status: RecordStatus,
    holder_name: Option<String>,
    signals: Vec<Signal>,
    specs: Vec<(Decimal, SignalStrength)>,
    evidence: Vec<EvidenceSpan>,
}

impl CandidateDraft {
    fn has_hard(&self) -> bool {
        self.specs.iter().any(|(_, s)| *s == SignalStrength::Hard)
    }
}

/// Identity resolver bound to one config snapshot and directory.
pub struct IdentityResolver<'a> {
    pub config: &'a ConfigSnapshot,
    pub config_ref: &'a ConfigRef,
    pub directory: &'a dyn DirectoryAdapter,
}

impl<'a> IdentityResolver<'a> {
    /// Resolves the sender/contract identity of one message.
    ///
    /// `attachment_texts` are `(attachment_id, canonical_text)` pairs of
    /// CLEAN attachments only. `claim_intent_hint` steers the entity-type
    /// tie-break for claim-shaped messages.
    pub async fn resolve(
        &self,
        nm: &NormalizedMessage,
        attachment_texts: &[(String, String)],
        claim_intent_hint: bool,
    ) -> Result<ResolverOutput> {
        match self
            .gather_candidates(nm, attachment_texts)
            .await
        {
            Ok(drafts) => self.rank_and_derive(nm, drafts, claim_intent_hint),
            Err(e) => {
                warn!(
                    message_id = %nm.message_id,
                    error = %e,
                    "Directory unavailable, identity needs review"
                );
                self.unavailable_output(nm)
            }
        }
    }

    async fn lookup<F, Fut>(&self, call: F) -> std::result::Result<Option<DirectoryRecord>, DirectoryError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Option<DirectoryRecord>, DirectoryError>>,
    {
        with_deadline(self.config.deadlines.directory(), call()).await
    }

    async fn gather_candidates(
        &self,
        nm: &NormalizedMessage,
        attachment_texts: &[(String, String)],
    ) -> std::result::Result<Vec<CandidateDraft>, DirectoryError> {
        let patterns = IdentifierPatterns::new();

        let mut claim_hit = patterns.find_claim_number(&nm.subject_c14n, &nm.body_text_c14n);
        let mut policy_hit = patterns.find_policy_number(&nm.subject_c14n, &nm.body_text_c14n);

        // Attachment text is consulted only when the message itself gave
        // nothing; spans then point into the attachment's canonical text.
        if claim_hit.is_none() && policy_hit.is_none() {
            for (attachment_id, text) in attachment_texts {
                let found_claim = patterns.find_claim_number("", text);
                let found_policy = patterns.find_policy_number("", text);
                claim_hit = found_claim.map(|h| with_attachment(h, attachment_id));
                policy_hit = found_policy.map(|h| with_attachment(h, attachment_id));
                if claim_hit.is_some() || policy_hit.is_some() {
                    break;
                }
            }
        }

        let mut drafts = Vec::new();

        if let Some(hit) = &claim_hit {
            if let Some(record) = self
                .lookup(|| self.directory.lookup_claim(&hit.value))
                .await?
            {
                let mut draft = self.new_draft(CandidateType::Claim, record);
                self.add_signal(&mut draft, "SIG_CLAIM_NUMBER_LOOKUP_MATCH", Some(hit.value.clone()))?;
                self.add_thread_linkage(&mut draft, nm, hit)?;
                self.add_fuzzy_name_match(&mut draft, nm)?;
                draft.evidence.push(evidence_span(hit));
                drafts.push(draft);
            }
        }

        if let Some(hit) = &policy_hit {
            if let Some(record) = self
                .lookup(|| self.directory.lookup_policy(&hit.value))
                .await?
            {
                let mut draft = self.new_draft(CandidateType::Policy, record);
                self.add_signal(&mut draft, "SIG_POLICY_NUMBER_LOOKUP_MATCH", Some(hit.value.clone()))?;

                if !nm.from_email.is_empty() {
                    let linked = with_deadline(
                        self.config.deadlines.directory(),
                        self.directory.policy_numbers_for_sender(&nm.from_email),
                    )
                    .await?;
                    if linked.iter().any(|p| *p == hit.value) {
                        self.add_signal(
                            &mut draft,
                            "SIG_SENDER_EMAIL_MATCH",
                            Some(nm.from_email.clone()),
                        )?;
                    }
                }
                self.add_thread_linkage(&mut draft, nm, hit)?;
                self.add_fuzzy_name_match(&mut draft, nm)?;
                draft.evidence.push(evidence_span(hit));
                drafts.push(draft);
            }
        }

        // Sender-only resolution: the registered customer for the from
        // address, a medium signal at best.
        if let Some(record) = self
            .lookup(|| self.directory.lookup_customer_by_email(&nm.from_email))
            .await?
        {
            let mut draft = self.new_draft(CandidateType::Customer, record);
            self.add_signal(&mut draft, "SIG_SENDER_EMAIL_MATCH", Some(nm.from_email.clone()))?;
            self.add_fuzzy_name_match(&mut draft, nm)?;
            drafts.push(draft);
        }

        Ok(drafts)
    }

    fn new_draft(&self, entity_type: CandidateType, record: DirectoryRecord) -> CandidateDraft {
        CandidateDraft {
            entity_type,
            entity_id: record.entity_id,
            record_status: record.status,
            holder_name: record.display_name,
            signals: Vec::new(),
            specs: Vec::new(),
            evidence: Vec::new(),
        }
    }

    fn add_signal(
        &self,
        draft: &mut CandidateDraft,
        name: &str,
        value: Option<String>,
    ) -> std::result::Result<(), DirectoryError> {
        let spec = self
            .config
            .identity
            .signal_weights
            .get(name)
            .ok_or_else(|| DirectoryError::Unavailable(format!("missing signal spec {name}")))?;
        draft.specs.push((spec.weight, spec.strength));
        draft.signals.push(Signal {
            name: name.to_string(),
            value,
            weight: decimal_to_f64(spec.weight),
            strength: spec.strength,
        });
        Ok(())
    }

    /// Reply into an existing conversation whose subject carries the
    /// identifier: medium continuity signal.
    fn add_thread_linkage(
        &self,
        draft: &mut CandidateDraft,
        nm: &NormalizedMessage,
        hit: &IdentifierHit,
    ) -> std::result::Result<(), DirectoryError> {
        if nm.thread_keys.in_reply_to.is_some() && hit.source == EvidenceSource::Subject {
            self.add_signal(draft, "SIG_THREAD_LINKAGE", nm.thread_keys.in_reply_to.clone())?;
        }
        Ok(())
    }

    /// Fuzzy match between the sender display name and the registered
    /// holder name. Soft signal; threshold from config.
    fn add_fuzzy_name_match(
        &self,
        draft: &mut CandidateDraft,
        nm: &NormalizedMessage,
    ) -> std::result::Result<(), DirectoryError> {
        let (Some(sender), Some(holder)) = (nm.from_display_name.clone(), draft.holder_name.clone())
        else {
            return Ok(());
        };
        let similarity = normalized_levenshtein(&sender, &holder);
        if similarity >= self.config.identity.fuzzy_match_threshold {
            self.add_signal(draft, "SIG_SIGNATURE_ADDRESS_MATCH", Some(holder))?;
        }
        Ok(())
    }

    fn rank_and_derive(
        &self,
        nm: &NormalizedMessage,
        mut drafts: Vec<CandidateDraft>,
        claim_intent_hint: bool,
    ) -> Result<ResolverOutput> {
        let identity = &self.config.identity;
        let shared_mailbox = self
            .config
            .shared_mailboxes
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&nm.from_email));

        let mut scored: Vec<(Decimal, CandidateDraft)> = drafts
            .drain(..)
            .map(|draft| {
                let mut raw: Decimal = draft
                    .specs
                    .iter()
                    .map(|(weight, strength)| *weight * strength.multiplier())
                    .sum();
                if shared_mailbox {
                    raw -= identity.shared_mailbox_penalty;
                }
                let clamped = raw.clamp(Decimal::ZERO, Decimal::ONE);
                let score =
                    clamped.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
                (score, draft)
            })
            .collect();

        // Deterministic ranking: hard signals, entity-type preference,
        // directory lifecycle, score, lexicographic id.
        scored.sort_by(|(score_a, a), (score_b, b)| {
            b.has_hard()
                .cmp(&a.has_hard())
                .then_with(|| {
                    type_preference(a.entity_type, claim_intent_hint)
                        .cmp(&type_preference(b.entity_type, claim_intent_hint))
                })
                .then_with(|| active_rank(a.record_status).cmp(&active_rank(b.record_status)))
                .then_with(|| score_b.cmp(score_a))
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let thresholds = ThresholdsOut {
            confirmed_min_score: decimal_to_f64(identity.thresholds.confirmed_min_score),
            confirmed_min_margin: decimal_to_f64(identity.thresholds.confirmed_min_margin),
            probable_min_score: decimal_to_f64(identity.thresholds.probable_min_score),
            probable_min_margin: decimal_to_f64(identity.thresholds.probable_min_margin),
        };

        let (status, status_reason, selected_idx) = if scored.is_empty() {
            (IdentityStatus::NoCandidate, None, None)
        } else {
            let top_score = scored[0].0;
            let second_score = scored.get(1).map(|(s, _)| *s).unwrap_or(Decimal::ZERO);
            let margin = top_score - second_score;
            let top = &scored[0].1;
            let has_hard = top.has_hard();
            let has_medium = top
                .specs
                .iter()
                .any(|(_, s)| *s == SignalStrength::Medium);

            if has_hard
                && top_score >= identity.thresholds.confirmed_min_score
                && margin >= identity.thresholds.confirmed_min_margin
            {
                (IdentityStatus::Confirmed, None, Some(0))
            } else if has_medium
                && top_score >= identity.thresholds.probable_min_score
                && margin >= identity.thresholds.probable_min_margin
            {
                (IdentityStatus::Probable, None, Some(0))
            } else {
                (
                    IdentityStatus::NeedsReview,
                    Some("ambiguous_or_soft_only".to_string()),
                    None,
                )
            }
        };

        let top_k: Vec<IdentityCandidate> = scored
            .iter()
            .take(identity.top_k)
            .enumerate()
            .map(|(idx, (score, draft))| IdentityCandidate {
                rank: idx + 1,
                entity_type: draft.entity_type,
                entity_id: draft.entity_id.clone(),
                score: decimal_to_f64(*score),
                signals: draft.signals.clone(),
                evidence: draft.evidence.clone(),
            })
            .collect();

        let selected = selected_idx.map(|idx| top_k[idx].clone());
        let evidence: Vec<EvidenceSpan> = top_k
            .iter()
            .flat_map(|c| c.evidence.iter().cloned())
            .collect();

        let mut result = IdentityResolutionResult {
            message_id: nm.message_id.clone(),
            run_id: String::new(),
            status,
            selected,
            top_k,
            thresholds,
            status_reason,
            decision_hash: String::new(),
            created_at: nm.ingested_at,
        };
        let input = decision::identity_decision_input(
            self.config,
            self.config_ref,
            &nm.message_fingerprint,
            &nm.raw_mime_sha256,
            &result,
        );
        result.decision_hash = decision::decision_hash(&input)?;

        let request_info_draft = match result.status {
            IdentityStatus::NeedsReview | IdentityStatus::NoCandidate => {
                Some(render_request_info_draft(&nm.language))
            }
            _ => None,
        };

        if matches!(result.status, IdentityStatus::Confirmed | IdentityStatus::Probable) {
            info!(
                message_id = %nm.message_id,
                status = %result.status,
                entity = ?result.selected.as_ref().map(|c| (&c.entity_type, &c.entity_id)),
                "Identity resolved"
            );
        } else {
            debug!(message_id = %nm.message_id, status = %result.status, "Identity unresolved");
        }

        Ok(ResolverOutput {
            result,
            request_info_draft,
            evidence,
        })
    }

    /// Directory down: never CONFIRMED, always review.
    fn unavailable_output(&self, nm: &NormalizedMessage) -> Result<ResolverOutput> {
        let identity = &self.config.identity;
        let mut result = IdentityResolutionResult {
            message_id: nm.message_id.clone(),
            run_id: String::new(),
            status: IdentityStatus::NeedsReview,
            selected: None,
            top_k: Vec::new(),
            thresholds: ThresholdsOut {
                confirmed_min_score: decimal_to_f64(identity.thresholds.confirmed_min_score),
                confirmed_min_margin: decimal_to_f64(identity.thresholds.confirmed_min_margin),
                probable_min_score: decimal_to_f64(identity.thresholds.probable_min_score),
                probable_min_margin: decimal_to_f64(identity.thresholds.probable_min_margin),
            },
            status_reason: Some("directory_unavailable".to_string()),
            decision_hash: String::new(),
            created_at: nm.ingested_at,
        };
        let input = decision::identity_decision_input(
            self.config,
            self.config_ref,
            &nm.message_fingerprint,
            &nm.raw_mime_sha256,
            &result,
        );
        result.decision_hash = decision::decision_hash(&input)?;
        Ok(ResolverOutput {
            request_info_draft: Some(render_request_info_draft(&nm.language)),
            result,
            evidence: Vec::new(),
        })
    }
}

fn with_attachment(mut hit: IdentifierHit, attachment_id: &str) -> IdentifierHit {
    hit.source = EvidenceSource::AttachmentText;
    hit.attachment_id = Some(attachment_id.to_string());
    hit
}

fn evidence_span(hit: &IdentifierHit) -> EvidenceSpan {
    EvidenceSpan {
        source: hit.source,
        start: hit.start,
        end: hit.end,
        snippet_redacted: hit.snippet.clone(),
        snippet_sha256: crate::canonical::jcs::snippet_sha256(&hit.snippet),
        attachment_id: hit.attachment_id.clone(),
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Entity-type preference for the ranking tie-break.
fn type_preference(entity_type: CandidateType, claim_intent: bool) -> usize {
    let order: &[CandidateType] = if claim_intent {
        &[
            CandidateType::Claim,
            CandidateType::Policy,
            CandidateType::Customer,
            CandidateType::Contact,
            CandidateType::Broker,
        ]
    } else {
        &[
            CandidateType::Policy,
            CandidateType::Customer,
            CandidateType::Claim,
            CandidateType::Contact,
            CandidateType::Broker,
        ]
    };
    order.iter().position(|t| *t == entity_type).unwrap_or(order.len())
}

fn active_rank(status: RecordStatus) -> usize {
    match status {
        RecordStatus::Active => 0,
        RecordStatus::Closed => 1,
    }
}
