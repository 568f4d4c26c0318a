//! The routing evaluator.
//!
//! A pure decision over the classified message. Overrides apply in a fixed
//! order before any table rule: incident force-review, hard risk overrides
//! in canonical order, classification fail-closed, privacy/GDPR, identity
//! needs-review, unknown-product review, then the versioned table, then
//! the fail-closed fallback. A post-pass enforces the incident
//! block-case-create flags.

use tracing::info;

use crate::artifacts::{
    ClassificationResult, IdentityResolutionResult, NormalizedMessage, RoutingDecision, RulesetRef,
};
use crate::config::{ConfigRef, ConfigSnapshot};
use crate::decision;
use crate::error::Result;
use crate::registry::{Action, IdentityStatus, Intent, ProductLine, Queue, RiskFlag, Sla};
use crate::route::ruleset::{RouteTarget, RoutingContext, RoutingRuleset};

/// Everything the evaluator reads.
pub struct RouteInputs<'a> {
    pub nm: &'a NormalizedMessage,
    pub identity: &'a IdentityResolutionResult,
    pub classification: &'a ClassificationResult,
    /// Set when the classify stage failed closed; routes to review.
    pub classify_fail_closed_reason: Option<&'a str>,
    /// Whether the identity stage produced a request-info draft.
    pub has_request_info_draft: bool,
}

struct Resolution {
    rule_id: String,
    target: RouteTarget,
}

fn resolution(rule_id: &str, target: RouteTarget) -> Option<Resolution> {
    Some(Resolution {
        rule_id: rule_id.to_string(),
        target,
    })
}

fn review_target(queue_id: Queue, sla_id: Sla, reason: &str) -> RouteTarget {
    RouteTarget {
        queue_id,
        sla_id,
        priority: 100,
        actions: vec![Action::AttachOriginalEmail],
        fail_closed: true,
        fail_closed_reason: Some(reason.to_string()),
    }
}

/// Hard risk override table, consulted in the canonical flag order. Flags
/// without an entry fall through to normal routing.
fn risk_override(flag: RiskFlag) -> Option<Resolution> {
    match flag {
        RiskFlag::SecurityMalware => resolution(
            "RISK_OVERRIDE_SECURITY_MALWARE",
            RouteTarget {
                queue_id: Queue::SecurityReview,
                sla_id: Sla::OneHour,
                priority: 100,
                actions: vec![Action::BlockCaseCreate, Action::AttachOriginalEmail],
                fail_closed: true,
                fail_closed_reason: Some("security_override".into()),
            },
        ),
        RiskFlag::Regulatory => resolution(
            "RISK_OVERRIDE_REGULATORY",
            RouteTarget {
                queue_id: Queue::Complaints,
                sla_id: Sla::OneHour,
                priority: 95,
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                fail_closed: false,
                fail_closed_reason: None,
            },
        ),
        RiskFlag::LegalThreat => resolution(
            "RISK_OVERRIDE_LEGAL_THREAT",
            RouteTarget {
                queue_id: Queue::Legal,
                sla_id: Sla::OneHour,
                priority: 95,
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                fail_closed: false,
                fail_closed_reason: None,
            },
        ),
        RiskFlag::FraudSignal => resolution(
            "RISK_OVERRIDE_FRAUD_SIGNAL",
            RouteTarget {
                queue_id: Queue::Fraud,
                sla_id: Sla::FourHours,
                priority: 90,
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                fail_closed: false,
                fail_closed_reason: None,
            },
        ),
        RiskFlag::SelfHarmThreat | RiskFlag::ThreatViolence => resolution(
            "RISK_OVERRIDE_HUMAN_ESCALATION",
            RouteTarget {
                queue_id: Queue::IntakeReviewGeneral,
                sla_id: Sla::OneHour,
                priority: 100,
                actions: vec![Action::HumanEscalation, Action::AttachOriginalEmail],
                fail_closed: true,
                fail_closed_reason: Some("human_escalation_required".into()),
            },
        ),
        RiskFlag::LanguageUnsupported => resolution(
            "RISK_OVERRIDE_LANGUAGE_UNSUPPORTED",
            review_target(
                Queue::IntakeReviewGeneral,
                Sla::OneBusinessDay,
                "language_unsupported",
            ),
        ),
        RiskFlag::AutoreplyLoop | RiskFlag::PrivacySensitive | RiskFlag::MediaPress => None,
    }
}

fn resolve(ruleset: &RoutingRuleset, config: &ConfigSnapshot, inputs: &RouteInputs<'_>) -> Resolution {
    let ctx = RoutingContext {
        identity_status: inputs.identity.status,
        primary_intent: inputs.classification.primary_intent.label,
        product_line: inputs.classification.product_line.label,
        urgency: inputs.classification.urgency.label,
        risk_flags: inputs.classification.risk_flag_labels(),
    };

    // 1. Incident gate.
    if config.incident.force_review {
        return Resolution {
            rule_id: "INCIDENT_FORCE_REVIEW".into(),
            target: review_target(
                config.incident.force_review_queue_id,
                Sla::OneBusinessDay,
                "incident_force_review",
            ),
        };
    }

    // 2. Hard risk overrides, first present flag in canonical order.
    for flag in RiskFlag::ALL {
        if ctx.risk_flags.contains(flag) {
            if let Some(found) = risk_override(*flag) {
                return found;
            }
        }
    }

    // 3. Classification failed closed.
    if let Some(reason) = inputs.classify_fail_closed_reason {
        return Resolution {
            rule_id: "CLASSIFY_FAIL_CLOSED".into(),
            target: review_target(Queue::ClassificationReview, Sla::OneBusinessDay, reason),
        };
    }

    // 4. Privacy / GDPR.
    if ctx.primary_intent == Intent::GdprRequest {
        return Resolution {
            rule_id: "PRIVACY_DSR".into(),
            target: RouteTarget {
                queue_id: Queue::PrivacyDsr,
                sla_id: Sla::OneBusinessDay,
                priority: 90,
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                fail_closed: false,
                fail_closed_reason: None,
            },
        };
    }

    // 5. Identity needs review: no case, ask for information.
    if matches!(
        ctx.identity_status,
        IdentityStatus::NeedsReview | IdentityStatus::NoCandidate
    ) {
        let mut actions = vec![Action::AttachOriginalEmail];
        if inputs.has_request_info_draft {
            actions.push(Action::AddRequestInfoDraft);
        }
        return Resolution {
            rule_id: "IDENTITY_REVIEW".into(),
            target: RouteTarget {
                queue_id: Queue::IdentityReview,
                sla_id: Sla::OneBusinessDay,
                priority: 80,
                actions,
                fail_closed: false,
                fail_closed_reason: None,
            },
        };
    }

    // 6. Unknown product on work that needs one.
    let product_bound = matches!(
        ctx.primary_intent,
        Intent::ClaimNew | Intent::ClaimUpdate | Intent::PolicyCancellation | Intent::PolicyChange
    );
    if ctx.product_line == ProductLine::Unknown
        && product_bound
        && ctx.identity_status != IdentityStatus::Confirmed
    {
        return Resolution {
            rule_id: "UNKNOWN_PRODUCT_REVIEW".into(),
            target: review_target(
                Queue::UnknownProductReview,
                Sla::OneBusinessDay,
                "unknown_product",
            ),
        };
    }

    // 7. The table.
    if let Some(rule) = ruleset.first_match(&ctx) {
        return Resolution {
            rule_id: rule.rule_id.clone(),
            target: rule.then.clone(),
        };
    }

    // 8. Fail-closed fallback.
    Resolution {
        rule_id: "ROUTE_FALLBACK".into(),
        target: ruleset.fallback.clone(),
    }
}

/// Evaluates routing for one run and computes the decision hash.
pub fn evaluate_routing(
    config: &ConfigSnapshot,
    config_ref: &ConfigRef,
    ruleset: &RoutingRuleset,
    rules_ref: &RulesetRef,
    inputs: &RouteInputs<'_>,
) -> Result<RoutingDecision> {
    let Resolution { rule_id, mut target } = resolve(ruleset, config, inputs);

    // Post-pass: incident block-case-create flags strip CREATE_CASE.
    let flags = inputs.classification.risk_flag_labels();
    if config
        .incident
        .block_case_create_risk_flags_any
        .iter()
        .any(|f| flags.contains(f))
    {
        target.actions.retain(|a| *a != Action::CreateCase);
        if !target.actions.contains(&Action::BlockCaseCreate) {
            target.actions.insert(0, Action::BlockCaseCreate);
        }
        target.fail_closed = true;
        if target.fail_closed_reason.is_none() {
            target.fail_closed_reason = Some("incident_block_case_create".into());
        }
    }

    let mut decision = RoutingDecision {
        message_id: inputs.nm.message_id.clone(),
        run_id: String::new(),
        queue_id: target.queue_id,
        sla_id: target.sla_id,
        priority: target.priority,
        actions: target.actions,
        rule_id,
        ruleset_ref: rules_ref.clone(),
        fail_closed: target.fail_closed,
        fail_closed_reason: target.fail_closed_reason,
        decision_hash: String::new(),
        created_at: inputs.nm.ingested_at,
    };
    decision.validate()?;

    let input = decision::route_decision_input(
        config,
        config_ref,
        &inputs.nm.message_fingerprint,
        &inputs.nm.raw_mime_sha256,
        rules_ref,
        inputs.identity,
        inputs.classification,
        &decision,
    );
    decision.decision_hash = decision::decision_hash(&input)?;

    info!(
        message_id = %inputs.nm.message_id,
        queue = %decision.queue_id,
        rule = %decision.rule_id,
        fail_closed = decision.fail_closed,
        "Routing decided"
    );
    Ok(decision)
}
