//! The versioned routing decision table.
//!
//! Rules are data: a condition over the routing context and a target.
//! Evaluation is first-match by descending priority. The table covers the
//! product/intent matrix only; incident gates, risk overrides, privacy
//! and identity-review handling run before the table in the evaluator.
//! The table's canonical-JSON digest is pinned into every route decision.

use serde::{Deserialize, Serialize};

use crate::artifacts::RulesetRef;
use crate::canonical::jcs;
use crate::error::{Result, RouteError, ValidationError};
use crate::registry::{Action, IdentityStatus, Intent, ProductLine, Queue, RiskFlag, Sla, Urgency};

/// What a matched rule routes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub queue_id: Queue,
    pub sla_id: Sla,
    pub priority: i32,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub fail_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_closed_reason: Option<String>,
}

/// Condition over the routing context. Empty lists mean "don't care".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteCondition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_intent_in: Vec<Intent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_line_in: Vec<ProductLine>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urgency_in: Vec<Urgency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_status_in: Vec<IdentityStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_flags_any: Vec<RiskFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_flags_not_any: Vec<RiskFlag>,
}

/// The context a rule matches against.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub identity_status: IdentityStatus,
    pub primary_intent: Intent,
    pub product_line: ProductLine,
    pub urgency: Urgency,
    pub risk_flags: Vec<RiskFlag>,
}

impl RouteCondition {
    pub fn matches(&self, ctx: &RoutingContext) -> bool {
        if !self.primary_intent_in.is_empty()
            && !self.primary_intent_in.contains(&ctx.primary_intent)
        {
            return false;
        }
        if !self.product_line_in.is_empty() && !self.product_line_in.contains(&ctx.product_line) {
            return false;
        }
        if !self.urgency_in.is_empty() && !self.urgency_in.contains(&ctx.urgency) {
            return false;
        }
        if !self.identity_status_in.is_empty()
            && !self.identity_status_in.contains(&ctx.identity_status)
        {
            return false;
        }
        if !self.risk_flags_any.is_empty()
            && !self.risk_flags_any.iter().any(|f| ctx.risk_flags.contains(f))
        {
            return false;
        }
        if self
            .risk_flags_not_any
            .iter()
            .any(|f| ctx.risk_flags.contains(f))
        {
            return false;
        }
        true
    }
}

/// One table rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub rule_id: String,
    pub priority: i32,
    pub when: RouteCondition,
    pub then: RouteTarget,
}

/// The versioned table with its fail-closed fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleset {
    pub version: String,
    pub rules: Vec<RouteRule>,
    pub fallback: RouteTarget,
}

impl RoutingRuleset {
    /// Validates the table and computes its pinned reference.
    pub fn seal(&self, path: impl Into<String>) -> Result<RulesetRef> {
        let mut seen = std::collections::BTreeSet::new();
        for rule in &self.rules {
            if rule.rule_id.is_empty() {
                return Err(RouteError::InvalidRuleset {
                    version: self.version.clone(),
                    reason: "rule with empty rule_id".into(),
                }
                .into());
            }
            if !seen.insert(rule.rule_id.clone()) {
                return Err(RouteError::InvalidRuleset {
                    version: self.version.clone(),
                    reason: format!("duplicate rule_id {}", rule.rule_id),
                }
                .into());
            }
        }
        if !self.fallback.fail_closed {
            return Err(RouteError::InvalidRuleset {
                version: self.version.clone(),
                reason: "fallback must be fail-closed".into(),
            }
            .into());
        }
        let value = serde_json::to_value(self).map_err(ValidationError::Json)?;
        Ok(RulesetRef {
            path: path.into(),
            sha256: jcs::canonical_sha256(&value)?,
            version: self.version.clone(),
        })
    }

    /// First match by descending priority; ties break by rule_id so the
    /// table evaluates identically regardless of declaration order.
    pub fn first_match(&self, ctx: &RoutingContext) -> Option<&RouteRule> {
        let mut rules: Vec<&RouteRule> = self.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.rule_id.cmp(&b.rule_id)));
        rules.into_iter().find(|rule| rule.when.matches(ctx))
    }
}

/// The built-in product/intent table.
pub fn default_ruleset(version: &str) -> RoutingRuleset {
    let case_actions = vec![
        Action::CreateCase,
        Action::AttachOriginalEmail,
        Action::AttachAllFiles,
    ];
    let rule = |rule_id: &str, priority, when, then| RouteRule {
        rule_id: rule_id.to_string(),
        priority,
        when,
        then,
    };
    let target = |queue_id, sla_id, priority, actions: &[Action]| RouteTarget {
        queue_id,
        sla_id,
        priority,
        actions: actions.to_vec(),
        fail_closed: false,
        fail_closed_reason: None,
    };

    let rules = vec![
        rule(
            "CLAIMS_AUTO",
            90,
            RouteCondition {
                primary_intent_in: vec![Intent::ClaimNew, Intent::ClaimUpdate],
                product_line_in: vec![ProductLine::Auto],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: case_actions.clone(),
                ..target(Queue::ClaimsAuto, Sla::FourHours, 90, &[])
            },
        ),
        rule(
            "CLAIMS_PROPERTY",
            85,
            RouteCondition {
                primary_intent_in: vec![Intent::ClaimNew, Intent::ClaimUpdate],
                product_line_in: vec![ProductLine::Property, ProductLine::Household],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: case_actions.clone(),
                ..target(Queue::ClaimsProperty, Sla::FourHours, 85, &[])
            },
        ),
        rule(
            "CLAIMS_GENERAL",
            80,
            RouteCondition {
                primary_intent_in: vec![Intent::ClaimNew, Intent::ClaimUpdate],
                product_line_in: vec![
                    ProductLine::Liability,
                    ProductLine::Life,
                    ProductLine::Health,
                    ProductLine::Accident,
                    ProductLine::LegalProtection,
                    ProductLine::Travel,
                    ProductLine::Commercial,
                ],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: case_actions.clone(),
                ..target(Queue::ClaimsGeneral, Sla::FourHours, 80, &[])
            },
        ),
        rule(
            "COMPLAINTS",
            70,
            RouteCondition {
                primary_intent_in: vec![Intent::Complaint],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::Complaints, Sla::OneBusinessDay, 70, &[])
            },
        ),
        rule(
            "LEGAL",
            70,
            RouteCondition {
                primary_intent_in: vec![Intent::Legal],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::Legal, Sla::OneBusinessDay, 70, &[])
            },
        ),
        rule(
            "POLICY_SERVICE",
            60,
            RouteCondition {
                primary_intent_in: vec![Intent::PolicyCancellation, Intent::PolicyChange],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::PolicyService, Sla::OneBusinessDay, 60, &[])
            },
        ),
        rule(
            "BILLING",
            60,
            RouteCondition {
                primary_intent_in: vec![Intent::BillingQuestion],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::Billing, Sla::OneBusinessDay, 60, &[])
            },
        ),
        rule(
            "DOCUMENT_INTAKE",
            55,
            RouteCondition {
                primary_intent_in: vec![Intent::DocumentSubmission],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: case_actions.clone(),
                ..target(Queue::DocumentIntake, Sla::OneBusinessDay, 55, &[])
            },
        ),
        rule(
            "COVERAGE_ADVICE",
            50,
            RouteCondition {
                primary_intent_in: vec![Intent::CoverageQuestion],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::CoverageAdvice, Sla::ThreeBusinessDays, 50, &[])
            },
        ),
        rule(
            "BROKER_DESK",
            50,
            RouteCondition {
                primary_intent_in: vec![Intent::BrokerIntermediary],
                ..RouteCondition::default()
            },
            RouteTarget {
                actions: vec![Action::CreateCase, Action::AttachOriginalEmail],
                ..target(Queue::BrokerDesk, Sla::OneBusinessDay, 50, &[])
            },
        ),
        rule(
            "TECHNICAL_OPS",
            40,
            RouteCondition {
                primary_intent_in: vec![Intent::Technical],
                ..RouteCondition::default()
            },
            // Bounce notifications never open cases.
            target(
                Queue::TechnicalOps,
                Sla::ThreeBusinessDays,
                40,
                &[Action::AttachOriginalEmail],
            ),
        ),
    ];

    RoutingRuleset {
        version: version.to_string(),
        rules,
        fallback: RouteTarget {
            queue_id: Queue::IntakeReviewGeneral,
            sla_id: Sla::OneBusinessDay,
            priority: 0,
            actions: vec![Action::AttachOriginalEmail],
            fail_closed: true,
            fail_closed_reason: Some("no_rule_match".into()),
        },
    }
}
