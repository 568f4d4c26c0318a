//! Deterministic rules classifier.
//!
//! Fast keyword/regex classification that is the whole story in BASELINE
//! mode and the sanity model for the disagreement gate in LLM_FIRST mode.
//! Multi-label: every matching intent rule contributes; the primary intent
//! is the highest-priority label in the canonical order.

use regex::Regex;
use tracing::debug;

use crate::artifacts::{EvidenceSpan, Labeled, NormalizedMessage};
use crate::registry::{EvidenceSource, Intent, ProductLine, Urgency};

#[derive(Debug, Clone, Copy)]
enum RuleField {
    Subject,
    Body,
    Both,
}

struct IntentRule {
    intent: Intent,
    field: RuleField,
    regex: Regex,
    confidence: f64,
}

struct ProductRule {
    product: ProductLine,
    field: RuleField,
    regex: Regex,
    confidence: f64,
}

struct UrgencyRule {
    urgency: Urgency,
    field: RuleField,
    regex: Regex,
    confidence: f64,
}

/// Output of the deterministic classifier.
#[derive(Debug, Clone)]
pub struct RulesClassification {
    pub intents: Vec<Labeled<Intent>>,
    pub primary_intent: Labeled<Intent>,
    pub product_line: Labeled<ProductLine>,
    pub urgency: Labeled<Urgency>,
}

/// The rules engine with compiled patterns.
pub struct RulesClassifier {
    intent_rules: Vec<IntentRule>,
    product_rules: Vec<ProductRule>,
    urgency_rules: Vec<UrgencyRule>,
    anbei: Regex,
}

impl RulesClassifier {
    pub fn new() -> Self {
        let intent = |intent, field, pattern: &str, confidence| IntentRule {
            intent,
            field,
            regex: Regex::new(pattern).unwrap(),
            confidence,
        };
        let intent_rules = vec![
            intent(
                Intent::GdprRequest,
                RuleField::Both,
                r"\b(dsgvo|auskunftsersuchen|datenauskunft|gdpr)\b",
                0.98,
            ),
            intent(
                Intent::Legal,
                RuleField::Both,
                r"\b(anwalt|anwältin|rechtsanwalt|rechtsabteilung)\b",
                0.9,
            ),
            intent(Intent::Complaint, RuleField::Both, r"\bbeschwerde\b", 0.95),
            intent(
                Intent::ClaimUpdate,
                RuleField::Subject,
                r"^nachreichung\b",
                0.9,
            ),
            intent(
                Intent::ClaimNew,
                RuleField::Body,
                r"\bschaden melden\b",
                0.92,
            ),
            intent(Intent::ClaimNew, RuleField::Both, r"\bunfall\b", 0.9),
            intent(
                Intent::ClaimNew,
                RuleField::Subject,
                r"^sturmschaden\b",
                0.87,
            ),
            intent(
                Intent::PolicyCancellation,
                RuleField::Both,
                r"\b(kündigung|kündigen|vertrag beenden)\b",
                0.9,
            ),
            intent(
                Intent::PolicyChange,
                RuleField::Body,
                r"\b(adressänderung|vertragsänderung|ummeldung)\b",
                0.85,
            ),
            intent(
                Intent::BillingQuestion,
                RuleField::Body,
                r"\b(rückzahlung|prämienvorschreibung|rechnung falsch)\b",
                0.88,
            ),
            intent(
                Intent::CoverageQuestion,
                RuleField::Body,
                r"\b(deckung|versicherungsschutz|gedeckt)\b",
                0.85,
            ),
            intent(
                Intent::BrokerIntermediary,
                RuleField::Subject,
                r"^im auftrag\b",
                0.9,
            ),
            intent(
                Intent::BrokerIntermediary,
                RuleField::Body,
                r"\b(als makler|maklervollmacht)\b",
                0.85,
            ),
            intent(
                Intent::Technical,
                RuleField::Subject,
                r"^(undelivered|zustellfehler)\b",
                0.9,
            ),
        ];

        let product = |product, field, pattern: &str, confidence| ProductRule {
            product,
            field,
            regex: Regex::new(pattern).unwrap(),
            confidence,
        };
        let product_rules = vec![
            product(
                ProductLine::Auto,
                RuleField::Both,
                r"\b(unfall|auffahrunfall|kfz|fahrzeug|pkw)\b",
                0.8,
            ),
            product(
                ProductLine::Property,
                RuleField::Both,
                r"\b(dach|sturmschaden|wasserschaden|gebäude)\b",
                0.75,
            ),
            product(
                ProductLine::Household,
                RuleField::Body,
                r"\b(haushaltsversicherung|einbruch|hausrat)\b",
                0.75,
            ),
            product(
                ProductLine::Liability,
                RuleField::Body,
                r"\bhaftpflicht\b",
                0.75,
            ),
            product(
                ProductLine::Travel,
                RuleField::Body,
                r"\b(reiserücktritt|reiseversicherung)\b",
                0.75,
            ),
            product(
                ProductLine::LegalProtection,
                RuleField::Body,
                r"\brechtsschutz\b",
                0.75,
            ),
        ];

        let urgency = |urgency, field, pattern: &str, confidence| UrgencyRule {
            urgency,
            field,
            regex: Regex::new(pattern).unwrap(),
            confidence,
        };
        let urgency_rules = vec![
            urgency(
                Urgency::Critical,
                RuleField::Body,
                r"\b(frist|letztmalig|mahnung)\b",
                0.85,
            ),
            urgency(
                Urgency::High,
                RuleField::Body,
                r"\b(sofort|dringend|umgehend|notfall)\b",
                0.75,
            ),
            urgency(Urgency::High, RuleField::Both, r"\bunfall\b", 0.7),
            urgency(
                Urgency::Low,
                RuleField::Body,
                r"\b(bei gelegenheit|kein(e)? eile)\b",
                0.7,
            ),
        ];

        Self {
            intent_rules,
            product_rules,
            urgency_rules,
            anbei: Regex::new(r"\banbei\b").unwrap(),
        }
    }

    fn find_in<'t>(
        field: RuleField,
        regex: &Regex,
        nm: &'t NormalizedMessage,
    ) -> Option<(EvidenceSource, &'t str, regex::Match<'t>)> {
        match field {
            RuleField::Subject => regex
                .find(&nm.subject_c14n)
                .map(|m| (EvidenceSource::Subject, nm.subject_c14n.as_str(), m)),
            RuleField::Body => regex
                .find(&nm.body_text_c14n)
                .map(|m| (EvidenceSource::Body, nm.body_text_c14n.as_str(), m)),
            RuleField::Both => regex
                .find(&nm.subject_c14n)
                .map(|m| (EvidenceSource::Subject, nm.subject_c14n.as_str(), m))
                .or_else(|| {
                    regex
                        .find(&nm.body_text_c14n)
                        .map(|m| (EvidenceSource::Body, nm.body_text_c14n.as_str(), m))
                }),
        }
    }

    /// Classifies one message. Always returns a complete result; the
    /// general-inquiry catch-all and the unknown product line cover
    /// messages nothing matched.
    pub fn classify(&self, nm: &NormalizedMessage) -> RulesClassification {
        let mut intents: Vec<Labeled<Intent>> = Vec::new();
        for rule in &self.intent_rules {
            if let Some((source, text, found)) = Self::find_in(rule.field, &rule.regex, nm) {
                let span = EvidenceSpan::new(source, text, found.start(), found.end());
                let labeled = Labeled::new(rule.intent, rule.confidence, vec![span]);
                match intents.iter_mut().find(|i| i.label == rule.intent) {
                    Some(existing) if existing.confidence < labeled.confidence => {
                        *existing = labeled;
                    }
                    Some(_) => {}
                    None => intents.push(labeled),
                }
            }
        }

        // Document submission depends on attachments, not just wording.
        if let Some(found) = self.anbei.find(&nm.subject_c14n) {
            intents.push(Labeled::new(
                Intent::DocumentSubmission,
                0.8,
                vec![EvidenceSpan::new(
                    EvidenceSource::Subject,
                    &nm.subject_c14n,
                    found.start(),
                    found.end(),
                )],
            ));
        } else if let Some(found) = self.anbei.find(&nm.body_text_c14n) {
            let confidence = if nm.attachment_ids.is_empty() { 0.55 } else { 0.7 };
            intents.push(Labeled::new(
                Intent::DocumentSubmission,
                confidence,
                vec![EvidenceSpan::new(
                    EvidenceSource::Body,
                    &nm.body_text_c14n,
                    found.start(),
                    found.end(),
                )],
            ));
        }

        if intents.is_empty() {
            intents.push(Labeled::new(
                Intent::GeneralInquiry,
                0.55,
                vec![EvidenceSpan::first_word(
                    EvidenceSource::Body,
                    &nm.body_text_c14n,
                )],
            ));
        }

        let primary = intents
            .iter()
            .min_by_key(|i| i.label.priority())
            .cloned()
            .expect("intents is never empty");
        debug!(
            message_id = %nm.message_id,
            primary = %primary.label,
            labels = intents.len(),
            "Rules classification"
        );

        let product_line = self
            .product_rules
            .iter()
            .find_map(|rule| {
                Self::find_in(rule.field, &rule.regex, nm).map(|(source, text, found)| {
                    Labeled::new(
                        rule.product,
                        rule.confidence,
                        vec![EvidenceSpan::new(source, text, found.start(), found.end())],
                    )
                })
            })
            .unwrap_or_else(|| {
                Labeled::new(
                    ProductLine::Unknown,
                    0.4,
                    vec![EvidenceSpan::first_word(
                        EvidenceSource::Body,
                        &nm.body_text_c14n,
                    )],
                )
            });

        let urgency = self
            .urgency_rules
            .iter()
            .find_map(|rule| {
                Self::find_in(rule.field, &rule.regex, nm).map(|(source, text, found)| {
                    Labeled::new(
                        rule.urgency,
                        rule.confidence,
                        vec![EvidenceSpan::new(source, text, found.start(), found.end())],
                    )
                })
            })
            .unwrap_or_else(|| {
                Labeled::new(
                    Urgency::Normal,
                    0.6,
                    vec![EvidenceSpan::first_word(
                        EvidenceSource::Subject,
                        &nm.subject_c14n,
                    )],
                )
            });

        RulesClassification {
            intents,
            primary_intent: primary,
            product_line,
            urgency,
        }
    }

    /// Cheap claim probe for the identity-stage entity-type tie-break.
    pub fn claim_intent_hint(&self, nm: &NormalizedMessage) -> bool {
        self.classify(nm).primary_intent.label.is_claim_related()
    }
}

impl Default for RulesClassifier {
    fn default() -> Self {
        Self::new()
    }
}
