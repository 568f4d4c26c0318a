//! Canonical registry: the single authoritative vocabulary.
//!
//! Every label a stage output may carry is a closed enum defined here.
//! Parsing an unknown string is a hard error, which makes non-canonical
//! labels unrepresentable downstream: a stage output that fails to parse
//! fails schema validation and the run fails closed.

use std::fmt;
use std::str::FromStr;

/// Error returned when a string is not a member of a canonical vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel {
    /// Vocabulary the lookup ran against (e.g. "Intent").
    pub vocabulary: &'static str,
    /// The offending string.
    pub label: String,
}

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "non-canonical {} label: {}", self.vocabulary, self.label)
    }
}

impl std::error::Error for UnknownLabel {}

/// Defines a closed vocabulary enum with strict string round-tripping.
///
/// Serde goes through `as_str`/`FromStr`, so deserializing a label that is
/// not in the registry fails instead of silently admitting it.
macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Every member, in registry order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// The canonical label string.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    _ => Err(UnknownLabel {
                        vocabulary: stringify!($name),
                        label: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

vocabulary! {
    /// Pipeline stages, in execution order.
    Stage {
        Ingest => "INGEST",
        Normalize => "NORMALIZE",
        Attachments => "ATTACHMENTS",
        Identity => "IDENTITY",
        Classify => "CLASSIFY",
        Extract => "EXTRACT",
        Route => "ROUTE",
        Case => "CASE",
        Hitl => "HITL",
        Reprocess => "REPROCESS",
    }
}

vocabulary! {
    /// Identity resolution outcome.
    IdentityStatus {
        Confirmed => "IDENTITY_CONFIRMED",
        Probable => "IDENTITY_PROBABLE",
        NeedsReview => "IDENTITY_NEEDS_REVIEW",
        NoCandidate => "IDENTITY_NO_CANDIDATE",
    }
}

vocabulary! {
    /// Entity types an identity candidate may resolve to.
    CandidateType {
        Customer => "CUSTOMER",
        Policy => "POLICY",
        Claim => "CLAIM",
        Contact => "CONTACT",
        Broker => "BROKER",
    }
}

vocabulary! {
    /// Message intents. Multi-label; one is selected primary by priority.
    Intent {
        GdprRequest => "INTENT_GDPR_REQUEST",
        Legal => "INTENT_LEGAL",
        Complaint => "INTENT_COMPLAINT",
        ClaimNew => "INTENT_CLAIM_NEW",
        ClaimUpdate => "INTENT_CLAIM_UPDATE",
        PolicyCancellation => "INTENT_POLICY_CANCELLATION",
        PolicyChange => "INTENT_POLICY_CHANGE",
        BillingQuestion => "INTENT_BILLING_QUESTION",
        DocumentSubmission => "INTENT_DOCUMENT_SUBMISSION",
        CoverageQuestion => "INTENT_COVERAGE_QUESTION",
        BrokerIntermediary => "INTENT_BROKER_INTERMEDIARY",
        Technical => "INTENT_TECHNICAL",
        GeneralInquiry => "INTENT_GENERAL_INQUIRY",
    }
}

vocabulary! {
    /// Insurance product lines.
    ProductLine {
        Auto => "PROD_AUTO",
        Property => "PROD_PROPERTY",
        Liability => "PROD_LIABILITY",
        Life => "PROD_LIFE",
        Health => "PROD_HEALTH",
        Accident => "PROD_ACCIDENT",
        LegalProtection => "PROD_LEGAL_PROTECTION",
        Travel => "PROD_TRAVEL",
        Household => "PROD_HOUSEHOLD",
        Commercial => "PROD_COMMERCIAL",
        Unknown => "PROD_UNKNOWN",
    }
}

vocabulary! {
    /// Urgency classes.
    Urgency {
        Low => "URG_LOW",
        Normal => "URG_NORMAL",
        High => "URG_HIGH",
        Critical => "URG_CRITICAL",
    }
}

vocabulary! {
    /// Risk flags. Prescan flags can never be removed by the LLM.
    RiskFlag {
        SecurityMalware => "RISK_SECURITY_MALWARE",
        Regulatory => "RISK_REGULATORY",
        LegalThreat => "RISK_LEGAL_THREAT",
        FraudSignal => "RISK_FRAUD_SIGNAL",
        SelfHarmThreat => "RISK_SELF_HARM_THREAT",
        ThreatViolence => "RISK_THREAT_VIOLENCE",
        AutoreplyLoop => "RISK_AUTOREPLY_LOOP",
        LanguageUnsupported => "RISK_LANGUAGE_UNSUPPORTED",
        PrivacySensitive => "RISK_PRIVACY_SENSITIVE",
        MediaPress => "RISK_MEDIA_PRESS",
    }
}

vocabulary! {
    /// Target work queues.
    Queue {
        SecurityReview => "QUEUE_SECURITY_REVIEW",
        Complaints => "QUEUE_COMPLAINTS",
        Legal => "QUEUE_LEGAL",
        Fraud => "QUEUE_FRAUD",
        PrivacyDsr => "QUEUE_PRIVACY_DSR",
        IdentityReview => "QUEUE_IDENTITY_REVIEW",
        ClassificationReview => "QUEUE_CLASSIFICATION_REVIEW",
        UnknownProductReview => "QUEUE_UNKNOWN_PRODUCT_REVIEW",
        IntakeReviewGeneral => "QUEUE_INTAKE_REVIEW_GENERAL",
        ClaimsAuto => "QUEUE_CLAIMS_AUTO",
        ClaimsProperty => "QUEUE_CLAIMS_PROPERTY",
        ClaimsGeneral => "QUEUE_CLAIMS_GENERAL",
        PolicyService => "QUEUE_POLICY_SERVICE",
        Billing => "QUEUE_BILLING",
        CoverageAdvice => "QUEUE_COVERAGE_ADVICE",
        BrokerDesk => "QUEUE_BROKER_DESK",
        DocumentIntake => "QUEUE_DOCUMENT_INTAKE",
        TechnicalOps => "QUEUE_TECHNICAL_OPS",
    }
}

vocabulary! {
    /// Service-level agreements.
    Sla {
        OneHour => "SLA_1H",
        FourHours => "SLA_4H",
        OneBusinessDay => "SLA_1BD",
        ThreeBusinessDays => "SLA_3BD",
    }
}

vocabulary! {
    /// Operational actions a routing decision may request.
    Action {
        CreateCase => "CREATE_CASE",
        AttachOriginalEmail => "ATTACH_ORIGINAL_EMAIL",
        AttachAllFiles => "ATTACH_ALL_FILES",
        AddRequestInfoDraft => "ADD_REQUEST_INFO_DRAFT",
        BlockCaseCreate => "BLOCK_CASE_CREATE",
        HumanEscalation => "HUMAN_ESCALATION",
    }
}

vocabulary! {
    /// Extracted entity types.
    EntityType {
        PolicyNumber => "ENT_POLICY_NUMBER",
        ClaimNumber => "ENT_CLAIM_NUMBER",
        CustomerNumber => "ENT_CUSTOMER_NUMBER",
        Iban => "ENT_IBAN",
        Date => "ENT_DATE",
        Location => "ENT_LOCATION",
        DocumentType => "ENT_DOCUMENT_TYPE",
    }
}

vocabulary! {
    /// Antivirus verdicts stamped on attachments before downstream use.
    AvStatus {
        Clean => "CLEAN",
        Infected => "INFECTED",
        Suspicious => "SUSPICIOUS",
        Failed => "FAILED",
    }
}

vocabulary! {
    /// Which canonical text an evidence span points into.
    EvidenceSource {
        Subject => "SUBJECT_C14N",
        Body => "BODY_C14N",
        AttachmentText => "ATTACHMENT_TEXT",
    }
}

vocabulary! {
    /// What an inference artifact was produced for.
    InferencePurpose {
        Classify => "CLASSIFY",
        Extract => "EXTRACT",
        IdentityAssist => "IDENTITY_ASSIST",
    }
}

impl Intent {
    /// Selection priority for the primary intent. Lower sorts first.
    ///
    /// The order is part of the registry: GDPR and legal matters outrank
    /// claims, claims outrank policy service, and so on down to the
    /// general-inquiry catch-all.
    pub fn priority(&self) -> usize {
        // `ALL` is declared in priority order.
        Self::ALL
            .iter()
            .position(|i| i == self)
            .unwrap_or(Self::ALL.len())
    }

    /// Whether the intent concerns an existing or new claim.
    pub fn is_claim_related(&self) -> bool {
        matches!(self, Intent::ClaimNew | Intent::ClaimUpdate)
    }
}

impl RiskFlag {
    /// Hard routing override order. `ALL` is declared in override order;
    /// the first present flag wins.
    pub fn override_rank(&self) -> usize {
        Self::ALL
            .iter()
            .position(|f| f == self)
            .unwrap_or(Self::ALL.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for intent in Intent::ALL {
            assert_eq!(intent.as_str().parse::<Intent>().unwrap(), *intent);
        }
        for queue in Queue::ALL {
            assert_eq!(queue.as_str().parse::<Queue>().unwrap(), *queue);
        }
        for flag in RiskFlag::ALL {
            assert_eq!(flag.as_str().parse::<RiskFlag>().unwrap(), *flag);
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "INTENT_PIZZA_ORDER".parse::<Intent>().unwrap_err();
        assert_eq!(err.vocabulary, "Intent");
        assert!(err.to_string().contains("INTENT_PIZZA_ORDER"));
    }

    #[test]
    fn serde_uses_canonical_strings() {
        let json = serde_json::to_string(&Queue::SecurityReview).unwrap();
        assert_eq!(json, "\"QUEUE_SECURITY_REVIEW\"");
        let back: Queue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Queue::SecurityReview);
    }

    #[test]
    fn serde_rejects_non_canonical() {
        let result: Result<Urgency, _> = serde_json::from_str("\"URG_PANIC\"");
        assert!(result.is_err());
    }

    #[test]
    fn vocabulary_sizes_match_registry() {
        assert_eq!(Stage::ALL.len(), 10);
        assert_eq!(Intent::ALL.len(), 13);
        assert_eq!(ProductLine::ALL.len(), 11);
        assert_eq!(Urgency::ALL.len(), 4);
        assert_eq!(RiskFlag::ALL.len(), 10);
        assert_eq!(Queue::ALL.len(), 18);
        assert_eq!(Action::ALL.len(), 6);
        assert_eq!(Sla::ALL.len(), 4);
    }

    #[test]
    fn gdpr_outranks_legal_and_complaint() {
        assert!(Intent::GdprRequest.priority() < Intent::Legal.priority());
        assert!(Intent::Legal.priority() < Intent::Complaint.priority());
        assert!(Intent::Complaint.priority() < Intent::ClaimNew.priority());
        assert_eq!(
            Intent::GeneralInquiry.priority(),
            Intent::ALL.len() - 1
        );
    }

    #[test]
    fn malware_has_highest_override_rank() {
        assert_eq!(RiskFlag::SecurityMalware.override_rank(), 0);
        assert!(
            RiskFlag::Regulatory.override_rank() < RiskFlag::LegalThreat.override_rank()
        );
        assert!(
            RiskFlag::LegalThreat.override_rank() < RiskFlag::FraudSignal.override_rank()
        );
    }
}
