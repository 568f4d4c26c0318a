//! Always-on deterministic risk prescan.
//!
//! Runs before any model in both pipeline modes. Produces the risk flag
//! set from versioned keyword/regex rules plus the two non-textual
//! sources: attachment AV status and language support. The LLM may add
//! flags later; it can never remove one produced here.

use regex::Regex;
use tracing::debug;

use crate::artifacts::{AttachmentArtifact, EvidenceSpan, Labeled, NormalizedMessage};
use crate::config::ConfigSnapshot;
use crate::registry::{AvStatus, EvidenceSource, RiskFlag};

/// Which canonical text a prescan rule matches against.
#[derive(Debug, Clone, Copy)]
enum RuleField {
    Subject,
    Body,
    Both,
}

/// One versioned risk rule.
struct RiskRule {
    flag: RiskFlag,
    field: RuleField,
    regex: Regex,
    confidence: f64,
}

/// The prescan engine with compiled rules.
pub struct RiskPrescan {
    rules: Vec<RiskRule>,
}

impl RiskPrescan {
    pub fn new() -> Self {
        let rule = |flag, field, pattern: &str, confidence| RiskRule {
            flag,
            field,
            regex: Regex::new(pattern).unwrap(),
            confidence,
        };
        let rules = vec![
            rule(
                RiskFlag::SelfHarmThreat,
                RuleField::Body,
                r"\b(suizid|selbstmord|mir das leben nehmen|umbringen)\b",
                0.95,
            ),
            rule(
                RiskFlag::ThreatViolence,
                RuleField::Body,
                r"\b(gewalt antun|zusammenschlagen|ich warne sie ein letztes mal)\b",
                0.9,
            ),
            // A lawyer merely being mentioned is an intent matter; the
            // risk flag needs an actual threat of proceedings.
            rule(
                RiskFlag::LegalThreat,
                RuleField::Both,
                r"\b(klage|gerichtlich|rechtliche schritte|frist|letzte mahnung)\b",
                0.9,
            ),
            rule(
                RiskFlag::Regulatory,
                RuleField::Both,
                r"\b(ombudsmann|ombudsstelle|aufsichtsbehörde|fma|bafin)\b",
                0.85,
            ),
            rule(
                RiskFlag::FraudSignal,
                RuleField::Body,
                r"\b(betrug|betrugsverdacht|gefälscht|fingiert)\b",
                0.85,
            ),
            rule(
                RiskFlag::AutoreplyLoop,
                RuleField::Body,
                r"(automatically generated|auto-?reply|abwesenheitsnotiz|out of office)",
                0.8,
            ),
            rule(
                RiskFlag::PrivacySensitive,
                RuleField::Body,
                r"\b(iban|kontonummer|ausweiskopie)\b",
                0.8,
            ),
            rule(
                RiskFlag::MediaPress,
                RuleField::Both,
                r"\b(presseanfrage|journalist|redaktion)\b",
                0.8,
            ),
        ];
        Self { rules }
    }

    /// Evaluates all rules plus the AV and language sources.
    ///
    /// Each flag appears at most once; the highest-confidence source wins.
    pub fn evaluate(
        &self,
        config: &ConfigSnapshot,
        nm: &NormalizedMessage,
        attachments: &[AttachmentArtifact],
    ) -> Vec<Labeled<RiskFlag>> {
        let mut flags: Vec<Labeled<RiskFlag>> = Vec::new();

        if attachments.iter().any(|a| a.av_status != AvStatus::Clean) {
            flags.push(Labeled::new(
                RiskFlag::SecurityMalware,
                0.95,
                vec![EvidenceSpan::first_word(
                    EvidenceSource::Subject,
                    &nm.subject_c14n,
                )],
            ));
        }

        if !config
            .supported_languages
            .iter()
            .any(|l| l == &nm.language)
        {
            flags.push(Labeled::new(
                RiskFlag::LanguageUnsupported,
                0.95,
                vec![EvidenceSpan::first_word(
                    EvidenceSource::Subject,
                    &nm.subject_c14n,
                )],
            ));
        }

        for rule in &self.rules {
            let hit = match rule.field {
                RuleField::Subject => rule
                    .regex
                    .find(&nm.subject_c14n)
                    .map(|m| (EvidenceSource::Subject, &nm.subject_c14n, m)),
                RuleField::Body => rule
                    .regex
                    .find(&nm.body_text_c14n)
                    .map(|m| (EvidenceSource::Body, &nm.body_text_c14n, m)),
                RuleField::Both => rule
                    .regex
                    .find(&nm.subject_c14n)
                    .map(|m| (EvidenceSource::Subject, &nm.subject_c14n, m))
                    .or_else(|| {
                        rule.regex
                            .find(&nm.body_text_c14n)
                            .map(|m| (EvidenceSource::Body, &nm.body_text_c14n, m))
                    }),
            };
            if let Some((source, text, found)) = hit {
                debug!(flag = %rule.flag, "Risk prescan rule matched");
                merge_flag(
                    &mut flags,
                    Labeled::new(
                        rule.flag,
                        rule.confidence,
                        vec![EvidenceSpan::new(source, text, found.start(), found.end())],
                    ),
                );
            }
        }

        flags
    }
}

impl Default for RiskPrescan {
    fn default() -> Self {
        Self::new()
    }
}

/// Inserts a flag, keeping the higher-confidence version on duplicates.
pub fn merge_flag(flags: &mut Vec<Labeled<RiskFlag>>, flag: Labeled<RiskFlag>) {
    match flags.iter_mut().find(|f| f.label == flag.label) {
        Some(existing) => {
            if flag.confidence > existing.confidence {
                *existing = flag;
            }
        }
        None => flags.push(flag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ThreadKeys;
    use chrono::Utc;

    fn message(subject: &str, body: &str, language: &str) -> NormalizedMessage {
        NormalizedMessage {
            message_id: "msg-1".into(),
            ingestion_source: "imap".into(),
            ingested_at: Utc::now(),
            raw_mime_uri: "blob://raw".into(),
            raw_mime_sha256: "sha256:raw".into(),
            from_email: "sender@example.com".into(),
            from_display_name: None,
            reply_to_email: None,
            to_emails: vec!["intake@insurer.example".into()],
            cc_emails: vec![],
            subject: subject.to_string(),
            body_text: body.to_string(),
            subject_c14n: subject.to_lowercase(),
            body_text_c14n: body.to_lowercase(),
            language: language.into(),
            thread_keys: ThreadKeys::default(),
            attachment_ids: vec![],
            message_fingerprint: "sha256:fp".into(),
        }
    }

    fn infected_attachment() -> AttachmentArtifact {
        AttachmentArtifact {
            attachment_id: "att-1".into(),
            message_id: "msg-1".into(),
            filename: "invoice.exe".into(),
            mime_type: "application/octet-stream".into(),
            size_bytes: 10,
            sha256: "sha256:aa".into(),
            av_status: AvStatus::Infected,
            scanner_version: "clamav-1.3".into(),
            extracted_text_uri: None,
            extracted_text_sha256: None,
            ocr_applied: false,
            ocr_confidence: None,
            doc_type_candidates: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn infected_attachment_raises_malware_flag() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("Rechnung", "anbei die rechnung", "de");
        let flags = prescan.evaluate(&config, &nm, &[infected_attachment()]);
        assert!(flags.iter().any(|f| f.label == RiskFlag::SecurityMalware));
    }

    #[test]
    fn legal_threat_from_frist() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("Mahnung", "ich setze ihnen eine frist von 14 tagen", "de");
        let flags = prescan.evaluate(&config, &nm, &[]);
        let legal = flags.iter().find(|f| f.label == RiskFlag::LegalThreat).unwrap();
        assert!(legal.confidence >= 0.85);
        assert_eq!(legal.evidence[0].snippet_redacted, "frist");
    }

    #[test]
    fn unsupported_language_is_flagged() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("hola", "necesito informacion sobre mi seguro", "es");
        let flags = prescan.evaluate(&config, &nm, &[]);
        assert!(flags.iter().any(|f| f.label == RiskFlag::LanguageUnsupported));
    }

    #[test]
    fn clean_message_has_no_flags() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("Schadenmeldung", "unfall gestern auf der a2, bitte melden", "de");
        let flags = prescan.evaluate(&config, &nm, &[]);
        assert!(flags.is_empty(), "unexpected flags: {flags:?}");
    }

    #[test]
    fn regulatory_and_privacy_can_coexist() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message(
            "Beschwerde",
            "ich wende mich an den ombudsmann. meine iban lautet ...",
            "de",
        );
        let flags = prescan.evaluate(&config, &nm, &[]);
        assert!(flags.iter().any(|f| f.label == RiskFlag::Regulatory));
        assert!(flags.iter().any(|f| f.label == RiskFlag::PrivacySensitive));
    }

    #[test]
    fn merge_keeps_higher_confidence() {
        let mut flags = vec![Labeled::new(RiskFlag::FraudSignal, 0.5, vec![])];
        merge_flag(&mut flags, Labeled::new(RiskFlag::FraudSignal, 0.9, vec![]));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].confidence, 0.9);
    }

    #[test]
    fn lawyer_mention_alone_is_not_a_legal_threat() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("Frage", "meine anwältin ist über den vorgang informiert", "de");
        let flags = prescan.evaluate(&config, &nm, &[]);
        assert!(!flags.iter().any(|f| f.label == RiskFlag::LegalThreat));
    }

    #[test]
    fn evidence_spans_verify_against_canonical_text() {
        let prescan = RiskPrescan::new();
        let config = ConfigSnapshot::default();
        let nm = message("Frage", "andernfalls reiche ich klage ein", "de");
        let flags = prescan.evaluate(&config, &nm, &[]);
        let legal = flags.iter().find(|f| f.label == RiskFlag::LegalThreat).unwrap();
        legal.evidence[0].verify(&nm.body_text_c14n).unwrap();
    }
}
