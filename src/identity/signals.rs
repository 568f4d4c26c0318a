//! Deterministic identifier extraction for identity resolution.
//!
//! Identifier grammar: policy numbers `\d{2}-\d{7}` (optionally introduced
//! by "polizzennr"), claim numbers `clm-<year>-<seq>` with the canonical
//! value upper-cased. Hits carry the evidence span into the canonical text
//! they were found in. Pattern validators run on top of the regexes so a
//! structurally impossible identifier never reaches the directory.

use regex::Regex;

use crate::registry::EvidenceSource;

/// Kind of identifier found in text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    PolicyNumber,
    ClaimNumber,
}

/// One identifier hit with its evidence location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierHit {
    pub kind: IdentifierKind,
    /// Canonical value (claim numbers upper-cased).
    pub value: String,
    pub source: EvidenceSource,
    pub start: usize,
    pub end: usize,
    pub snippet: String,
    /// Set when the hit came from attachment text.
    pub attachment_id: Option<String>,
}

/// Compiled identifier patterns. Policy numbers come in two grammars:
/// the short line form `\d{2}-\d{7}` and the reference form
/// `pol-<year>-<serial>` (canonical value upper-cased).
pub struct IdentifierPatterns {
    policy: Regex,
    policy_with_prefix: Regex,
    claim: Regex,
}

impl IdentifierPatterns {
    pub fn new() -> Self {
        Self {
            policy: Regex::new(r"\b(pol-\d{4}-\d{8}|\d{2}-\d{7})\b").unwrap(),
            policy_with_prefix: Regex::new(r"\bpolizzennr\s+(\d{2}-\d{7})\b").unwrap(),
            claim: Regex::new(r"\b(clm-\d{4}-\d{4})\b").unwrap(),
        }
    }

    /// Finds a claim number, subject first.
    pub fn find_claim_number(
        &self,
        subject_c14n: &str,
        body_c14n: &str,
    ) -> Option<IdentifierHit> {
        for (source, text) in [
            (EvidenceSource::Subject, subject_c14n),
            (EvidenceSource::Body, body_c14n),
        ] {
            if let Some(found) = self.claim.captures(text) {
                let group = found.get(1).unwrap();
                let raw = group.as_str();
                if !is_valid_claim_number(raw) {
                    continue;
                }
                return Some(IdentifierHit {
                    kind: IdentifierKind::ClaimNumber,
                    value: raw.to_uppercase(),
                    source,
                    start: group.start(),
                    end: group.end(),
                    snippet: raw.to_string(),
                    attachment_id: None,
                });
            }
        }
        None
    }

    /// Finds a policy number. A subject hit that also appears in the body
    /// is reported at its body location, where the surrounding context
    /// makes better review evidence.
    pub fn find_policy_number(
        &self,
        subject_c14n: &str,
        body_c14n: &str,
    ) -> Option<IdentifierHit> {
        if let Some(found) = self.policy.captures(subject_c14n) {
            let group = found.get(1).unwrap();
            let number = group.as_str();
            if is_valid_policy_number(number) {
                if let Some(body_idx) = body_c14n.find(number) {
                    return Some(IdentifierHit {
                        kind: IdentifierKind::PolicyNumber,
                        value: canonical_policy_value(number),
                        source: EvidenceSource::Body,
                        start: body_idx,
                        end: body_idx + number.len(),
                        snippet: number.to_string(),
                        attachment_id: None,
                    });
                }
                return Some(IdentifierHit {
                    kind: IdentifierKind::PolicyNumber,
                    value: canonical_policy_value(number),
                    source: EvidenceSource::Subject,
                    start: group.start(),
                    end: group.end(),
                    snippet: number.to_string(),
                    attachment_id: None,
                });
            }
        }

        if let Some(found) = self.policy_with_prefix.captures(body_c14n) {
            let whole = found.get(0).unwrap();
            let number = found.get(1).unwrap().as_str();
            if is_valid_policy_number(number) {
                return Some(IdentifierHit {
                    kind: IdentifierKind::PolicyNumber,
                    value: number.to_string(),
                    source: EvidenceSource::Body,
                    start: whole.start(),
                    end: whole.end(),
                    snippet: whole.as_str().to_string(),
                    attachment_id: None,
                });
            }
        }

        if let Some(found) = self.policy.captures(body_c14n) {
            let group = found.get(1).unwrap();
            let number = group.as_str();
            if is_valid_policy_number(number) {
                return Some(IdentifierHit {
                    kind: IdentifierKind::PolicyNumber,
                    value: canonical_policy_value(number),
                    source: EvidenceSource::Body,
                    start: group.start(),
                    end: group.end(),
                    snippet: number.to_string(),
                    attachment_id: None,
                });
            }
        }

        None
    }
}

impl Default for IdentifierPatterns {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical stored form of a policy number: reference-form identifiers
/// upper-case, short-form digits as written.
pub fn canonical_policy_value(raw: &str) -> String {
    if raw.to_lowercase().starts_with("pol-") {
        raw.to_uppercase()
    } else {
        raw.to_string()
    }
}

/// Structural validation beyond the regex: reference-form numbers carry a
/// plausible year, and the short form's two-digit line prefix is never
/// `00`.
pub fn is_valid_policy_number(value: &str) -> bool {
    let lower = value.to_lowercase();
    if let Some(rest) = lower.strip_prefix("pol-") {
        let Some((year, serial)) = rest.split_once('-') else {
            return false;
        };
        return serial.len() == 8
            && serial.chars().all(|c| c.is_ascii_digit())
            && matches!(year.parse::<u32>(), Ok(y) if (1990..=2099).contains(&y));
    }
    let Some((prefix, serial)) = lower.split_once('-') else {
        return false;
    };
    prefix.len() == 2 && serial.len() == 7 && prefix != "00"
}

/// Claim numbers carry a plausible year segment.
pub fn is_valid_claim_number(value: &str) -> bool {
    let lower = value.to_lowercase();
    let mut parts = lower.splitn(3, '-');
    let (Some(tag), Some(year), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if tag != "clm" || seq.len() != 4 {
        return false;
    }
    matches!(year.parse::<u32>(), Ok(y) if (1990..=2099).contains(&y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_policy_number_in_body() {
        let patterns = IdentifierPatterns::new();
        let hit = patterns
            .find_policy_number("unfall gestern a2", "mein vertrag: polizzennr 12-3456789 danke")
            .unwrap();
        assert_eq!(hit.value, "12-3456789");
        assert_eq!(hit.source, EvidenceSource::Body);
        assert_eq!(hit.snippet, "polizzennr 12-3456789");
    }

    #[test]
    fn subject_policy_hit_prefers_body_location() {
        let patterns = IdentifierPatterns::new();
        let hit = patterns
            .find_policy_number("schaden 12-3456789", "zur polizze 12-3456789 melde ich")
            .unwrap();
        assert_eq!(hit.source, EvidenceSource::Body);
        assert_eq!(hit.start, 12);
    }

    #[test]
    fn finds_claim_number_uppercased() {
        let patterns = IdentifierPatterns::new();
        let hit = patterns
            .find_claim_number("nachreichung clm-2024-0017", "")
            .unwrap();
        assert_eq!(hit.value, "CLM-2024-0017");
        assert_eq!(hit.snippet, "clm-2024-0017");
        assert_eq!(hit.source, EvidenceSource::Subject);
    }

    #[test]
    fn rejects_implausible_claim_year() {
        let patterns = IdentifierPatterns::new();
        assert!(patterns.find_claim_number("re: clm-0042-0001", "").is_none());
        assert!(is_valid_claim_number("clm-2024-0001"));
        assert!(!is_valid_claim_number("clm-1875-0001"));
    }

    #[test]
    fn rejects_zero_prefix_policy() {
        assert!(!is_valid_policy_number("00-1234567"));
        assert!(is_valid_policy_number("12-3456789"));
        let patterns = IdentifierPatterns::new();
        assert!(patterns.find_policy_number("", "polizzennr 00-1234567").is_none());
    }

    #[test]
    fn finds_reference_form_policy_number() {
        let patterns = IdentifierPatterns::new();
        let hit = patterns
            .find_policy_number("unfall gestern a2", "zu meiner polizze pol-2024-00012345 melde ich einen schaden")
            .unwrap();
        assert_eq!(hit.value, "POL-2024-00012345");
        assert_eq!(hit.snippet, "pol-2024-00012345");
        assert!(is_valid_policy_number("pol-2024-00012345"));
        assert!(!is_valid_policy_number("pol-1800-00012345"));
    }

    #[test]
    fn no_identifiers_in_plain_text() {
        let patterns = IdentifierPatterns::new();
        assert!(patterns.find_policy_number("hallo", "nur text ohne nummern").is_none());
        assert!(patterns.find_claim_number("hallo", "nur text").is_none());
    }
}
