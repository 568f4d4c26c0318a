//! Text canonicalization for fingerprints and evidence offsets.
//!
//! Every evidence span in the system indexes into the canonical form
//! produced here, so all stages must share one implementation. The
//! canonical form is NFC-normalized, quoted-reply-stripped, CRLF-folded
//! and lowercased; the original text is preserved separately on the
//! normalized message for operator display.

use regex::Regex;
use serde_json::json;
use unicode_normalization::UnicodeNormalization;

use crate::canonical::jcs;

/// Deterministic reply-boundary detection.
///
/// The boundary patterns are fixed, not configurable: changing them would
/// shift evidence offsets for already-audited messages.
pub struct ReplyBoundaries {
    patterns: Vec<Regex>,
}

impl ReplyBoundaries {
    pub fn new() -> Self {
        let patterns = vec![
            // "On <date>, <name> wrote:" / German equivalent
            Regex::new(r"(?im)^on .{0,200} wrote:\s*$").unwrap(),
            Regex::new(r"(?im)^am .{0,200} schrieb .{0,200}:\s*$").unwrap(),
            // Forwarded/original message separators
            Regex::new(r"(?im)^-{2,}\s*(original message|ursprüngliche nachricht|forwarded message)\s*-{2,}\s*$").unwrap(),
            // Quoted header block
            Regex::new(r"(?im)^(from|von):\s.{0,200}$\n^(sent|gesendet):\s").unwrap(),
            // First fully quoted line
            Regex::new(r"(?m)^>").unwrap(),
        ];
        Self { patterns }
    }

    /// Byte offset of the earliest reply boundary, if any.
    fn earliest(&self, text: &str) -> Option<usize> {
        self.patterns
            .iter()
            .filter_map(|re| re.find(text).map(|m| m.start()))
            .min()
    }
}

impl Default for ReplyBoundaries {
    fn default() -> Self {
        Self::new()
    }
}

/// Cuts quoted reply history at the earliest deterministic boundary.
pub fn strip_quoted_reply(body: &str) -> String {
    let boundaries = ReplyBoundaries::new();
    match boundaries.earliest(body) {
        Some(idx) => body[..idx].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

/// Canonicalizes text for fingerprinting and evidence offsets:
/// NFC → CRLF folding → lowercase. Lowercasing last keeps offsets stable
/// against the displayed canonical text.
pub fn canonicalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let folded = nfc.replace("\r\n", "\n").replace('\r', "\n");
    folded.trim_end().to_lowercase()
}

/// Message fingerprint: SHA-256 over the canonical JSON of the canonical
/// subject, canonical body and the sorted attachment digest list. No
/// timestamps, no run ids.
pub fn message_fingerprint(
    subject_c14n: &str,
    body_text_c14n: &str,
    attachment_sha256s: &[String],
) -> String {
    let mut digests: Vec<&str> = attachment_sha256s.iter().map(String::as_str).collect();
    digests.sort_unstable();
    let value = json!({
        "attachment_sha256s": digests,
        "body_text_c14n": body_text_c14n,
        "subject_c14n": subject_c14n,
    });
    // Only strings and arrays: canonicalization cannot fail.
    jcs::canonical_sha256(&value).expect("fingerprint input is canonical-safe")
}

/// Normalized Levenshtein similarity in [0, 1] after lowercase folding.
///
/// Used for the deterministic fuzzy signature/address match in identity
/// resolution. 1.0 means equal, 0.0 means nothing in common.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let distance = levenshtein(&a, &b);
    let max_len = a.len().max(b.len());
    1.0 - (distance as f64 / max_len as f64)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_lowercases_and_folds_crlf() {
        let text = "Unfall Gestern A2\r\nZweite Zeile\r\n";
        assert_eq!(canonicalize_text(text), "unfall gestern a2\nzweite zeile");
    }

    #[test]
    fn canonicalize_applies_nfc() {
        // e + combining acute normalizes to é
        let decomposed = "e\u{0301}";
        assert_eq!(canonicalize_text(decomposed), "é");
    }

    #[test]
    fn strips_on_wrote_boundary() {
        let body = "Thanks, that works.\n\nOn Mon, Jan 5 2026, Alice wrote:\n> old text\n";
        assert_eq!(strip_quoted_reply(body), "Thanks, that works.");
    }

    #[test]
    fn strips_german_schrieb_boundary() {
        let body = "Danke für die Info.\n\nAm 05.01.2026 schrieb Max Muster:\n> alter text\n";
        assert_eq!(strip_quoted_reply(body), "Danke für die Info.");
    }

    #[test]
    fn strips_quoted_lines_without_header() {
        let body = "New content here.\n> quoted line one\n> quoted line two\n";
        assert_eq!(strip_quoted_reply(body), "New content here.");
    }

    #[test]
    fn no_boundary_keeps_body() {
        let body = "Just a plain message.\nWith two lines.";
        assert_eq!(strip_quoted_reply(body), body);
    }

    #[test]
    fn fingerprint_ignores_attachment_order() {
        let a = message_fingerprint(
            "subject",
            "body",
            &["sha256:bb".into(), "sha256:aa".into()],
        );
        let b = message_fingerprint(
            "subject",
            "body",
            &["sha256:aa".into(), "sha256:bb".into()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_body() {
        let a = message_fingerprint("s", "body one", &[]);
        let b = message_fingerprint("s", "body two", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn levenshtein_similarity_bounds() {
        assert_eq!(normalized_levenshtein("Musterstraße 1", "musterstraße 1"), 1.0);
        assert_eq!(normalized_levenshtein("", ""), 1.0);
        assert!(normalized_levenshtein("abc", "xyz") < 0.01);
        let close = normalized_levenshtein("Hauptstrasse 12", "Hauptstraße 12");
        assert!(close > 0.8, "got {close}");
    }
}
