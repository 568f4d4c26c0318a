//! Length-preserving redaction of prompt inputs.
//!
//! Canonical text is redacted before it reaches any LLM prompt. Masking
//! preserves length so evidence offsets reported against the redacted text
//! line up with the canonical text exactly.

use regex::Regex;

/// Redactor with compiled PII patterns.
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new() -> Self {
        let patterns = vec![
            // Email addresses
            Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b").unwrap(),
            // IBANs
            Regex::new(r"(?i)\b[a-z]{2}\d{2}[a-z0-9]{10,30}\b").unwrap(),
        ];
        Self { patterns }
    }

    /// Masks every PII match with `*`, character by character.
    pub fn redact_preserve_length(&self, text: &str) -> String {
        let mut mask: Vec<bool> = vec![false; text.len()];
        for pattern in &self.patterns {
            for found in pattern.find_iter(text) {
                for flag in &mut mask[found.start()..found.end()] {
                    *flag = true;
                }
            }
        }
        let mut out = String::with_capacity(text.len());
        for (i, c) in text.char_indices() {
            if mask[i] {
                for _ in 0..c.len_utf8() {
                    out.push('*');
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}
