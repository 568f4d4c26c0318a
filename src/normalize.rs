//! Message normalization: raw MIME → [`NormalizedMessage`].
//!
//! Parses the wire message once, derives the canonical subject/body the
//! rest of the pipeline indexes into, preserves the original text for
//! operator display, and computes the timestamp-free message fingerprint.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use uuid::Uuid;

use crate::adapters::RawAttachment;
use crate::artifacts::{NormalizedMessage, ThreadKeys};
use crate::canonical::jcs;
use crate::canonical::text::{canonicalize_text, message_fingerprint, strip_quoted_reply};
use crate::error::NormalizeError;

/// German-language markers for deterministic language detection. Detection
/// is marker-based on purpose: a model would not replay bit-identically.
const GERMAN_MARKERS: &[&str] = &[
    "guten tag",
    "sehr geehrte",
    "bitte",
    "schaden",
    "polizz",
    "kündig",
    "rechnung",
    "anbei",
];

fn detect_language(subject_c14n: &str, body_c14n: &str) -> String {
    let text = format!("{subject_c14n} {body_c14n}");
    if GERMAN_MARKERS.iter().any(|m| text.contains(m)) {
        "de".to_string()
    } else {
        "en".to_string()
    }
}

/// Deterministic attachment id: stable across replays of the same message.
pub fn derive_attachment_id(message_id: &str, source_attachment_id: &str, sha256: &str) -> String {
    let name = format!("att:{message_id}:{source_attachment_id}:{sha256}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Inputs the normalizer needs besides the raw bytes.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub message_id: String,
    pub ingestion_source: String,
    pub ingested_at: DateTime<Utc>,
    pub raw_mime_uri: String,
}

/// Builds the canonical form of one message.
///
/// Attachment ids and digests are derived from the raw attachment bytes so
/// the fingerprint is complete before the attachment stage has run.
pub fn build_normalized_message(
    ctx: &NormalizeContext,
    raw_mime: &[u8],
    attachments: &[RawAttachment],
) -> Result<NormalizedMessage, NormalizeError> {
    let parsed = MessageParser::default()
        .parse(raw_mime)
        .ok_or_else(|| NormalizeError::Parse("not a parseable MIME message".into()))?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .ok_or(NormalizeError::MissingAddress { header: "From" })?;
    let from_display_name = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.name())
        .map(|s| s.to_string());

    let to_emails: Vec<String> = parsed
        .to()
        .map(|addr| {
            addr.iter()
                .filter_map(|a| a.address())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    if to_emails.is_empty() {
        return Err(NormalizeError::MissingAddress { header: "To" });
    }

    let cc_emails: Vec<String> = parsed
        .cc()
        .map(|addr| {
            addr.iter()
                .filter_map(|a| a.address())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let reply_to_email = parsed
        .reply_to()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string());

    let subject = parsed.subject().unwrap_or_default().to_string();
    let body_text = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .unwrap_or_default();

    let subject_c14n = canonicalize_text(&subject);
    let body_text_c14n = canonicalize_text(&strip_quoted_reply(&body_text));

    let thread_keys = ThreadKeys {
        internet_message_id: parsed.message_id().map(|s| s.to_string()),
        in_reply_to: parsed.in_reply_to().as_text().map(|s| s.to_string()),
        conversation_id: parsed.thread_name().map(|s| s.to_string()),
    };

    let attachment_sha256s: Vec<String> = attachments
        .iter()
        .map(|a| jcs::sha256_prefixed(&a.bytes))
        .collect();
    let attachment_ids: Vec<String> = attachments
        .iter()
        .zip(&attachment_sha256s)
        .map(|(a, sha)| derive_attachment_id(&ctx.message_id, &a.source_attachment_id, sha))
        .collect();

    let language = detect_language(&subject_c14n, &body_text_c14n);
    let fingerprint = message_fingerprint(&subject_c14n, &body_text_c14n, &attachment_sha256s);

    Ok(NormalizedMessage {
        message_id: ctx.message_id.clone(),
        ingestion_source: ctx.ingestion_source.clone(),
        ingested_at: ctx.ingested_at,
        raw_mime_uri: ctx.raw_mime_uri.clone(),
        raw_mime_sha256: jcs::sha256_prefixed(raw_mime),
        from_email: from,
        from_display_name,
        reply_to_email,
        to_emails,
        cc_emails,
        subject,
        body_text,
        subject_c14n,
        body_text_c14n,
        language,
        thread_keys,
        attachment_ids,
        message_fingerprint: fingerprint,
    })
}
