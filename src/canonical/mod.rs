//! Deterministic canonicalization primitives.
//!
//! Everything that gets hashed goes through this module: RFC 8785 canonical
//! JSON for objects, text canonicalization for fingerprints and evidence
//! offsets, and `sha256:`-prefixed digests for artifact references.

pub mod jcs;
pub mod text;

pub use jcs::{canonical_bytes, canonical_sha256, sha256_prefixed, snippet_sha256, to_canonical_string};
pub use text::{
    canonicalize_text, message_fingerprint, normalized_levenshtein, strip_quoted_reply,
};
