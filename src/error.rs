//! Error types for the intake engine.

use crate::registry::{Stage, UnknownLabel};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Canonicalization error: {0}")]
    Canonical(#[from] CanonicalError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Stage failed closed: {0}")]
    Stage(#[from] StageError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure taxonomy every stage error maps into.
///
/// Control flow never depends on unwinding: a stage either returns a
/// schema-valid artifact or a `StageError` that the orchestrator converts
/// into a fail-closed review outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Schema-invalid output or non-canonical label.
    Validation,
    /// Malware / legal / regulatory override; never retried.
    SafetyOverride,
    /// Transient transport failure that exhausted its retry budget.
    DependencyUnavailable,
    /// A non-reproducible operation was required in determinism mode.
    DeterminismViolation,
    /// Audit chain or content-address verification failed.
    Integrity,
    /// Programmer error surfaced as a typed failure.
    Internal,
}

/// A typed stage failure: kind, stage, and a stable reason code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage} failed ({kind:?}): {reason}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub stage: Stage,
    /// Stable machine-readable reason, e.g. `determinism_cache_miss`.
    pub reason: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            reason: reason.into(),
        }
    }

    pub fn validation(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, stage, reason)
    }

    pub fn dependency(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::DependencyUnavailable, stage, reason)
    }

    pub fn determinism(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeterminismViolation, stage, reason)
    }

    pub fn internal(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, stage, reason)
    }
}

/// Canonical JSON (RFC 8785) errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CanonicalError {
    #[error("non-finite number is not representable in canonical JSON")]
    NonFiniteNumber,

    #[error("number {value} is outside the canonical decimal window")]
    NumberOutOfWindow { value: String },

    #[error("canonical JSON nested deeper than {max_depth} levels")]
    MaxDepthExceeded { max_depth: usize },

    #[error("string is not NFC normalized at {path}")]
    NonNfcString { path: String },
}

/// Artifact/schema validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Label(#[from] UnknownLabel),

    #[error("artifact {schema_id} missing required field {field}")]
    MissingField { schema_id: String, field: String },

    #[error("artifact {schema_id} rejected: {reason}")]
    Rejected { schema_id: String, reason: String },

    #[error("evidence span does not match canonical text: {reason}")]
    EvidenceMismatch { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Audit chain errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit chain broken at event {index}: {reason}")]
    ChainBroken { index: usize, reason: String },

    #[error("audit append rejected: {0}")]
    AppendRejected(String),

    #[error("no audit chain for message {message_id} run {run_id}")]
    ChainNotFound { message_id: String, run_id: String },
}

/// Artifact/attachment store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("immutability violation: {uri} already exists with different content")]
    ImmutabilityViolation { uri: String },

    #[error("artifact not found: {uri}")]
    NotFound { uri: String },

    #[error("content digest mismatch for {uri}: expected {expected}, got {actual}")]
    DigestMismatch {
        uri: String,
        expected: String,
        actual: String,
    },
}

/// Message normalization errors.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("MIME parse failed: {0}")]
    Parse(String),

    #[error("missing {header} address")]
    MissingAddress { header: &'static str },
}

/// Directory adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory lookup timed out after {millis}ms")]
    Timeout { millis: u64 },
}

/// LLM provider and gating errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("output violates contract {contract}: {reason}")]
    ContractViolation { contract: String, reason: String },

    #[error("acceptance gate rejected output: {reason}")]
    GateRejected { reason: String },

    #[error("daily call budget exhausted ({max_calls_per_day}/day)")]
    BudgetExhausted { max_calls_per_day: u32 },

    #[error("inference cache miss in determinism mode")]
    DeterminismCacheMiss,
}

/// Routing ruleset errors.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("ruleset {version} invalid: {reason}")]
    InvalidRuleset { version: String, reason: String },
}

/// Process exit codes for the verification utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    InvalidInput = 10,
    SchemaValidationFailed = 20,
    FailClosedRequired = 30,
    DependencyUnavailable = 40,
    SecurityPolicyViolation = 50,
    IntegrityFailed = 60,
}

impl ExitCode {
    /// Maps an engine error to the exit code a verification utility reports.
    pub fn for_error(err: &Error) -> Self {
        match err {
            Error::Canonical(_) | Error::Normalize(_) => ExitCode::InvalidInput,
            Error::Validation(_) => ExitCode::SchemaValidationFailed,
            Error::Audit(_) | Error::Store(_) => ExitCode::IntegrityFailed,
            Error::Directory(_) => ExitCode::DependencyUnavailable,
            Error::Llm(LlmError::DeterminismCacheMiss) => ExitCode::FailClosedRequired,
            Error::Llm(_) => ExitCode::DependencyUnavailable,
            Error::Route(_) => ExitCode::SchemaValidationFailed,
            Error::Stage(e) => match e.kind {
                ErrorKind::SafetyOverride => ExitCode::SecurityPolicyViolation,
                ErrorKind::Validation => ExitCode::SchemaValidationFailed,
                ErrorKind::DependencyUnavailable => ExitCode::DependencyUnavailable,
                ErrorKind::Integrity => ExitCode::IntegrityFailed,
                _ => ExitCode::FailClosedRequired,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_display_names_stage_and_reason() {
        let err = StageError::determinism(Stage::Classify, "determinism_cache_miss");
        let text = err.to_string();
        assert!(text.contains("CLASSIFY"));
        assert!(text.contains("determinism_cache_miss"));
    }

    #[test]
    fn exit_code_for_determinism_cache_miss() {
        let err = Error::Llm(LlmError::DeterminismCacheMiss);
        assert_eq!(ExitCode::for_error(&err), ExitCode::FailClosedRequired);
    }

    #[test]
    fn exit_code_for_broken_chain() {
        let err = Error::Audit(AuditError::ChainBroken {
            index: 2,
            reason: "prev_event_hash mismatch".into(),
        });
        assert_eq!(ExitCode::for_error(&err), ExitCode::IntegrityFailed);
    }

    #[test]
    fn error_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::DeterminismViolation).unwrap();
        assert_eq!(json, "\"DETERMINISM_VIOLATION\"");
    }
}
