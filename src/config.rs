//! Configuration snapshot types.
//!
//! The engine never reads configuration files; loading is an external
//! concern. Callers build (or deserialize) a [`ConfigSnapshot`], seal it,
//! and pin the sealed snapshot to every run started afterwards. Reloads
//! produce a new snapshot with a new `sha256`; in-flight runs keep the one
//! they started with.

use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::canonical::jcs;
use crate::error::{Result, ValidationError};
use crate::registry::RiskFlag;

/// How the classifier is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineMode {
    /// Deterministic rules first; LLM disabled by default.
    Baseline,
    /// LLM produces the classification, gated by acceptance checks with the
    /// rules classifier as sanity model.
    LlmFirst,
}

/// Process-wide incident toggles, consulted on every stage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentGates {
    /// Force every message into a review queue.
    pub force_review: bool,
    /// Queue used when `force_review` is on.
    pub force_review_queue_id: crate::registry::Queue,
    /// Disable all LLM calls regardless of mode.
    pub disable_llm: bool,
    /// Risk flags that strip `CREATE_CASE` and insert `BLOCK_CASE_CREATE`.
    pub block_case_create_risk_flags_any: Vec<RiskFlag>,
}

impl Default for IncidentGates {
    fn default() -> Self {
        Self {
            force_review: false,
            force_review_queue_id: crate::registry::Queue::IntakeReviewGeneral,
            disable_llm: false,
            block_case_create_risk_flags_any: vec![RiskFlag::SecurityMalware],
        }
    }
}

/// Deterministic sampling parameters sent with every LLM call and folded
/// into the inference cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 1024,
        }
    }
}

/// LLM provider configuration for classification/extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: String,
    pub model_id: String,
    pub params: LlmParams,
    /// Daily call ceiling across all purposes.
    pub max_calls_per_day: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "disabled".into(),
            model_id: "none".into(),
            params: LlmParams::default(),
            max_calls_per_day: 0,
        }
    }
}

/// Confidence floors the LLM output must clear to be accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceThresholds {
    pub primary_intent: f64,
    pub product_line: f64,
    pub urgency: f64,
    pub risk_flag: f64,
}

impl Default for AcceptanceThresholds {
    fn default() -> Self {
        Self {
            primary_intent: 0.72,
            product_line: 0.65,
            urgency: 0.60,
            risk_flag: 0.80,
        }
    }
}

/// Classification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub rules_version: String,
    /// Rule confidence above which the deterministic answer stands on its
    /// own in BASELINE mode.
    pub min_confidence_for_auto: f64,
    /// Rule confidence at which a deterministic disagreement on primary
    /// intent sends an accepted LLM result to review anyway.
    pub disagreement_min_rule_confidence: f64,
    pub accept: AcceptanceThresholds,
    pub llm: LlmConfig,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            rules_version: "rules-2026.03".into(),
            min_confidence_for_auto: 0.85,
            disagreement_min_rule_confidence: 0.85,
            accept: AcceptanceThresholds::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Signal strength class. Weights are per-signal; strength is per-class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    Hard,
    Medium,
    Soft,
}

impl SignalStrength {
    /// Fixed strength multiplier: HARD=1.0, MEDIUM=0.7, SOFT=0.3.
    pub fn multiplier(&self) -> Decimal {
        match self {
            SignalStrength::Hard => Decimal::ONE,
            SignalStrength::Medium => Decimal::new(7, 1),
            SignalStrength::Soft => Decimal::new(3, 1),
        }
    }
}

/// Weight and strength class for one identity signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub weight: Decimal,
    pub strength: SignalStrength,
}

/// Thresholds driving identity status derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityThresholds {
    pub confirmed_min_score: Decimal,
    pub confirmed_min_margin: Decimal,
    pub probable_min_score: Decimal,
    pub probable_min_margin: Decimal,
}

impl Default for IdentityThresholds {
    fn default() -> Self {
        Self {
            confirmed_min_score: Decimal::new(85, 2),
            confirmed_min_margin: Decimal::new(10, 2),
            probable_min_score: Decimal::new(60, 2),
            probable_min_margin: Decimal::new(5, 2),
        }
    }
}

/// Identity resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub top_k: usize,
    pub thresholds: IdentityThresholds,
    /// Subtracted from the raw score when the sender is a shared mailbox.
    pub shared_mailbox_penalty: Decimal,
    /// Weight table keyed by signal name.
    pub signal_weights: BTreeMap<String, SignalSpec>,
    /// Minimum normalized Levenshtein similarity for a fuzzy
    /// signature/address match to count as a soft signal.
    pub fuzzy_match_threshold: f64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let mut signal_weights = BTreeMap::new();
        signal_weights.insert(
            "SIG_CLAIM_NUMBER_LOOKUP_MATCH".into(),
            SignalSpec {
                weight: Decimal::new(90, 2),
                strength: SignalStrength::Hard,
            },
        );
        signal_weights.insert(
            "SIG_POLICY_NUMBER_LOOKUP_MATCH".into(),
            SignalSpec {
                weight: Decimal::new(85, 2),
                strength: SignalStrength::Hard,
            },
        );
        signal_weights.insert(
            "SIG_SENDER_EMAIL_MATCH".into(),
            SignalSpec {
                weight: Decimal::new(40, 2),
                strength: SignalStrength::Medium,
            },
        );
        signal_weights.insert(
            "SIG_THREAD_LINKAGE".into(),
            SignalSpec {
                weight: Decimal::new(35, 2),
                strength: SignalStrength::Medium,
            },
        );
        signal_weights.insert(
            "SIG_SIGNATURE_ADDRESS_MATCH".into(),
            SignalSpec {
                weight: Decimal::new(30, 2),
                strength: SignalStrength::Soft,
            },
        );
        Self {
            top_k: 3,
            thresholds: IdentityThresholds::default(),
            shared_mailbox_penalty: Decimal::new(15, 2),
            signal_weights,
            fuzzy_match_threshold: 0.82,
        }
    }
}

/// IBAN storage mode: keep the full value or only its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IbanStoreMode {
    Full,
    HashOnly,
}

/// IBAN extraction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbanPolicy {
    pub enabled: bool,
    pub store_mode: IbanStoreMode,
}

impl Default for IbanPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            store_mode: IbanStoreMode::HashOnly,
        }
    }
}

/// Extraction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub iban: IbanPolicy,
}

/// Routing configuration. The ruleset itself lives in [`crate::route`];
/// only its pinned version is configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub ruleset_version: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ruleset_version: "routes-2026.03".into(),
        }
    }
}

/// Per-call deadlines for external I/O, in milliseconds. Stored as plain
/// integers so the snapshot hash stays canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deadlines {
    pub directory_ms: u64,
    pub llm_ms: u64,
    pub case_adapter_ms: u64,
    pub av_scan_ms: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            directory_ms: 2_000,
            llm_ms: 20_000,
            case_adapter_ms: 10_000,
            av_scan_ms: 30_000,
        }
    }
}

impl Deadlines {
    pub fn directory(&self) -> Duration {
        Duration::from_millis(self.directory_ms)
    }

    pub fn llm(&self) -> Duration {
        Duration::from_millis(self.llm_ms)
    }

    pub fn case_adapter(&self) -> Duration {
        Duration::from_millis(self.case_adapter_ms)
    }
}

/// Bounded deterministic retry for transport-only work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed backoff sequence; attempt N sleeps `backoff_ms[N-1]`.
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: vec![100, 500, 2_000],
        }
    }
}

/// The full configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub system_id: String,
    pub spec_semver: String,
    pub determinism_mode: bool,
    pub pipeline_mode: PipelineMode,
    pub supported_languages: Vec<String>,
    /// Sender addresses treated as shared mailboxes for scoring penalties.
    pub shared_mailboxes: Vec<String>,
    pub incident: IncidentGates,
    pub classification: ClassificationConfig,
    pub identity: IdentityConfig,
    pub extraction: ExtractionConfig,
    pub routing: RoutingConfig,
    pub deadlines: Deadlines,
    pub retry: RetryPolicy,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            system_id: "intake-engine".into(),
            spec_semver: "1.0.0".into(),
            determinism_mode: false,
            pipeline_mode: PipelineMode::Baseline,
            supported_languages: vec!["de".into(), "en".into()],
            shared_mailboxes: Vec::new(),
            incident: IncidentGates::default(),
            classification: ClassificationConfig::default(),
            identity: IdentityConfig::default(),
            extraction: ExtractionConfig::default(),
            routing: RoutingConfig::default(),
            deadlines: Deadlines::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Stable reference to a sealed snapshot: logical path plus the SHA-256 of
/// its canonical JSON. Every decision hash binds to this pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRef {
    pub path: String,
    pub sha256: String,
}

impl ConfigSnapshot {
    /// Seals the snapshot: computes the canonical-JSON digest that pins
    /// every run started under it.
    pub fn seal(&self, path: impl Into<String>) -> Result<ConfigRef> {
        let value = serde_json::to_value(self).map_err(ValidationError::Json)?;
        let sha256 = jcs::canonical_sha256(&value)?;
        Ok(ConfigRef {
            path: path.into(),
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_is_deterministic() {
        let config = ConfigSnapshot::default();
        let a = config.seal("config/intake.yaml").unwrap();
        let b = config.seal("config/intake.yaml").unwrap();
        assert_eq!(a, b);
        assert!(a.sha256.starts_with("sha256:"));
    }

    #[test]
    fn seal_changes_with_content() {
        let base = ConfigSnapshot::default();
        let mut tweaked = base.clone();
        tweaked.determinism_mode = true;
        assert_ne!(
            base.seal("c").unwrap().sha256,
            tweaked.seal("c").unwrap().sha256
        );
    }

    #[test]
    fn default_acceptance_thresholds() {
        let accept = AcceptanceThresholds::default();
        assert_eq!(accept.primary_intent, 0.72);
        assert_eq!(accept.product_line, 0.65);
        assert_eq!(accept.urgency, 0.60);
        assert_eq!(accept.risk_flag, 0.80);
    }

    #[test]
    fn strength_multipliers() {
        assert_eq!(SignalStrength::Hard.multiplier(), Decimal::ONE);
        assert_eq!(SignalStrength::Medium.multiplier(), Decimal::new(7, 1));
        assert_eq!(SignalStrength::Soft.multiplier(), Decimal::new(3, 1));
    }

    #[test]
    fn retry_policy_is_bounded_and_fixed() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_ms, vec![100, 500, 2_000]);
    }

    #[test]
    fn default_block_flags_include_malware() {
        let gates = IncidentGates::default();
        assert!(gates
            .block_case_create_risk_flags_any
            .contains(&RiskFlag::SecurityMalware));
    }
}
