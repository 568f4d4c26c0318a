//! LLM provider abstraction, gating and inference caching.
//!
//! The provider is an external collaborator behind a trait; the engine only
//! ever calls it with deterministic sampling parameters, and in determinism
//! mode never calls it at all; inference is resolved from the
//! content-addressed cache or the stage fails closed.

pub mod cache;
pub mod contracts;
pub mod redaction;

pub use cache::{llm_cache_key, InferenceCache, MemoryInferenceCache};

use async_trait::async_trait;

use crate::config::{ConfigSnapshot, LlmParams};
use crate::error::LlmError;

/// LLM provider interface. Implementations wrap a local or remote model;
/// `infer` returns the raw completion text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    async fn infer(&self, prompt: &str, params: &LlmParams) -> Result<String, LlmError>;
}

/// Why an LLM call was allowed or suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl GateDecision {
    fn denied(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }

    fn allowed(reason: &'static str) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }
}

/// Decides whether a live LLM call may happen for classification.
///
/// Order matters: determinism mode and the incident kill-switch outrank
/// everything; after that the provider config and the daily budget apply.
/// In BASELINE mode a high-confidence deterministic result suppresses the
/// call entirely.
pub fn classify_gate(
    config: &ConfigSnapshot,
    deterministic_primary_confidence: f64,
    has_prescan_risk_flags: bool,
    calls_made_today: u32,
) -> GateDecision {
    let llm = &config.classification.llm;
    if config.determinism_mode {
        return GateDecision::denied("DETERMINISM_MODE");
    }
    if config.incident.disable_llm {
        return GateDecision::denied("INCIDENT_DISABLE_LLM");
    }
    if !llm.enabled || llm.provider == "disabled" {
        return GateDecision::denied("DISABLED");
    }
    if calls_made_today >= llm.max_calls_per_day {
        return GateDecision::denied("DAILY_BUDGET_EXHAUSTED");
    }
    match config.pipeline_mode {
        crate::config::PipelineMode::LlmFirst => GateDecision::allowed("LLM_FIRST"),
        crate::config::PipelineMode::Baseline => {
            if has_prescan_risk_flags {
                return GateDecision::denied("RISK_FLAGS_PRESENT");
            }
            if deterministic_primary_confidence >= config.classification.min_confidence_for_auto {
                return GateDecision::denied("CONFIDENCE_HIGH_ENOUGH");
            }
            GateDecision::allowed("LOW_CONFIDENCE_NO_RISK_FLAGS")
        }
    }
}

/// Per-day live-call counter backing the daily budget gate. Cache hits do
/// not consume budget.
#[derive(Default)]
pub struct DailyCallCounter {
    by_date: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl DailyCallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn today() -> String {
        chrono::Utc::now().date_naive().to_string()
    }

    pub fn calls_today(&self) -> u32 {
        self.by_date
            .lock()
            .expect("counter lock poisoned")
            .get(&Self::today())
            .copied()
            .unwrap_or(0)
    }

    pub fn consume(&self) {
        *self
            .by_date
            .lock()
            .expect("counter lock poisoned")
            .entry(Self::today())
            .or_insert(0) += 1;
    }
}

/// Strips markdown code fences and leading/trailing noise before JSON
/// parsing. Models wrap strict-JSON answers in fences often enough that
/// tolerating it beats a repair round-trip.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (``` or ```json), then the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    let body = body.rsplit_once("```").map(|(b, _)| b).unwrap_or(body);
    body.trim()
}
