//! Content-addressed inference cache.
//!
//! The cache key binds everything that determines an inference: purpose,
//! model, sampling parameters, prompt hash and input digest. On a hit the
//! stored artifact is returned without touching the provider; on a miss in
//! determinism mode the lookup is an error the stage must fail closed on.
//! Entries are immutable: inserting a different output under an existing
//! key is an integrity violation, never an overwrite.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::Mutex;

use crate::artifacts::LlmInferenceArtifact;
use crate::canonical::jcs;
use crate::config::LlmParams;
use crate::error::LlmError;
use crate::registry::InferencePurpose;

/// Deterministic cache key over the canonical JSON of the inference
/// coordinates.
pub fn llm_cache_key(
    purpose: InferencePurpose,
    model_id: &str,
    params: &LlmParams,
    prompt_sha256: &str,
    input_digest_sha256: &str,
) -> String {
    let value = json!({
        "input_digest_sha256": input_digest_sha256,
        "model_id": model_id,
        "params": {
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
        },
        "prompt_sha256": prompt_sha256,
        "purpose": purpose,
    });
    // Params are finite two-decimal knobs; canonicalization cannot fail.
    jcs::canonical_sha256(&value).expect("cache key input is canonical-safe")
}

/// Inference artifact cache.
#[async_trait::async_trait]
pub trait InferenceCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<LlmInferenceArtifact>;

    /// Inserts an artifact under its key. Re-inserting the identical
    /// artifact is a no-op; a different output under the same key is
    /// rejected.
    async fn put(&self, key: &str, artifact: LlmInferenceArtifact) -> Result<(), LlmError>;
}

/// In-memory inference cache.
#[derive(Default)]
pub struct MemoryInferenceCache {
    entries: Mutex<HashMap<String, LlmInferenceArtifact>>,
}

impl MemoryInferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds an entry, deriving its key from the artifact itself. Used
    /// to stage recorded inferences for replay runs.
    pub async fn seed(&self, artifact: LlmInferenceArtifact) -> Result<String, LlmError> {
        let key = llm_cache_key(
            artifact.purpose,
            &artifact.model_id,
            &artifact.params,
            &artifact.prompt_sha256,
            &artifact.input_digest_sha256,
        );
        self.put(&key, artifact).await?;
        Ok(key)
    }
}

#[async_trait::async_trait]
impl InferenceCache for MemoryInferenceCache {
    async fn get(&self, key: &str) -> Option<LlmInferenceArtifact> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn put(&self, key: &str, artifact: LlmInferenceArtifact) -> Result<(), LlmError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if existing.output_sha256 != artifact.output_sha256 {
                return Err(LlmError::ContractViolation {
                    contract: "inference-cache".into(),
                    reason: format!("immutability violation for key {key}"),
                });
            }
            return Ok(());
        }
        entries.insert(key.to_string(), artifact);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(output: serde_json::Value) -> LlmInferenceArtifact {
        LlmInferenceArtifact::new(
            InferencePurpose::Classify,
            "het-7b",
            LlmParams::default(),
            "sha256:prompt",
            "sha256:input",
            output,
        )
        .unwrap()
    }

    #[test]
    fn key_is_deterministic() {
        let params = LlmParams::default();
        let a = llm_cache_key(InferencePurpose::Classify, "m", &params, "p", "i");
        let b = llm_cache_key(InferencePurpose::Classify, "m", &params, "p", "i");
        assert_eq!(a, b);
    }

    #[test]
    fn key_separates_purposes_and_inputs() {
        let params = LlmParams::default();
        let classify = llm_cache_key(InferencePurpose::Classify, "m", &params, "p", "i");
        let extract = llm_cache_key(InferencePurpose::Extract, "m", &params, "p", "i");
        let other_input = llm_cache_key(InferencePurpose::Classify, "m", &params, "p", "j");
        assert_ne!(classify, extract);
        assert_ne!(classify, other_input);
    }

    #[test]
    fn key_changes_with_params() {
        let default = LlmParams::default();
        let hot = LlmParams {
            temperature: 0.7,
            ..LlmParams::default()
        };
        assert_ne!(
            llm_cache_key(InferencePurpose::Classify, "m", &default, "p", "i"),
            llm_cache_key(InferencePurpose::Classify, "m", &hot, "p", "i"),
        );
    }

    #[tokio::test]
    async fn hit_returns_stored_artifact() {
        let cache = MemoryInferenceCache::new();
        let stored = artifact(json!({"intents": []}));
        let key = cache.seed(stored.clone()).await.unwrap();
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.output_sha256, stored.output_sha256);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache = MemoryInferenceCache::new();
        assert!(cache.get("sha256:nothing").await.is_none());
    }

    #[tokio::test]
    async fn identical_reinsert_is_noop() {
        let cache = MemoryInferenceCache::new();
        let a = artifact(json!({"x": 1}));
        let key = cache.seed(a.clone()).await.unwrap();
        cache.put(&key, a).await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_insert_is_rejected() {
        let cache = MemoryInferenceCache::new();
        let key = cache.seed(artifact(json!({"x": 1}))).await.unwrap();
        let err = cache.put(&key, artifact(json!({"x": 2}))).await.unwrap_err();
        assert!(matches!(err, LlmError::ContractViolation { .. }));
    }
}
