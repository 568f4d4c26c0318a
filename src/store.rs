//! Artifact and attachment stores.
//!
//! Immutability is enforced at the store boundary: writes are
//! `put_if_absent` keyed by content hash, a second write of identical bytes
//! is a no-op, and a write of different bytes under the same URI is an
//! integrity error. Derived outputs are never overwritten; new versions
//! get new URIs and replace references.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::artifacts::ArtifactRef;
use crate::canonical::jcs;
use crate::error::{StoreError, ValidationError};
use crate::registry::Stage;

/// Outcome of an idempotent artifact write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// First write: bytes were persisted.
    Written,
    /// Identical bytes already existed; nothing was written.
    AlreadyPresent,
}

/// Content-addressed artifact store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes bytes under a reference if absent. Rejects a different
    /// payload under an existing URI.
    async fn put_if_absent(
        &self,
        artifact_ref: &ArtifactRef,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, StoreError>;

    async fn get(&self, artifact_ref: &ArtifactRef) -> Result<Vec<u8>, StoreError>;

    /// Lists references written for `(message_id, stage)`, in write order.
    async fn list(&self, message_id: &str, stage: Stage) -> Vec<ArtifactRef>;
}

/// Append-only blob store for raw MIME and attachment bytes.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Stores bytes, returning their `sha256:`-prefixed digest.
    async fn put(&self, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, sha256: &str) -> Result<Vec<u8>, StoreError>;
}

/// Serializes an artifact to canonical JSON, derives its reference, and
/// writes it idempotently. The URI is derived from the content digest, so
/// identical artifacts collapse to one write.
pub async fn put_artifact<T: Serialize>(
    store: &dyn ArtifactStore,
    schema_id: &str,
    message_id: &str,
    stage: Stage,
    artifact: &T,
) -> Result<(ArtifactRef, PutOutcome), crate::error::Error> {
    let value = serde_json::to_value(artifact).map_err(ValidationError::Json)?;
    let bytes = jcs::canonical_bytes(&value)?;
    let sha256 = jcs::sha256_prefixed(&bytes);
    let hex = sha256.trim_start_matches("sha256:");
    let uri = format!("artifact://{message_id}/{stage}/{hex}");
    let artifact_ref = ArtifactRef::new(schema_id, uri, sha256);
    let outcome = store.put_if_absent(&artifact_ref, bytes).await?;
    Ok((artifact_ref, outcome))
}

/// Reads an artifact back and verifies its content digest.
pub async fn get_artifact<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    artifact_ref: &ArtifactRef,
) -> Result<T, crate::error::Error> {
    let bytes = store.get(artifact_ref).await?;
    let actual = jcs::sha256_prefixed(&bytes);
    if actual != artifact_ref.sha256 {
        return Err(StoreError::DigestMismatch {
            uri: artifact_ref.uri.clone(),
            expected: artifact_ref.sha256.clone(),
            actual,
        }
        .into());
    }
    Ok(serde_json::from_slice(&bytes).map_err(ValidationError::Json)?)
}

/// In-memory artifact store.
#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<MemoryArtifacts>,
}

#[derive(Default)]
struct MemoryArtifacts {
    blobs: HashMap<String, Vec<u8>>,
    by_stage: HashMap<(String, String), Vec<ArtifactRef>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn stage_key_from_uri(uri: &str) -> Option<(String, String)> {
    // artifact://<message_id>/<stage>/<hex>
    let rest = uri.strip_prefix("artifact://")?;
    let mut parts = rest.split('/');
    let message_id = parts.next()?.to_string();
    let stage = parts.next()?.to_string();
    Some((message_id, stage))
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_if_absent(
        &self,
        artifact_ref: &ArtifactRef,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.blobs.get(&artifact_ref.uri) {
            if *existing != bytes {
                return Err(StoreError::ImmutabilityViolation {
                    uri: artifact_ref.uri.clone(),
                });
            }
            return Ok(PutOutcome::AlreadyPresent);
        }
        inner.blobs.insert(artifact_ref.uri.clone(), bytes);
        if let Some(key) = stage_key_from_uri(&artifact_ref.uri) {
            inner.by_stage.entry(key).or_default().push(artifact_ref.clone());
        }
        Ok(PutOutcome::Written)
    }

    async fn get(&self, artifact_ref: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        self.inner
            .lock()
            .await
            .blobs
            .get(&artifact_ref.uri)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                uri: artifact_ref.uri.clone(),
            })
    }

    async fn list(&self, message_id: &str, stage: Stage) -> Vec<ArtifactRef> {
        self.inner
            .lock()
            .await
            .by_stage
            .get(&(message_id.to_string(), stage.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory content-addressed blob store.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, StoreError> {
        let sha256 = jcs::sha256_prefixed(&bytes);
        self.blobs.lock().await.entry(sha256.clone()).or_insert(bytes);
        Ok(sha256)
    }

    async fn get(&self, sha256: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .await
            .get(sha256)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                uri: sha256.to_string(),
            })
    }
}

/// Shared handles to the storage backends of one deployment.
#[derive(Clone)]
pub struct Stores {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub attachments: Arc<dyn AttachmentStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            artifacts: Arc::new(MemoryArtifactStore::new()),
            attachments: Arc::new(MemoryAttachmentStore::new()),
        }
    }
}
