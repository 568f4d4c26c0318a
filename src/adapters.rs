//! External collaborator interfaces.
//!
//! The core treats every neighboring system as a replaceable typed
//! interface: mail source, AV scanner, OCR, directory, case system,
//! broker. Adapters do pure I/O, no business logic. Transport calls go
//! through the bounded deterministic retry wrapper; decision stages never
//! retry on logic failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts::ArtifactRef;
use crate::config::RetryPolicy;
pub use crate::error::DirectoryError;
use crate::registry::AvStatus;

/// One raw message pulled from a mail source.
#[derive(Debug, Clone)]
pub struct RawInboundMessage {
    pub raw_mime_bytes: Vec<u8>,
    pub source_message_id: String,
    pub source_metadata: BTreeMap<String, String>,
}

/// A raw attachment as delivered by the mail source.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub source_attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Mail source with durable cursor semantics.
#[async_trait]
pub trait MailIngest: Send + Sync {
    async fn fetch_new(&self) -> Result<Vec<RawInboundMessage>, DirectoryError>;
    async fn list_attachments(
        &self,
        source_message_id: &str,
    ) -> Result<Vec<RawAttachment>, DirectoryError>;
}

/// Verdict from the AV scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub status: AvStatus,
    pub scanner_version: String,
}

/// Antivirus scanner.
#[async_trait]
pub trait AvScanner: Send + Sync {
    async fn scan(&self, bytes: &[u8], filename: &str) -> Result<ScanVerdict, DirectoryError>;
}

/// Extracted text with a confidence (1.0 for native text, lower for OCR).
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub confidence: f64,
}

/// Text extraction / OCR engine.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<Option<ExtractedText>, DirectoryError>;
}

/// Lifecycle status of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Active,
    Closed,
}

/// A directory record: the entity exists and has a lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub entity_id: String,
    pub status: RecordStatus,
    /// Registered holder name, when the directory exposes one. Feeds the
    /// fuzzy signature/address match.
    pub display_name: Option<String>,
}

/// CRM / policy / claims directory.
///
/// Lookups answer existence plus status; `None` means the identifier is
/// unknown. Transport failures surface as errors so the caller can
/// distinguish "unknown" from "directory unavailable"; the latter must
/// never produce a CONFIRMED identity.
#[async_trait]
pub trait DirectoryAdapter: Send + Sync {
    async fn lookup_policy(&self, policy_number: &str)
        -> Result<Option<DirectoryRecord>, DirectoryError>;
    async fn lookup_claim(&self, claim_number: &str)
        -> Result<Option<DirectoryRecord>, DirectoryError>;
    async fn lookup_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError>;
    /// Policy numbers linked to a sender address, for the medium-strength
    /// sender match signal.
    async fn policy_numbers_for_sender(
        &self,
        email: &str,
    ) -> Result<Vec<String>, DirectoryError>;
}

/// Case/ticket system. `create_or_update` is idempotent on the caller's
/// key; re-delivery of the same job must not open a second case.
#[async_trait]
pub trait CaseAdapter: Send + Sync {
    async fn create_or_update(
        &self,
        idempotency_key: &str,
        payload: serde_json::Value,
    ) -> Result<String, DirectoryError>;
    async fn attach(&self, case_id: &str, artifact: &ArtifactRef) -> Result<(), DirectoryError>;
    async fn add_draft(&self, case_id: &str, artifact: &ArtifactRef)
        -> Result<(), DirectoryError>;
}

/// Durable job transport. Delivery is at-least-once; idempotency is the
/// orchestrator's job-key contract, not the broker's.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: serde_json::Value) -> Result<(), DirectoryError>;
    async fn dequeue(&self) -> Result<Option<(serde_json::Value, String)>, DirectoryError>;
    async fn ack(&self, ack_token: &str) -> Result<(), DirectoryError>;
    async fn nack(&self, ack_token: &str, dead_letter: bool) -> Result<(), DirectoryError>;
}

/// Runs a transport call under the bounded deterministic retry policy:
/// fixed attempt count, fixed backoff table, no jitter.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, DirectoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DirectoryError>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transport call failed"
                );
                last_error = Some(e);
                if attempt < policy.max_attempts {
                    let backoff = policy
                        .backoff_ms
                        .get((attempt - 1) as usize)
                        .copied()
                        .unwrap_or_else(|| *policy.backoff_ms.last().unwrap_or(&1_000));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| DirectoryError::Unavailable("no attempts made".into())))
}

/// Applies a per-call deadline to an adapter future.
pub async fn with_deadline<T, Fut>(
    deadline: Duration,
    future: Fut,
) -> Result<T, DirectoryError>
where
    Fut: Future<Output = Result<T, DirectoryError>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::Timeout {
            millis: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: vec![1, 1],
        };
        let result = with_retry(&policy, "directory.lookup", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DirectoryError::Unavailable("flaky".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: vec![1, 1],
        };
        let result: Result<u32, _> = with_retry(&policy, "directory.lookup", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DirectoryError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_times_out() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DirectoryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn deadline_passes_fast_calls() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(7u32) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
