//! Attachment stage: AV stamping and text extraction.
//!
//! Every attachment is stored content-addressed, scanned, and stamped with
//! its AV status before anything downstream may read it. Text is extracted
//! only from CLEAN attachments, directly for `text/*` parts, through the
//! OCR engine otherwise. The artifact list is canonically ordered by
//! `(sha256, filename)` so attachment-derived hashes are stable.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::adapters::{AvScanner, RawAttachment, TextExtractor};
use crate::artifacts::{AttachmentArtifact, DocTypeCandidate, EvidenceSpan};
use crate::canonical::jcs;
use crate::error::{Result, StageError};
use crate::normalize::derive_attachment_id;
use crate::registry::{AvStatus, EvidenceSource, Stage};
use crate::store::AttachmentStore;

/// Document-type keywords recognized in extracted attachment text.
const DOC_TYPE_KEYWORDS: &[(&str, &str, f64)] = &[
    ("fotobeschreibung", "DOC_PHOTO_EVIDENCE", 0.85),
    ("foto", "DOC_PHOTO_EVIDENCE", 0.6),
    ("rechnung", "DOC_INVOICE", 0.8),
    ("kostenvoranschlag", "DOC_COST_ESTIMATE", 0.8),
    ("polizeibericht", "DOC_POLICE_REPORT", 0.85),
];

fn doc_type_candidates(text_c14n: &str) -> Vec<DocTypeCandidate> {
    let mut out = Vec::new();
    for (needle, label, confidence) in DOC_TYPE_KEYWORDS {
        if let Some(idx) = text_c14n.find(needle) {
            let mut span =
                EvidenceSpan::new(EvidenceSource::AttachmentText, text_c14n, idx, idx + needle.len());
            span.attachment_id = None;
            out.push(DocTypeCandidate {
                doc_type_label: (*label).to_string(),
                confidence: *confidence,
                evidence: vec![span],
            });
            break;
        }
    }
    out
}

/// Output of processing one message's attachments.
#[derive(Debug, Clone)]
pub struct ProcessedAttachments {
    pub artifacts: Vec<AttachmentArtifact>,
    /// `(attachment_id, canonical_text)` of CLEAN attachments.
    pub clean_texts_c14n: Vec<(String, String)>,
}

impl ProcessedAttachments {
    pub fn has_nonclean(&self) -> bool {
        self.artifacts.iter().any(|a| a.av_status != AvStatus::Clean)
    }
}

/// The attachment stage.
pub struct AttachmentStage<'a> {
    pub store: &'a dyn AttachmentStore,
    pub scanner: &'a dyn AvScanner,
    pub text_extractor: &'a dyn TextExtractor,
}

impl<'a> AttachmentStage<'a> {
    /// Stores, scans and stamps every attachment of one message.
    ///
    /// A scanner transport failure stamps `FAILED` rather than erroring:
    /// an unscannable attachment must still reach routing, where the
    /// non-clean status triggers the security override.
    pub async fn process(
        &self,
        message_id: &str,
        attachments: &[RawAttachment],
        created_at: DateTime<Utc>,
    ) -> Result<ProcessedAttachments> {
        let mut artifacts = Vec::with_capacity(attachments.len());
        let mut clean_texts = Vec::new();

        for raw in attachments {
            let sha256 = jcs::sha256_prefixed(&raw.bytes);
            let stored_sha = self
                .store
                .put(raw.bytes.clone())
                .await
                .map_err(|e| StageError::dependency(Stage::Attachments, e.to_string()))?;
            if stored_sha != sha256 {
                return Err(StageError::new(
                    crate::error::ErrorKind::Integrity,
                    Stage::Attachments,
                    format!("attachment store digest mismatch for {}", raw.filename),
                )
                .into());
            }

            let verdict = match self.scanner.scan(&raw.bytes, &raw.filename).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(
                        message_id,
                        filename = %raw.filename,
                        error = %e,
                        "AV scan failed, stamping FAILED"
                    );
                    crate::adapters::ScanVerdict {
                        status: AvStatus::Failed,
                        scanner_version: "unavailable".into(),
                    }
                }
            };

            let mut extracted_text_uri = None;
            let mut extracted_text_sha256 = None;
            let mut ocr_applied = false;
            let mut ocr_confidence = None;
            let mut candidates = Vec::new();
            let mut clean_text = None;

            if verdict.status == AvStatus::Clean {
                let direct = if raw.mime_type.starts_with("text/") {
                    String::from_utf8(raw.bytes.clone()).ok().map(|text| {
                        crate::adapters::ExtractedText {
                            text,
                            confidence: 1.0,
                        }
                    })
                } else {
                    None
                };
                let extracted = match direct {
                    Some(found) => Some(found),
                    None => self
                        .text_extractor
                        .extract(&raw.bytes, &raw.mime_type)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(
                                message_id,
                                filename = %raw.filename,
                                error = %e,
                                "Text extraction failed, continuing without text"
                            );
                            None
                        })
                        .map(|found| {
                            ocr_applied = true;
                            found
                        }),
                };
                if let Some(found) = extracted {
                    let text_c14n = crate::canonical::text::canonicalize_text(&found.text);
                    let text_sha = self
                        .store
                        .put(text_c14n.clone().into_bytes())
                        .await
                        .map_err(|e| StageError::dependency(Stage::Attachments, e.to_string()))?;
                    extracted_text_uri = Some(format!("blob://{text_sha}"));
                    extracted_text_sha256 = Some(text_sha);
                    if ocr_applied {
                        ocr_confidence = Some(found.confidence);
                    }
                    candidates = doc_type_candidates(&text_c14n);
                    clean_text = Some(text_c14n);
                }
            }

            let attachment_id =
                derive_attachment_id(message_id, &raw.source_attachment_id, &sha256);
            for candidate in &mut candidates {
                for span in &mut candidate.evidence {
                    span.attachment_id = Some(attachment_id.clone());
                }
            }
            if let Some(text) = clean_text {
                clean_texts.push((attachment_id.clone(), text));
            }

            artifacts.push(AttachmentArtifact {
                attachment_id,
                message_id: message_id.to_string(),
                filename: raw.filename.clone(),
                mime_type: raw.mime_type.clone(),
                size_bytes: raw.bytes.len(),
                sha256,
                av_status: verdict.status,
                scanner_version: verdict.scanner_version,
                extracted_text_uri,
                extracted_text_sha256,
                ocr_applied,
                ocr_confidence,
                doc_type_candidates: candidates,
                created_at,
            });
        }

        // Canonical ordering binds downstream hashes.
        artifacts.sort_by(|a, b| {
            (a.sha256.as_str(), a.filename.as_str()).cmp(&(b.sha256.as_str(), b.filename.as_str()))
        });

        info!(
            message_id,
            count = artifacts.len(),
            nonclean = artifacts.iter().filter(|a| a.av_status != AvStatus::Clean).count(),
            "Attachment stage complete"
        );

        Ok(ProcessedAttachments {
            artifacts,
            clean_texts_c14n: clean_texts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExtractedText, ScanVerdict};
    use crate::error::DirectoryError;
    use crate::store::MemoryAttachmentStore;
    use async_trait::async_trait;

    struct FakeScanner {
        infected_filenames: Vec<String>,
    }

    #[async_trait]
    impl AvScanner for FakeScanner {
        async fn scan(&self, _bytes: &[u8], filename: &str) -> std::result::Result<ScanVerdict, DirectoryError> {
            let status = if self.infected_filenames.iter().any(|f| f == filename) {
                AvStatus::Infected
            } else {
                AvStatus::Clean
            };
            Ok(ScanVerdict {
                status,
                scanner_version: "clamav-1.3".into(),
            })
        }
    }

    struct NoOcr;

    #[async_trait]
    impl TextExtractor for NoOcr {
        async fn extract(
            &self,
            _bytes: &[u8],
            _mime: &str,
        ) -> std::result::Result<Option<ExtractedText>, DirectoryError> {
            Ok(None)
        }
    }

    fn text_attachment(id: &str, filename: &str, content: &str) -> RawAttachment {
        RawAttachment {
            source_attachment_id: id.into(),
            filename: filename.into(),
            mime_type: "text/plain".into(),
            bytes: content.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn clean_text_attachment_is_extracted() {
        let store = MemoryAttachmentStore::new();
        let stage = AttachmentStage {
            store: &store,
            scanner: &FakeScanner {
                infected_filenames: vec![],
            },
            text_extractor: &NoOcr,
        };
        let processed = stage
            .process(
                "msg-1",
                &[text_attachment("1", "beschreibung.txt", "Anbei eine Fotobeschreibung")],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(processed.artifacts.len(), 1);
        let artifact = &processed.artifacts[0];
        assert_eq!(artifact.av_status, AvStatus::Clean);
        assert!(artifact.extracted_text_sha256.is_some());
        assert_eq!(processed.clean_texts_c14n.len(), 1);
        assert_eq!(processed.clean_texts_c14n[0].0, artifact.attachment_id);
        assert!(processed.clean_texts_c14n[0].1.contains("fotobeschreibung"));
        assert_eq!(artifact.doc_type_candidates.len(), 1);
        assert_eq!(
            artifact.doc_type_candidates[0].doc_type_label,
            "DOC_PHOTO_EVIDENCE"
        );
    }

    #[tokio::test]
    async fn infected_attachment_gets_no_text() {
        let store = MemoryAttachmentStore::new();
        let stage = AttachmentStage {
            store: &store,
            scanner: &FakeScanner {
                infected_filenames: vec!["malware.txt".into()],
            },
            text_extractor: &NoOcr,
        };
        let processed = stage
            .process(
                "msg-1",
                &[text_attachment("1", "malware.txt", "bad content")],
                Utc::now(),
            )
            .await
            .unwrap();
        let artifact = &processed.artifacts[0];
        assert_eq!(artifact.av_status, AvStatus::Infected);
        assert!(artifact.extracted_text_sha256.is_none());
        assert!(processed.clean_texts_c14n.is_empty());
        assert!(processed.has_nonclean());
    }

    #[tokio::test]
    async fn artifacts_are_canonically_ordered() {
        let store = MemoryAttachmentStore::new();
        let stage = AttachmentStage {
            store: &store,
            scanner: &FakeScanner {
                infected_filenames: vec![],
            },
            text_extractor: &NoOcr,
        };
        let processed = stage
            .process(
                "msg-1",
                &[
                    text_attachment("1", "zzz.txt", "content one"),
                    text_attachment("2", "aaa.txt", "content two"),
                ],
                Utc::now(),
            )
            .await
            .unwrap();
        let shas: Vec<&str> = processed.artifacts.iter().map(|a| a.sha256.as_str()).collect();
        let mut sorted = shas.clone();
        sorted.sort_unstable();
        assert_eq!(shas, sorted);
    }

    #[tokio::test]
    async fn attachment_ids_stable_across_runs() {
        let store = MemoryAttachmentStore::new();
        let stage = AttachmentStage {
            store: &store,
            scanner: &FakeScanner {
                infected_filenames: vec![],
            },
            text_extractor: &NoOcr,
        };
        let att = text_attachment("1", "a.txt", "same bytes");
        let first = stage.process("msg-1", &[att.clone()], Utc::now()).await.unwrap();
        let second = stage.process("msg-1", &[att], Utc::now()).await.unwrap();
        assert_eq!(
            first.artifacts[0].attachment_id,
            second.artifacts[0].attachment_id
        );
    }
}
