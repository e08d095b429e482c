//! Proof-of-payment storage collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Result, WorkflowError};

const DEFAULT_MIME: &str = "image/jpeg";

/// A decoded proof-of-payment image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofUpload {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ProofUpload {
    /// Decodes either a data URL (`data:<mime>;base64,<payload>`) or bare
    /// base64. Bare payloads are assumed to be JPEG.
    pub fn decode(input: &str) -> Result<Self> {
        let input = input.trim();
        let (mime, payload) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    WorkflowError::Validation("payment proof data URL has no payload".into())
                })?;
                let mime = header.strip_suffix(";base64").ok_or_else(|| {
                    WorkflowError::Validation("payment proof data URL must be base64".into())
                })?;
                let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };
                (mime.to_string(), payload)
            }
            None => (DEFAULT_MIME.to_string(), input),
        };

        if payload.is_empty() {
            return Err(WorkflowError::Validation("payment proof is empty".into()));
        }
        let bytes = STANDARD.decode(payload).map_err(|err| {
            WorkflowError::Validation(format!("payment proof is not valid base64: {err}"))
        })?;
        Ok(Self { mime, bytes })
    }
}

/// Name under which a proof uploaded at `now` is stored.
pub fn proof_filename(now: DateTime<Utc>) -> String {
    format!("payment-proof-{}", now.timestamp_millis())
}

/// Trait for the external image store.
#[async_trait]
pub trait ProofStore: Send + Sync {
    /// Stores the image and returns a reference to it.
    async fn store(&self, upload: ProofUpload, filename: &str) -> Result<String>;
}

#[derive(Debug, Default)]
struct InMemoryProofState {
    images: HashMap<String, (String, ProofUpload)>,
    next_id: u32,
    fail_on_store: bool,
}

/// In-memory proof store for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProofStore {
    state: Arc<RwLock<InMemoryProofState>>,
}

impl InMemoryProofStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn image_count(&self) -> usize {
        self.state.read().await.images.len()
    }

    /// Returns the filename and upload stored under `image_ref`.
    pub async fn image(&self, image_ref: &str) -> Option<(String, ProofUpload)> {
        self.state.read().await.images.get(image_ref).cloned()
    }

    pub async fn set_fail_on_store(&self, fail: bool) {
        self.state.write().await.fail_on_store = fail;
    }
}

#[async_trait]
impl ProofStore for InMemoryProofStore {
    async fn store(&self, upload: ProofUpload, filename: &str) -> Result<String> {
        let mut state = self.state.write().await;
        if state.fail_on_store {
            return Err(WorkflowError::upstream("image store", "upload rejected"));
        }
        state.next_id += 1;
        let image_ref = format!("IMG-{:04}", state.next_id);
        state
            .images
            .insert(image_ref.clone(), (filename.to_string(), upload));
        Ok(image_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_data_url() {
        let upload = ProofUpload::decode("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(upload.mime, "image/png");
        assert_eq!(upload.bytes, b"hello");
    }

    #[test]
    fn test_decode_bare_base64_defaults_to_jpeg() {
        let upload = ProofUpload::decode("aGVsbG8=").unwrap();
        assert_eq!(upload.mime, "image/jpeg");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ProofUpload::decode("not base64!!").is_err());
        assert!(ProofUpload::decode("data:image/png,aGVsbG8=").is_err());
        assert!(ProofUpload::decode("").is_err());
    }

    #[test]
    fn test_filename_uses_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(proof_filename(now), "payment-proof-1700000000123");
    }

    #[tokio::test]
    async fn test_store_assigns_sequential_refs() {
        let proofs = InMemoryProofStore::new();
        let upload = ProofUpload::decode("aGVsbG8=").unwrap();

        let first = proofs.store(upload.clone(), "a").await.unwrap();
        let second = proofs.store(upload, "b").await.unwrap();
        assert_eq!(first, "IMG-0001");
        assert_eq!(second, "IMG-0002");
        assert_eq!(proofs.image_count().await, 2);
    }
}
