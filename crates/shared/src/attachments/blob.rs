use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::NormalizedAttachment;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob metadata encoding failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobStoreError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAttachmentMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub size: usize,
    pub extracted_text: String,
    pub text_length: usize,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub user_id: String,
    pub metadata: StoredAttachmentMetadata,
    pub bytes: Vec<u8>,
}

impl StoredAttachment {
    pub fn from_normalized(
        user_id: &str,
        normalized: &NormalizedAttachment,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            metadata: StoredAttachmentMetadata {
                file_id: Uuid::new_v4().to_string(),
                file_name: normalized.block.name.clone(),
                file_type: normalized.block.declared_type.clone(),
                size: normalized.bytes.len(),
                extracted_text: normalized.block.text.clone(),
                text_length: normalized.block.text.chars().count(),
                truncated: normalized.truncated,
                error: normalized.error.as_ref().map(ToString::to_string),
                uploaded_at: now,
            },
            bytes: normalized.bytes.clone(),
        }
    }
}

/// Raw upload storage. Conversation records only ever hold extracted text.
pub trait AttachmentBlobStore: Send + Sync {
    fn put<'a>(&'a self, attachment: &'a StoredAttachment) -> BlobFuture<'a, ()>;
}

/// Writes `<root>/<user>/<file_id>.bin` plus a `.json` metadata sidecar.
#[derive(Debug, Clone)]
pub struct LocalDirBlobStore {
    root: PathBuf,
}

impl LocalDirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        let safe_user = user_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.root.join(safe_user)
    }
}

impl AttachmentBlobStore for LocalDirBlobStore {
    fn put<'a>(&'a self, attachment: &'a StoredAttachment) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.user_dir(&attachment.user_id);
            tokio::fs::create_dir_all(&dir).await?;

            let file_id = &attachment.metadata.file_id;
            tokio::fs::write(dir.join(format!("{file_id}.bin")), &attachment.bytes).await?;
            let metadata = serde_json::to_vec_pretty(&attachment.metadata)?;
            tokio::fs::write(dir.join(format!("{file_id}.json")), metadata).await?;
            Ok(())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    items: Arc<RwLock<HashMap<String, StoredAttachment>>>,
}

impl InMemoryBlobStore {
    pub async fn get(&self, file_id: &str) -> Option<StoredAttachment> {
        self.items.read().await.get(file_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl AttachmentBlobStore for InMemoryBlobStore {
    fn put<'a>(&'a self, attachment: &'a StoredAttachment) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            self.items
                .write()
                .await
                .insert(attachment.metadata.file_id.clone(), attachment.clone());
            Ok(())
        })
    }
}
