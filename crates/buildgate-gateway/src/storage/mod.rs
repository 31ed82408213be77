//! Artifact storage for uploaded build contexts.
//!
//! The gateway only needs "upload these bytes under this key" from the
//! backend. Every upload happens inside an [`ArtifactSession`] scoped to one
//! build session; the session is released with [`ArtifactSession::close`]
//! (or on drop) whatever the outcome of the upload.

mod fs;

pub use fs::{ArtifactMeta, FsArtifactStore, StoreStats};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

/// Options attached to a single upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: String,
    /// Storage-side expiry of the artifact.
    pub lifetime: Duration,
    pub metadata: BTreeMap<String, String>,
}

/// Durable blob store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Acquire a storage session scoped to `session_id`.
    async fn open_session(&self, session_id: &str)
    -> Result<Box<dyn ArtifactSession>, StorageError>;
}

/// A scoped, credential-bounded handle on the store.
#[async_trait]
pub trait ArtifactSession: Send {
    /// Upload `data` under `key`, returning the key the artifact was stored at.
    async fn upload(
        &mut self,
        data: Vec<u8>,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, StorageError>;

    /// Release the session.
    async fn close(self: Box<Self>);
}

/// Errors from artifact storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage session error: {0}")]
    Session(String),

    #[error("Invalid artifact key: {0:?}")]
    InvalidKey(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}
