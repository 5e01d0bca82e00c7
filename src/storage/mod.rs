//! Store collaborator: persistence and read-back of validated columnar artifacts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::processing::columnar::{ColumnarArtifact, has_valid_magic};
use crate::processing::types::ContentKind;

/// Errors returned by store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Artifact bytes no longer carry the magic marker or fail to decode.
    #[error("artifact rejected: magic marker validation failed")]
    InvalidArtifact,
    /// Filesystem operation failed.
    #[error("filesystem error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Manifest could not be encoded or decoded.
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    /// Backend-specific rejection.
    #[error("store rejected artifact: {0}")]
    Rejected(String),
    /// The backend does not implement this operation.
    #[error("store does not support {0}")]
    Unsupported(&'static str),
}

/// Everything a store needs to persist one artifact.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Source file identifier.
    pub file_id: String,
    /// Owning user.
    pub user_id: String,
    /// Validated artifact.
    pub artifact: ColumnarArtifact,
    /// Parser classification of the source.
    pub content_type: ContentKind,
    /// Sanitized, metadata-only parse summary.
    pub parse_summary: Value,
}

/// Receipt for a persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    /// Identifier assigned by the store.
    pub artifact_id: String,
    /// Backend-specific location.
    pub location: String,
}

/// Descriptive record kept next to every persisted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Identifier assigned by the store.
    pub artifact_id: String,
    /// Source file identifier.
    pub file_id: String,
    /// Owning user.
    pub user_id: String,
    /// Encoding label, `parquet`.
    pub format: String,
    /// Parser classification of the source.
    pub content_type: ContentKind,
    /// Rows in the artifact.
    pub row_count: usize,
    /// Columns in the artifact.
    pub column_count: usize,
    /// Whether pages are block-compressed.
    pub compressed: bool,
    /// Encoded size in bytes.
    pub byte_len: usize,
    /// RFC 3339 time of persistence.
    pub stored_at: String,
    /// Sanitized, metadata-only parse summary.
    pub parse_summary: Value,
}

/// A persisted artifact loaded back from a store.
#[derive(Debug, Clone)]
pub struct RetrievedArtifact {
    /// Record written at persistence time.
    pub record: ArtifactRecord,
    /// Re-validated artifact bytes.
    pub artifact: ColumnarArtifact,
}

/// Interface implemented by store collaborators.
///
/// Only `persist` is required; read-back defaults to [`StoreError::Unsupported`].
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist an artifact and return its identifier.
    async fn persist(&self, request: StoreRequest) -> Result<StoredArtifact, StoreError>;

    /// Load an artifact by id. `Ok(None)` when no such artifact exists.
    async fn retrieve(&self, _artifact_id: &str) -> Result<Option<RetrievedArtifact>, StoreError> {
        Err(StoreError::Unsupported("retrieve"))
    }

    /// Records owned by `user_id`, optionally limited to one source file.
    async fn list(
        &self,
        _user_id: &str,
        _file_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        Err(StoreError::Unsupported("list"))
    }
}

/// Store writing `<artifact_id>.parquet` and `<artifact_id>.json` into a directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if needed.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })
    }

    /// Directory artifacts are written into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the encoded artifact for `artifact_id`.
    pub fn artifact_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join(format!("{artifact_id}.parquet"))
    }

    /// Path of the manifest for `artifact_id`.
    pub fn manifest_path(&self, artifact_id: &str) -> PathBuf {
        self.root.join(format!("{artifact_id}.json"))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<ArtifactRecord>, StoreError> {
        match read(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Deterministic identifier derived from the owner, the source file id, and the artifact bytes.
pub fn compute_artifact_id(user_id: &str, file_id: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0]);
    hasher.update(file_id.as_bytes());
    hasher.update([0]);
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Ids produced by [`compute_artifact_id`]: 64 lowercase hex digits.
fn is_artifact_id(candidate: &str) -> bool {
    candidate.len() == 64
        && candidate
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn persist(&self, request: StoreRequest) -> Result<StoredArtifact, StoreError> {
        let artifact = &request.artifact;
        if !has_valid_magic(artifact.bytes()) {
            tracing::error!(file_id = %request.file_id, "Refusing artifact without magic marker");
            return Err(StoreError::InvalidArtifact);
        }

        let artifact_id = compute_artifact_id(&request.user_id, &request.file_id, artifact.bytes());
        let artifact_path = self.artifact_path(&artifact_id);
        write(&artifact_path, artifact.bytes()).await?;

        let record = ArtifactRecord {
            artifact_id: artifact_id.clone(),
            file_id: request.file_id.clone(),
            user_id: request.user_id.clone(),
            format: artifact.format().to_string(),
            content_type: request.content_type,
            row_count: artifact.row_count(),
            column_count: artifact.column_count(),
            compressed: artifact.compressed(),
            byte_len: artifact.byte_len(),
            stored_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            parse_summary: request.parse_summary,
        };
        let encoded = serde_json::to_vec_pretty(&record)?;
        write(&self.manifest_path(&artifact_id), &encoded).await?;

        tracing::info!(
            artifact_id = %artifact_id,
            file_id = %record.file_id,
            bytes = record.byte_len,
            "Stored columnar artifact"
        );
        Ok(StoredArtifact {
            location: artifact_path.display().to_string(),
            artifact_id,
        })
    }

    async fn retrieve(&self, artifact_id: &str) -> Result<Option<RetrievedArtifact>, StoreError> {
        if !is_artifact_id(artifact_id) {
            tracing::debug!(artifact_id, "Rejecting malformed artifact id");
            return Ok(None);
        }
        let Some(record) = self.read_record(&self.manifest_path(artifact_id)).await? else {
            return Ok(None);
        };
        let artifact_path = self.artifact_path(artifact_id);
        let Some(bytes) = read(&artifact_path).await? else {
            tracing::warn!(artifact_id, "Manifest present but artifact bytes are missing");
            return Ok(None);
        };
        let artifact = ColumnarArtifact::from_parquet(bytes).map_err(|error| {
            tracing::error!(artifact_id, error = %error, "Stored artifact failed validation");
            StoreError::InvalidArtifact
        })?;
        Ok(Some(RetrievedArtifact { record, artifact }))
    }

    async fn list(
        &self,
        user_id: &str,
        file_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let io_error = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(error)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let record = match self.read_record(&path).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "Skipping unreadable manifest"
                    );
                    continue;
                }
            };
            let same_file = file_id.is_none_or(|file_id| record.file_id == file_id);
            if record.user_id == user_id && same_file {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.stored_at
                .cmp(&b.stored_at)
                .then_with(|| a.artifact_id.cmp(&b.artifact_id))
        });
        Ok(records)
    }
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
