//! Upload types for chunked and direct video ingestion

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum size of a single chunk request body: 10MB
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Maximum direct upload size: 2GiB
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Requests up to this declared size are classified before streaming: 1MiB
pub const CLASSIFY_LIMIT: usize = 1024 * 1024;

/// Upper bound on chunks per upload; keeps `chunk_{:06}` fixed-width
pub const MAX_TOTAL_CHUNKS: u32 = 1_000_000;

/// Orphaned chunk retention: 24 hours
pub const RETENTION_HOURS: u64 = 24;

/// Sweep interval: 6 hours
pub const SWEEP_INTERVAL_SECS: u64 = 6 * 60 * 60;

/// Field carrying the upload id in a finalize request
pub const CONTROL_FIELD: &str = "uploadId";

const MAX_SEGMENT_LEN: usize = 128;

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Raw chunk metadata as received from the client.
///
/// Every field is optional here so that a missing field surfaces as a
/// validation error rather than an extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadParams {
    pub upload_id: Option<String>,
    pub chunk_index: Option<String>,
    pub total_chunks: Option<String>,
    pub filename: Option<String>,
}

impl ChunkUploadParams {
    /// Validate the raw fields into a [`ChunkMeta`].
    pub fn validate(self) -> Result<ChunkMeta, UploadError> {
        let upload_id = required(self.upload_id, "uploadId")?;
        let chunk_index = required(self.chunk_index, "chunkIndex")?;
        let total_chunks = required(self.total_chunks, "totalChunks")?;
        let filename = required(self.filename, "filename")?;

        validate_segment("uploadId", &upload_id)?;

        let chunk_index: u32 = chunk_index.trim().parse().map_err(|_| {
            UploadError::Validation(format!("chunkIndex is not an integer: {chunk_index}"))
        })?;
        let total_chunks: u32 = total_chunks.trim().parse().map_err(|_| {
            UploadError::Validation(format!("totalChunks is not an integer: {total_chunks}"))
        })?;

        if total_chunks == 0 || total_chunks > MAX_TOTAL_CHUNKS {
            return Err(UploadError::Validation(format!(
                "totalChunks must be between 1 and {MAX_TOTAL_CHUNKS}, got {total_chunks}"
            )));
        }
        if chunk_index >= total_chunks {
            return Err(UploadError::Validation(format!(
                "chunkIndex {chunk_index} out of range for {total_chunks} chunks"
            )));
        }

        Ok(ChunkMeta {
            upload_id,
            chunk_index,
            total_chunks,
            filename,
        })
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, UploadError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(UploadError::Validation(format!("missing required field: {name}"))),
    }
}

/// Validated chunk metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub filename: String,
}

/// Response after storing a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub upload_id: String,
    pub chunk_index: u32,
    /// Distinct ordinals present on disk
    pub uploaded_chunks: usize,
    pub total_chunks: u32,
    pub is_complete: bool,
}

/// One stored fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub upload_id: String,
    pub ordinal: u32,
    pub size: u64,
    pub path: PathBuf,
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Request to merge a completed chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,

    /// Overrides the filename recorded with the first chunk
    #[serde(default)]
    pub filename: Option<String>,
}

impl FinalizeRequest {
    /// Build from decoded form fields (classifier finalization path)
    pub fn from_fields(fields: &FormFields) -> Result<Self, UploadError> {
        let upload_id = fields
            .get(CONTROL_FIELD)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                UploadError::Validation(format!("missing required field: {CONTROL_FIELD}"))
            })?;

        Ok(Self {
            upload_id,
            filename: fields
                .get("filename")
                .or_else(|| fields.get("fileName"))
                .cloned(),
        })
    }
}

/// Plain (non-file) multipart fields by name; a repeated name keeps the last value
pub type FormFields = std::collections::HashMap<String, String>;

// ============================================================================
// Session Types
// ============================================================================

/// Upload manifest persisted next to the fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub total_chunks: u32,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Chunked upload state, derived from the upload directory
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub tenant_id: String,
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    /// Ordinals with a fragment on disk
    pub received: BTreeSet<u32>,
    pub last_write: DateTime<Utc>,
}

impl UploadSession {
    /// True only when the exact ordinal set `0..total_chunks` is present
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
            && (0..self.total_chunks).all(|i| self.received.contains(&i))
    }

    pub fn uploaded_chunks(&self) -> usize {
        self.received.len()
    }

    /// Ordinals that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.received.len() as f64 / self.total_chunks as f64) * 100.0
    }
}

/// Session status response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    pub uploaded_chunks: usize,
    pub missing_chunks: Vec<u32>,
    pub progress: f64,
    pub is_complete: bool,
    pub last_write_at: DateTime<Utc>,
}

impl From<UploadSession> for SessionStatusResponse {
    fn from(session: UploadSession) -> Self {
        Self {
            progress: session.progress(),
            is_complete: session.is_complete(),
            uploaded_chunks: session.uploaded_chunks(),
            missing_chunks: session.missing_chunks(),
            upload_id: session.upload_id,
            filename: session.filename,
            total_chunks: session.total_chunks,
            last_write_at: session.last_write,
        }
    }
}

// ============================================================================
// Artifact Types
// ============================================================================

/// A complete, hashed file ready for downstream processing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalArtifact {
    pub tenant_id: String,
    pub artifact_id: String,
    pub original_name: String,
    pub stored_name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Hex-encoded SHA-256
    pub digest: String,
    pub duration_ms: u64,
    /// Bytes per second
    pub throughput: f64,
}

impl FinalArtifact {
    /// Delete the artifact and its directory.
    ///
    /// Failures are logged and swallowed.
    pub async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(
                artifact_id = %self.artifact_id,
                path = %self.path.display(),
                error = %e,
                "Failed to remove discarded artifact"
            );
        }
        if let Some(dir) = self.path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }
}

/// Bytes per second for a transfer of `size` bytes
pub fn throughput(size: u64, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        size as f64 / secs
    } else {
        size as f64
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid file type: {0}")]
    InvalidFileType(String),

    #[error("Entity too large (max: {limit} bytes)")]
    EntityTooLarge { limit: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload incomplete, missing chunks: {missing:?}")]
    Incomplete { missing: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer aborted: {0}")]
    Aborted(String),

    #[error("Downstream hand-off failed: {0}")]
    Downstream(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::EntityTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Incomplete { .. } => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Aborted(_) => StatusCode::BAD_REQUEST,
            Self::Downstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidFileType(_) => "INVALID_FILE_TYPE",
            Self::EntityTooLarge { .. } => "ENTITY_TOO_LARGE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Incomplete { .. } => "UPLOAD_INCOMPLETE",
            Self::Io(_) => "IO_ERROR",
            Self::Aborted(_) => "ABORTED",
            Self::Downstream(_) => "DOWNSTREAM_ERROR",
        }
    }
}

/// Check that `value` is usable as a single directory name.
pub fn validate_segment(name: &str, value: &str) -> Result<(), UploadError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_SEGMENT_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if ok {
        Ok(())
    } else {
        Err(UploadError::Validation(format!(
            "{name} must be 1-{MAX_SEGMENT_LEN} characters of [A-Za-z0-9_-]"
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params(index: &str, total: &str) -> ChunkUploadParams {
        ChunkUploadParams {
            upload_id: Some("up-1".to_string()),
            chunk_index: Some(index.to_string()),
            total_chunks: Some(total.to_string()),
            filename: Some("clip.mp4".to_string()),
        }
    }

    fn session(total: u32, received: &[u32]) -> UploadSession {
        UploadSession {
            tenant_id: "t1".to_string(),
            upload_id: "up-1".to_string(),
            filename: "clip.mp4".to_string(),
            total_chunks: total,
            received: received.iter().copied().collect(),
            last_write: Utc::now(),
        }
    }

    #[test]
    fn test_validate_params() {
        let meta = params("2", "3").validate().unwrap();
        assert_eq!(meta.chunk_index, 2);
        assert_eq!(meta.total_chunks, 3);
    }

    #[test]
    fn test_validate_rejects_missing_and_malformed() {
        let mut missing = params("0", "3");
        missing.filename = None;
        assert!(matches!(missing.validate(), Err(UploadError::Validation(_))));

        assert!(matches!(params("x", "3").validate(), Err(UploadError::Validation(_))));
        assert!(matches!(params("3", "3").validate(), Err(UploadError::Validation(_))));
        assert!(matches!(params("-1", "3").validate(), Err(UploadError::Validation(_))));
        assert!(matches!(params("0", "0").validate(), Err(UploadError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_path_like_upload_id() {
        let mut p = params("0", "1");
        p.upload_id = Some("../etc".to_string());
        assert!(matches!(p.validate(), Err(UploadError::Validation(_))));
    }

    #[test]
    fn test_session_completeness_is_set_based() {
        assert!(session(3, &[0, 1, 2]).is_complete());
        assert!(!session(3, &[0, 2]).is_complete());
        assert_eq!(session(3, &[0, 2]).missing_chunks(), vec![1]);
        // Right count, wrong ordinals
        assert!(!session(3, &[0, 1, 5]).is_complete());
    }

    #[test]
    fn test_finalize_request_from_fields() {
        let mut fields = FormFields::new();
        fields.insert("uploadId".to_string(), "X".to_string());
        let request = FinalizeRequest::from_fields(&fields).unwrap();
        assert_eq!(request.upload_id, "X");
        assert!(request.filename.is_none());

        assert!(FinalizeRequest::from_fields(&FormFields::new()).is_err());
    }
}
