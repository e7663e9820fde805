//! Chunk Store
//!
//! Durable per-upload fragment storage on the local filesystem.
//!
//! Layout:
//!
//! ```text
//! <root>/<tenant>/<upload_id>/upload.json
//! <root>/<tenant>/<upload_id>/chunk_000000.part
//! <root>/<tenant>/.merging-<upload_id>-<uuid>/   upload being merged
//! <root>/.incoming/<uuid>/...              staging area for in-flight writes
//! ```
//!
//! There is no in-memory index: every session query lists the directory.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::merge::{merge_chunks, MergeReport};
use super::types::{
    validate_segment, ChunkMeta, ChunkUploadResponse, UploadError, UploadManifest, UploadSession,
    MAX_CHUNK_SIZE,
};

/// Name of the staging directory under the chunk root
pub const INCOMING_DIR: &str = ".incoming";

/// Per-upload manifest file name
pub const MANIFEST_FILE: &str = "upload.json";

/// Prefix of an upload directory claimed by an in-flight merge
const MERGING_PREFIX: &str = ".merging-";

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_SUFFIX: &str = ".part";

// ============================================================================
// Chunk Store
// ============================================================================

/// Filesystem-backed chunk storage
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    root: PathBuf,
    max_chunk_size: usize,
}

impl ChunkStore {
    /// Create a store rooted at `root` with the default chunk size cap
    pub fn new(root: PathBuf) -> Self {
        Self::with_max_chunk_size(root, MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk_size(root: PathBuf, max_chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                root,
                max_chunk_size,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_chunk_size(&self) -> usize {
        self.inner.max_chunk_size
    }

    /// Directory holding the fragments of one upload
    pub fn upload_dir(&self, tenant_id: &str, upload_id: &str) -> PathBuf {
        self.inner.root.join(tenant_id).join(upload_id)
    }

    fn incoming_dir(&self) -> PathBuf {
        self.inner.root.join(INCOMING_DIR)
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Store one fragment.
    ///
    /// The bytes land in a private staging directory first and are renamed
    /// into place, so a concurrent listing never sees a partial fragment.
    /// Re-sending an ordinal replaces the previous fragment.
    pub async fn store_chunk(
        &self,
        tenant_id: &str,
        meta: &ChunkMeta,
        data: Bytes,
    ) -> Result<ChunkUploadResponse, UploadError> {
        validate_segment("tenantId", tenant_id)?;
        if data.len() > self.inner.max_chunk_size {
            return Err(UploadError::EntityTooLarge {
                limit: self.inner.max_chunk_size as u64,
            });
        }

        let staging = self.incoming_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging).await?;

        let placed = self.place_chunk(tenant_id, meta, &staging, &data).await;

        if let Err(e) = fs::remove_dir_all(&staging).await {
            tracing::debug!(
                staging = %staging.display(),
                error = %e,
                "Failed to remove staging directory"
            );
        }
        placed?;

        let session = self
            .session(tenant_id, &meta.upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(meta.upload_id.clone()))?;

        tracing::debug!(
            tenant_id = %tenant_id,
            upload_id = %meta.upload_id,
            chunk_index = meta.chunk_index,
            bytes = data.len(),
            uploaded_chunks = session.uploaded_chunks(),
            total_chunks = session.total_chunks,
            progress = format!("{:.1}%", session.progress()),
            "Chunk stored"
        );

        Ok(ChunkUploadResponse {
            upload_id: meta.upload_id.clone(),
            chunk_index: meta.chunk_index,
            uploaded_chunks: session.uploaded_chunks(),
            total_chunks: session.total_chunks,
            is_complete: session.is_complete(),
        })
    }

    async fn place_chunk(
        &self,
        tenant_id: &str,
        meta: &ChunkMeta,
        staging: &Path,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let name = chunk_file_name(meta.chunk_index);
        let staged = staging.join(&name);
        {
            let mut file = fs::File::create(&staged).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }

        let dir = self.upload_dir(tenant_id, &meta.upload_id);
        fs::create_dir_all(&dir).await?;
        self.ensure_manifest(&dir, meta).await?;

        fs::rename(&staged, dir.join(name)).await?;
        Ok(())
    }

    /// Write the manifest on first chunk; later chunks must agree with it.
    async fn ensure_manifest(&self, dir: &Path, meta: &ChunkMeta) -> Result<(), UploadError> {
        let path = dir.join(MANIFEST_FILE);

        match read_manifest(&path).await? {
            Some(existing) if existing.total_chunks != meta.total_chunks => {
                Err(UploadError::Validation(format!(
                    "totalChunks {} does not match {} recorded for upload {}",
                    meta.total_chunks, existing.total_chunks, meta.upload_id
                )))
            }
            Some(_) => Ok(()),
            None => {
                let manifest = UploadManifest {
                    total_chunks: meta.total_chunks,
                    filename: meta.filename.clone(),
                    created_at: Utc::now(),
                };
                let raw = serde_json::to_vec(&manifest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                let temp = dir.join(format!("{MANIFEST_FILE}.tmp.{}", Uuid::new_v4()));
                fs::write(&temp, raw).await?;
                fs::rename(&temp, &path).await?;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// Derive the session for an upload from its directory.
    ///
    /// Returns `None` when no chunk has landed yet.
    pub async fn session(
        &self,
        tenant_id: &str,
        upload_id: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        let dir = self.upload_dir(tenant_id, upload_id);

        let Some(manifest) = read_manifest(&dir.join(MANIFEST_FILE)).await? else {
            return Ok(None);
        };

        let mut received = BTreeSet::new();
        let mut last_write: Option<DateTime<Utc>> = None;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            // A concurrent manifest rename can remove an entry mid-listing
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified: DateTime<Utc> = metadata.modified()?.into();
            last_write = Some(last_write.map_or(modified, |t| t.max(modified)));

            if let Some(ordinal) = parse_ordinal(&entry.file_name().to_string_lossy()) {
                if ordinal < manifest.total_chunks {
                    received.insert(ordinal);
                }
            }
        }

        Ok(Some(UploadSession {
            tenant_id: tenant_id.to_string(),
            upload_id: upload_id.to_string(),
            filename: manifest.filename,
            total_chunks: manifest.total_chunks,
            received,
            last_write: last_write.unwrap_or(manifest.created_at),
        }))
    }

    // ========================================================================
    // Merge & Cleanup
    // ========================================================================

    /// Concatenate an upload's fragments into `destination`, then delete them.
    ///
    /// The upload directory is first claimed by renaming it to a private
    /// `.merging-*` sibling, so of two concurrent merges only one proceeds;
    /// the other gets `NotFound`. Callers must have confirmed the session is
    /// complete. A failed merge leaves `destination` in place and moves the
    /// fragments back untouched.
    pub async fn merge(
        &self,
        tenant_id: &str,
        upload_id: &str,
        destination: &Path,
    ) -> Result<MergeReport, UploadError> {
        let dir = self.upload_dir(tenant_id, upload_id);
        let claimed = self.claim(&dir, upload_id).await?;

        let report = match merge_chunks(&claimed, destination).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(restore) = fs::rename(&claimed, &dir).await {
                    tracing::warn!(
                        upload_id = %upload_id,
                        claimed = %claimed.display(),
                        error = %restore,
                        "Failed to restore upload after merge error, leaving it for the sweeper"
                    );
                }
                return Err(e);
            }
        };

        match remove_upload_dir(&claimed).await {
            Ok(removed) => tracing::debug!(
                upload_id = %upload_id,
                removed = removed,
                "Removed merged chunk directory"
            ),
            Err(e) => tracing::warn!(
                upload_id = %upload_id,
                dir = %claimed.display(),
                error = %e,
                "Failed to remove merged chunk directory, leaving it for the sweeper"
            ),
        }

        Ok(report)
    }

    /// Atomically take ownership of an upload directory for merging
    async fn claim(&self, dir: &Path, upload_id: &str) -> Result<PathBuf, UploadError> {
        let claimed = dir.with_file_name(format!("{MERGING_PREFIX}{upload_id}-{}", Uuid::new_v4()));

        match fs::rename(dir, &claimed).await {
            Ok(()) => Ok(claimed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(upload_id = %upload_id, "Upload already claimed by another merge");
                Err(UploadError::NotFound(format!("upload {upload_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every fragment of an upload.
    ///
    /// Returns `false` if the upload did not exist.
    pub async fn purge_upload(&self, tenant_id: &str, upload_id: &str) -> Result<bool, UploadError> {
        let dir = self.upload_dir(tenant_id, upload_id);
        match remove_upload_dir(&dir).await {
            Ok(removed) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    upload_id = %upload_id,
                    removed = removed,
                    "Upload cancelled"
                );
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Fixed-width fragment file name; lexicographic order equals ordinal order
pub fn chunk_file_name(ordinal: u32) -> String {
    format!("{CHUNK_PREFIX}{ordinal:06}{CHUNK_SUFFIX}")
}

/// Parse the ordinal out of a fragment file name
pub fn parse_ordinal(name: &str) -> Option<u32> {
    name.strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

async fn read_manifest(path: &Path) -> Result<Option<UploadManifest>, UploadError> {
    match fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| UploadError::Io(io::Error::new(io::ErrorKind::InvalidData, e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove an upload directory and everything in it.
///
/// Shared by post-merge cleanup, cancellation and the orphan sweeper.
pub(crate) async fn remove_upload_dir(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        removed += 1;
    }

    fs::remove_dir(dir).await?;
    Ok(removed)
}

// ============================================================================
// Tests
// ============================================================================
