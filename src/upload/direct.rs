//! Streaming Direct Receiver
//!
//! Decodes a multipart body incrementally and writes its single file part
//! to disk without ever holding the whole file in memory.
//!
//! Reading, hashing and writing are pipelined: the reader hashes each chunk
//! and hands it to the writer through a bounded channel, so a slow disk
//! back-pressures how fast the network is read. Both halves run under
//! `try_join!`; whichever fails first ends the transfer and the partial file
//! is removed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use futures::Stream;
use multer::{Field, Multipart};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::artifact::{extension, ArtifactLocation, PartialFile};
use super::transfer::{TransferHandle, TransferState};
use super::types::{validate_segment, FinalArtifact, FormFields, UploadError, MAX_FILE_SIZE};

/// Chunks in flight between reader and writer
const WRITE_QUEUE_DEPTH: usize = 8;

/// Cap on a single plain form field
const MAX_PLAIN_FIELD_SIZE: usize = 64 * 1024;

/// Cap on plain form fields per request
const MAX_PLAIN_FIELDS: usize = 32;

/// Cap on the combined size of all plain form fields in one request
const MAX_FORM_BYTES: usize = 256 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Direct upload acceptance rules
#[derive(Debug, Clone)]
pub struct DirectUploadConfig {
    /// Size ceiling for the file part
    pub max_file_size: u64,
    /// Lower-cased MIME essences, e.g. `video/mp4`
    pub allowed_mime_types: Vec<String>,
    /// Lower-cased extensions without the dot
    pub allowed_extensions: Vec<String>,
    /// Multipart field name the file must arrive under
    pub field_name: String,
}

impl Default for DirectUploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
            allowed_mime_types: [
                "video/mp4",
                "video/quicktime",
                "video/x-msvideo",
                "video/x-matroska",
                "video/webm",
                "video/mpeg",
                "video/x-m4v",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_extensions: ["mp4", "mov", "avi", "mkv", "webm", "mpeg", "mpg", "m4v"]
                .into_iter()
                .map(String::from)
                .collect(),
            field_name: "video".to_string(),
        }
    }
}

/// Result of a successful direct upload
#[derive(Debug, Clone)]
pub struct DirectUpload {
    pub artifact: FinalArtifact,
    /// Plain fields sent alongside the file
    pub fields: FormFields,
}

// ============================================================================
// Receiver
// ============================================================================

/// Streams multipart file uploads into the artifact store
#[derive(Clone)]
pub struct DirectReceiver {
    inner: Arc<DirectReceiverInner>,
}

struct DirectReceiverInner {
    artifact_root: PathBuf,
    config: DirectUploadConfig,
}

impl DirectReceiver {
    pub fn new(artifact_root: PathBuf, config: DirectUploadConfig) -> Self {
        Self {
            inner: Arc::new(DirectReceiverInner {
                artifact_root,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DirectUploadConfig {
        &self.inner.config
    }

    /// Consume one multipart body and store its file part.
    ///
    /// The body may be a live request stream or a replayed buffer; the
    /// receiver reads it exactly once either way.
    pub async fn receive<S, O, E>(
        &self,
        tenant_id: &str,
        body: S,
        boundary: &str,
        handle: &TransferHandle,
    ) -> Result<DirectUpload, UploadError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        validate_segment("tenantId", tenant_id)?;
        handle.set_state(TransferState::Waiting);

        let mut multipart = Multipart::new(body, boundary);
        let result = self.consume(tenant_id, &mut multipart, handle).await;

        match &result {
            Ok(upload) => {
                handle.set_state(TransferState::Complete);
                tracing::info!(
                    tenant_id = %tenant_id,
                    artifact_id = %upload.artifact.artifact_id,
                    original_name = %upload.artifact.original_name,
                    bytes = upload.artifact.size,
                    digest = %upload.artifact.digest,
                    duration_ms = upload.artifact.duration_ms,
                    throughput = format!("{:.0} B/s", upload.artifact.throughput),
                    "Direct upload stored"
                );
            }
            Err(e) => {
                handle.set_state(TransferState::Aborted);
                if matches!(
                    e,
                    UploadError::Validation(_) | UploadError::InvalidFileType(_)
                ) {
                    drain(&mut multipart, &handle.cancellation_token()).await;
                }
                tracing::warn!(
                    tenant_id = %tenant_id,
                    bytes = handle.bytes_received(),
                    error = %e,
                    "Direct upload rejected"
                );
            }
        }

        result
    }

    async fn consume(
        &self,
        tenant_id: &str,
        multipart: &mut Multipart<'static>,
        handle: &TransferHandle,
    ) -> Result<DirectUpload, UploadError> {
        let mut fields = FormFields::new();
        let mut artifact: Option<FinalArtifact> = None;

        let outcome = self
            .consume_fields(tenant_id, multipart, handle, &mut fields, &mut artifact)
            .await;

        match (outcome, artifact) {
            (Ok(()), Some(artifact)) => Ok(DirectUpload { artifact, fields }),
            (Ok(()), None) => Err(UploadError::Validation(
                "request contains no file part".to_string(),
            )),
            (Err(e), Some(artifact)) => {
                // A later part failed after the file was stored
                artifact.discard().await;
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    async fn consume_fields(
        &self,
        tenant_id: &str,
        multipart: &mut Multipart<'static>,
        handle: &TransferHandle,
        fields: &mut FormFields,
        artifact: &mut Option<FinalArtifact>,
    ) -> Result<(), UploadError> {
        let cancel = handle.cancellation_token();
        let mut plain_fields = 0;
        let mut form_bytes = 0;

        while let Some(mut field) = next_field(multipart, &cancel).await? {
            if field.file_name().is_none() {
                plain_fields += 1;
                if plain_fields > MAX_PLAIN_FIELDS {
                    return Err(UploadError::Validation(format!(
                        "more than {MAX_PLAIN_FIELDS} form fields"
                    )));
                }
                let name = field.name().unwrap_or_default().to_string();
                let remaining = MAX_FORM_BYTES - form_bytes;
                let value = read_plain_field(&mut field, &cancel, remaining).await?;
                form_bytes += value.len();
                fields.insert(name, value);
                continue;
            }

            if artifact.is_some() {
                return Err(UploadError::Validation(
                    "multiple file parts are not supported".to_string(),
                ));
            }
            self.check_file_part(&field)?;
            *artifact = Some(self.store_file_part(tenant_id, field, handle).await?);
        }

        Ok(())
    }

    /// Field name, MIME type and extension checks, before any state exists
    fn check_file_part(&self, field: &Field<'_>) -> Result<(), UploadError> {
        let config = &self.inner.config;

        let name = field.name().unwrap_or_default();
        if name != config.field_name {
            return Err(UploadError::Validation(format!(
                "unexpected file field '{}', expected '{}'",
                name, config.field_name
            )));
        }

        let file_name = field.file_name().unwrap_or_default();
        let mime = field
            .content_type()
            .map(|m| m.essence_str().to_ascii_lowercase())
            .unwrap_or_else(|| {
                mime_guess::from_path(file_name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        if !config.allowed_mime_types.iter().any(|m| *m == mime) {
            return Err(UploadError::InvalidFileType(format!(
                "MIME type not allowed: {mime}"
            )));
        }

        match extension(file_name) {
            Some(ext) if config.allowed_extensions.iter().any(|e| *e == ext) => Ok(()),
            _ => Err(UploadError::InvalidFileType(format!(
                "file extension not allowed: {file_name}"
            ))),
        }
    }

    async fn store_file_part(
        &self,
        tenant_id: &str,
        field: Field<'static>,
        handle: &TransferHandle,
    ) -> Result<FinalArtifact, UploadError> {
        let original_name = field.file_name().unwrap_or_default().to_string();
        let location = ArtifactLocation::new(&self.inner.artifact_root, tenant_id, &original_name);
        let (partial, file) = PartialFile::create(&location).await?;

        handle.set_state(TransferState::Streaming);
        let started = Instant::now();

        match self.pipe(field, file, handle).await {
            Ok((size, digest)) => {
                partial.promote(&location.path).await?;
                Ok(location.into_artifact(size, digest, started.elapsed()))
            }
            Err(e) => {
                partial.discard().await;
                Err(e)
            }
        }
    }

    /// Copy the field to `file`, returning its size and SHA-256.
    ///
    /// Returns only after the file has been flushed and synced.
    async fn pipe(
        &self,
        mut field: Field<'static>,
        file: fs::File,
        handle: &TransferHandle,
    ) -> Result<(u64, String), UploadError> {
        let limit = self.inner.config.max_file_size;
        let cancel = handle.cancellation_token();
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

        let reader = async move {
            let mut hasher = Sha256::new();
            let mut total: u64 = 0;

            while let Some(chunk) = next_chunk(&mut field, &cancel).await? {
                total += chunk.len() as u64;
                if total > limit {
                    return Err(UploadError::EntityTooLarge { limit });
                }
                hasher.update(&chunk);
                handle.record(chunk.len());

                if tx.send(chunk).await.is_err() {
                    // Writer already failed; its error is the one reported
                    return Err(UploadError::Aborted("writer stopped".to_string()));
                }
            }

            drop(tx);
            Ok::<_, UploadError>((total, hex::encode(hasher.finalize())))
        };

        let writer = async move {
            let mut out = BufWriter::new(file);
            while let Some(chunk) = rx.recv().await {
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            out.get_ref().sync_all().await?;
            Ok::<_, UploadError>(())
        };

        let (outcome, ()) = tokio::try_join!(reader, writer)?;
        Ok(outcome)
    }
}

// ============================================================================
// Multipart helpers
// ============================================================================

async fn next_field(
    multipart: &mut Multipart<'static>,
    cancel: &CancellationToken,
) -> Result<Option<Field<'static>>, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Aborted("transfer cancelled".to_string())),
        field = multipart.next_field() => field.map_err(stream_error),
    }
}

async fn next_chunk(
    field: &mut Field<'static>,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Aborted("transfer cancelled".to_string())),
        chunk = field.chunk() => chunk.map_err(stream_error),
    }
}

/// Read a plain field, failing once it passes its own cap or `remaining`,
/// what is left of the request's form budget.
async fn read_plain_field(
    field: &mut Field<'static>,
    cancel: &CancellationToken,
    remaining: usize,
) -> Result<String, UploadError> {
    let mut buf = Vec::new();
    while let Some(chunk) = next_chunk(field, cancel).await? {
        let len = buf.len() + chunk.len();
        if len > MAX_PLAIN_FIELD_SIZE {
            return Err(UploadError::Validation(format!(
                "form field '{}' exceeds {} bytes",
                field.name().unwrap_or_default(),
                MAX_PLAIN_FIELD_SIZE
            )));
        }
        if len > remaining {
            return Err(UploadError::EntityTooLarge {
                limit: MAX_FORM_BYTES as u64,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf)
        .map_err(|_| UploadError::Validation("form field is not valid UTF-8".to_string()))
}

/// Read and discard the rest of the body so the connection does not stall
async fn drain(multipart: &mut Multipart<'static>, cancel: &CancellationToken) {
    loop {
        match next_field(multipart, cancel).await {
            Ok(Some(mut field)) => {
                while let Ok(Some(_)) = next_chunk(&mut field, cancel).await {}
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Transport failures and truncated bodies are aborts; anything else is a
/// malformed request.
fn stream_error(e: multer::Error) -> UploadError {
    match e {
        multer::Error::StreamReadFailed(source) => {
            UploadError::Aborted(format!("request body read failed: {source}"))
        }
        multer::Error::IncompleteStream | multer::Error::IncompleteFieldData { .. } => {
            UploadError::Aborted("request body ended before the multipart terminator".to_string())
        }
        other => UploadError::Validation(format!("malformed multipart body: {other}")),
    }
}

// ============================================================================
// Tests
// ============================================================================
