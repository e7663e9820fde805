//! Upload Routes
//!
//! HTTP endpoints for chunked and direct video uploads.
//!
//! Endpoints:
//! - POST /api/v1/uploads/chunks - Store one fragment (raw body, metadata in the query)
//! - POST /api/v1/uploads/finalize - Merge a completed chunked upload
//! - POST /api/v1/uploads - Multipart: finalize signal or direct upload
//! - GET /api/v1/uploads/:upload_id - Chunked upload status
//! - DELETE /api/v1/uploads/:upload_id - Cancel a chunked upload
//!
//! The tenant comes from the `x-tenant-id` header set by the auth layer.

use std::time::Instant;

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::jobs::ProcessingJob;
use crate::state::AppState;
use crate::upload::{
    validate_segment, ArtifactLocation, BufferedBody, ChunkUploadParams, ChunkUploadResponse,
    Classification, FinalArtifact, FinalizeRequest, PartialFile, SessionStatusResponse,
    TransferHandle, UploadError, CONTROL_FIELD,
};

/// Header carrying the authenticated tenant
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Allowance for multipart framing on top of the file size ceiling
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Largest JSON body accepted by the finalize endpoint
const FINALIZE_BODY_LIMIT: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Tenant Extractor
// ============================================================================

/// Tenant id from the `x-tenant-id` header, validated as a path segment
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = UploadError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if value.is_empty() {
            return Err(UploadError::Validation(format!(
                "missing {TENANT_HEADER} header"
            )));
        }
        validate_segment("tenantId", value)?;

        Ok(TenantId(value.to_string()))
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        // Streamed bodies enforce their own limits
        .route("/", post(upload).layer(DefaultBodyLimit::disable()))
        .route("/chunks", post(upload_chunk).layer(DefaultBodyLimit::disable()))
        .route(
            "/finalize",
            post(finalize).layer(DefaultBodyLimit::max(FINALIZE_BODY_LIMIT)),
        )
        .route("/:upload_id", get(get_session).delete(cancel_upload))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads/chunks?uploadId&chunkIndex&totalChunks&filename
///
/// Store one fragment. The fragment is the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(params): Query<ChunkUploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let meta = params.validate()?;
    let limit = state.chunk_store().max_chunk_size();

    if content_length(&headers).is_some_and(|len| len > limit as u64) {
        return Err(UploadError::EntityTooLarge {
            limit: limit as u64,
        });
    }
    let data = read_limited(body.into_data_stream(), limit).await?;

    let response = state
        .chunk_store()
        .store_chunk(&tenant_id, &meta, data)
        .await?;

    Ok(Json(response))
}

/// POST /api/v1/uploads/finalize
///
/// Merge a completed chunked upload into an artifact.
async fn finalize(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    payload: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<FinalArtifact>, UploadError> {
    let Json(request) = payload.map_err(|e| match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => UploadError::EntityTooLarge {
            limit: FINALIZE_BODY_LIMIT as u64,
        },
        _ => UploadError::Validation(format!("invalid finalize request: {e}")),
    })?;

    let artifact = finalize_chunked(&state, &tenant_id, request).await?;
    Ok(Json(artifact))
}

/// POST /api/v1/uploads
///
/// Multipart entry point. Small bodies are buffered and classified as
/// either a finalize signal or a tiny direct upload; anything larger, or
/// without a declared length, streams straight to the direct receiver.
async fn upload(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<FinalArtifact>, UploadError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| UploadError::Validation("missing content-type header".to_string()))?;
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| UploadError::Validation(format!("expected multipart/form-data: {e}")))?;

    let config = &state.config().upload;
    let declared = content_length(&headers);

    if declared.is_some_and(|len| len > config.max_file_size + MULTIPART_OVERHEAD) {
        tracing::warn!(
            tenant_id = %tenant_id,
            declared = declared,
            "Rejected upload by declared length"
        );
        return Err(UploadError::EntityTooLarge {
            limit: config.max_file_size,
        });
    }

    match declared {
        Some(len) if len <= config.classify_limit as u64 => {
            let buffered =
                BufferedBody::buffer(body.into_data_stream(), boundary, config.classify_limit)
                    .await?;

            match buffered.classify(CONTROL_FIELD).await? {
                Classification::Finalize(fields) => {
                    let request = FinalizeRequest::from_fields(&fields)?;
                    let artifact = finalize_chunked(&state, &tenant_id, request).await?;
                    Ok(Json(artifact))
                }
                Classification::Passthrough(buffered) => {
                    let artifact = receive_direct(
                        &state,
                        &tenant_id,
                        buffered.materialize(),
                        buffered.boundary(),
                    )
                    .await?;
                    Ok(Json(artifact))
                }
            }
        }
        _ => {
            let artifact =
                receive_direct(&state, &tenant_id, body.into_data_stream(), &boundary).await?;
            Ok(Json(artifact))
        }
    }
}

/// GET /api/v1/uploads/:upload_id
async fn get_session(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(upload_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, UploadError> {
    validate_segment("uploadId", &upload_id)?;

    let session = state
        .chunk_store()
        .session(&tenant_id, &upload_id)
        .await?
        .ok_or_else(|| UploadError::NotFound(format!("upload {upload_id}")))?;

    Ok(Json(session.into()))
}

/// DELETE /api/v1/uploads/:upload_id
///
/// Cancel a chunked upload and delete its fragments.
async fn cancel_upload(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    validate_segment("uploadId", &upload_id)?;

    if state.chunk_store().purge_upload(&tenant_id, &upload_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(UploadError::NotFound(format!("upload {upload_id}")))
    }
}

// ============================================================================
// Ingestion Flows
// ============================================================================

/// Merge a completed chunked upload and hand the artifact off.
///
/// Shared by the JSON finalize endpoint and the classifier's finalize path.
pub async fn finalize_chunked(
    state: &AppState,
    tenant_id: &str,
    request: FinalizeRequest,
) -> Result<FinalArtifact, UploadError> {
    let upload_id = request.upload_id;
    validate_segment("uploadId", &upload_id)?;

    let store = state.chunk_store();
    let session = store
        .session(tenant_id, &upload_id)
        .await?
        .ok_or_else(|| UploadError::NotFound(format!("upload {upload_id}")))?;

    if !session.is_complete() {
        return Err(UploadError::Incomplete {
            missing: session.missing_chunks(),
        });
    }

    let original_name = request
        .filename
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(session.filename);
    let location =
        ArtifactLocation::new(&state.config().storage.artifact_dir, tenant_id, &original_name);

    tracing::info!(
        tenant_id = %tenant_id,
        upload_id = %upload_id,
        artifact_id = %location.artifact_id,
        chunks = session.total_chunks,
        "Merging chunked upload"
    );

    let started = Instant::now();
    let (partial, file) = PartialFile::create(&location).await?;
    drop(file);

    let report = match store.merge(tenant_id, &upload_id, partial.path()).await {
        Ok(report) => report,
        Err(e) => {
            partial.discard().await;
            return Err(e);
        }
    };
    partial.promote(&location.path).await?;

    let artifact = location.into_artifact(report.bytes, report.digest, started.elapsed());
    tracing::info!(
        tenant_id = %tenant_id,
        upload_id = %upload_id,
        artifact_id = %artifact.artifact_id,
        bytes = artifact.size,
        digest = %artifact.digest,
        duration_ms = artifact.duration_ms,
        "Chunked upload finalized"
    );

    hand_off(state, &artifact).await?;
    Ok(artifact)
}

async fn receive_direct<S, O, E>(
    state: &AppState,
    tenant_id: &str,
    body: S,
    boundary: &str,
) -> Result<FinalArtifact, UploadError>
where
    S: Stream<Item = Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let handle = TransferHandle::with_parent(state.shutdown());
    let upload = state
        .direct_receiver()
        .receive(tenant_id, body, boundary, &handle)
        .await?;

    hand_off(state, &upload.artifact).await?;
    Ok(upload.artifact)
}

/// Enqueue the processing job; on failure the artifact is discarded.
async fn hand_off(state: &AppState, artifact: &FinalArtifact) -> Result<(), UploadError> {
    let queue = state.jobs();

    if let Err(e) = queue.enqueue(ProcessingJob::from(artifact)).await {
        tracing::error!(
            artifact_id = %artifact.artifact_id,
            queue = queue.name(),
            error = %e,
            "Failed to enqueue processing job, discarding artifact"
        );
        artifact.discard().await;
        return Err(UploadError::Downstream(e.to_string()));
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read a whole body, failing as soon as it exceeds `limit` bytes
async fn read_limited<S>(body: S, limit: usize) -> Result<Bytes, UploadError>
where
    S: Stream<Item = Result<Bytes, axum::Error>>,
{
    let mut body = std::pin::pin!(body);
    let mut buf = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|e| UploadError::Aborted(format!("request body read failed: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(UploadError::EntityTooLarge {
                limit: limit as u64,
            });
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(buf))
}

// ============================================================================
// Tests
// ============================================================================
