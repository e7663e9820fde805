//! Ambiguous-Request Classifier
//!
//! A finalize signal for a chunked upload and a tiny direct upload arrive
//! with the same content type. Telling them apart means decoding the
//! multipart body, but the request body can only be read once.
//!
//! [`BufferedBody`] turns the single-pass body into a re-readable one:
//!
//! 1. `buffer` reads the whole body into memory (bounded, small requests only)
//! 2. `inspect` decodes the buffered bytes and records what it saw
//! 3. `classify` picks exactly one outcome:
//!    - a file part is present: [`Classification::Passthrough`], and
//!      `materialize` yields a fresh stream identical to the original body
//!    - no file part but the control field is present:
//!      [`Classification::Finalize`] with the decoded fields
//!    - neither: a validation error

use std::convert::Infallible;
use std::pin::pin;

use axum::body::Bytes;
use futures::{stream, Stream, StreamExt};
use multer::Multipart;

use super::types::{FormFields, UploadError};

/// Piece size used when replaying a buffered body
const REPLAY_PIECE_SIZE: usize = 64 * 1024;

/// What a buffered body turned out to be
#[derive(Debug)]
pub enum Classification {
    /// Finalize signal; the decoded plain fields
    Finalize(FormFields),
    /// Real file data, to be replayed into the direct receiver
    Passthrough(BufferedBody),
}

/// Result of decoding a buffered body
#[derive(Debug, Clone, Default)]
pub struct Inspection {
    pub fields: FormFields,
    pub has_file: bool,
}

/// A fully buffered multipart body
#[derive(Debug, Clone)]
pub struct BufferedBody {
    bytes: Bytes,
    boundary: String,
}

impl BufferedBody {
    /// Read `body` to the end, failing once more than `limit` bytes arrive.
    pub async fn buffer<S, O, E>(
        body: S,
        boundary: impl Into<String>,
        limit: usize,
    ) -> Result<Self, UploadError>
    where
        S: Stream<Item = Result<O, E>>,
        O: Into<Bytes>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut body = pin!(body);
        let mut buf = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk: Bytes = chunk
                .map_err(|e| {
                    let source: Box<dyn std::error::Error + Send + Sync> = e.into();
                    UploadError::Aborted(format!("request body read failed: {source}"))
                })?
                .into();
            if buf.len() + chunk.len() > limit {
                return Err(UploadError::EntityTooLarge {
                    limit: limit as u64,
                });
            }
            buf.extend_from_slice(&chunk);
        }

        tracing::debug!(bytes = buf.len(), state = "buffered", "Request body buffered");

        Ok(Self {
            bytes: Bytes::from(buf),
            boundary: boundary.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Decode the buffered bytes, recording plain fields and file presence.
    ///
    /// File contents are skipped, not kept.
    pub async fn inspect(&self) -> Result<Inspection, UploadError> {
        let mut multipart = Multipart::new(self.materialize(), self.boundary.clone());
        let mut inspection = Inspection::default();

        while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
            if field.file_name().is_some() {
                inspection.has_file = true;
                while field.chunk().await.map_err(malformed)?.is_some() {}
                continue;
            }

            let name = field.name().unwrap_or_default().to_string();
            let value = field.text().await.map_err(malformed)?;
            inspection.fields.insert(name, value);
        }

        Ok(inspection)
    }

    /// A fresh stream over the original bytes, as if never read
    pub fn materialize(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let bytes = self.bytes.clone();
        let pieces = (0..bytes.len())
            .step_by(REPLAY_PIECE_SIZE)
            .map(move |start| {
                let end = (start + REPLAY_PIECE_SIZE).min(bytes.len());
                Ok(bytes.slice(start..end))
            });
        stream::iter(pieces)
    }

    /// Decide what this body is. `control_field` marks a finalize signal.
    pub async fn classify(self, control_field: &str) -> Result<Classification, UploadError> {
        let inspection = self.inspect().await?;

        if inspection.has_file {
            tracing::debug!(bytes = self.len(), state = "replay_passthrough", "Classified request");
            return Ok(Classification::Passthrough(self));
        }

        if inspection.fields.contains_key(control_field) {
            tracing::debug!(
                fields = inspection.fields.len(),
                state = "finalization_detected",
                "Classified request"
            );
            return Ok(Classification::Finalize(inspection.fields));
        }

        tracing::debug!(state = "error", "Classified request");
        Err(UploadError::Validation(format!(
            "unrecognized request: no file part and no '{control_field}' field"
        )))
    }
}

fn malformed(e: multer::Error) -> UploadError {
    UploadError::Validation(format!("malformed multipart body: {e}"))
}

// ============================================================================
// Tests
// ============================================================================
