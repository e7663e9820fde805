//! Downstream Processing Hand-off
//!
//! Every artifact, chunked or direct, is announced to the processing
//! pipeline as a [`ProcessingJob`]. The queue is a trait so the server can
//! run with a log-only sink or a webhook.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::upload::FinalArtifact;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Job enqueue errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Queue rejected job: {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Work item for the processing pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub tenant_id: String,
    pub artifact_id: String,
    pub artifact_path: PathBuf,
    pub size: u64,
    pub digest: String,
}

impl From<&FinalArtifact> for ProcessingJob {
    fn from(artifact: &FinalArtifact) -> Self {
        Self {
            tenant_id: artifact.tenant_id.clone(),
            artifact_id: artifact.artifact_id.clone(),
            artifact_path: artifact.path.clone(),
            size: artifact.size,
            digest: artifact.digest.clone(),
        }
    }
}

/// Processing queue trait
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn enqueue(&self, job: ProcessingJob) -> Result<(), JobError>;
}

/// Queue that only records jobs in the log
pub struct LogQueue;

#[async_trait]
impl JobQueue for LogQueue {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn enqueue(&self, job: ProcessingJob) -> Result<(), JobError> {
        tracing::info!(
            tenant_id = %job.tenant_id,
            artifact_id = %job.artifact_id,
            path = %job.artifact_path.display(),
            size = job.size,
            digest = %job.digest,
            "Processing job enqueued"
        );
        Ok(())
    }
}

/// Queue that POSTs each job as JSON to a webhook
pub struct WebhookQueue {
    client: reqwest::Client,
    url: String,
}

impl WebhookQueue {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for WebhookQueue {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn enqueue(&self, job: ProcessingJob) -> Result<(), JobError> {
        let response = self
            .client
            .post(&self.url)
            .json(&job)
            .send()
            .await
            .map_err(|e| JobError::Request(format!("Failed to call {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(JobError::Rejected { status, body });
        }

        tracing::debug!(artifact_id = %job.artifact_id, url = %self.url, "Processing job delivered");
        Ok(())
    }
}

/// Build the queue selected by configuration
pub fn from_webhook_url(url: Option<&str>) -> Arc<dyn JobQueue> {
    match url {
        Some(url) => Arc::new(WebhookQueue::new(url)),
        None => Arc::new(LogQueue),
    }
}

/// Queue that records jobs, or fails on demand, for tests
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingQueue {
        pub jobs: Mutex<Vec<ProcessingJob>>,
        pub fail: AtomicBool,
    }

    impl RecordingQueue {
        pub fn failing() -> Self {
            let queue = Self::default();
            queue.fail.store(true, Ordering::SeqCst);
            queue
        }

        pub fn jobs(&self) -> Vec<ProcessingJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn enqueue(&self, job: ProcessingJob) -> Result<(), JobError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(JobError::Rejected {
                    status: 503,
                    body: "queue unavailable".to_string(),
                });
            }
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }
}
