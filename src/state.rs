//! Application state management

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::jobs::{self, JobQueue};
use crate::upload::{ChunkStore, DirectReceiver, OrphanSweeper};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    chunk_store: ChunkStore,
    direct_receiver: DirectReceiver,
    jobs: Arc<dyn JobQueue>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create a new application state with the queue selected by `config`
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let jobs = jobs::from_webhook_url(config.processing.webhook_url.as_deref());
        Self::with_jobs(config, jobs, shutdown)
    }

    pub fn with_jobs(config: Config, jobs: Arc<dyn JobQueue>, shutdown: CancellationToken) -> Self {
        let chunk_store =
            ChunkStore::with_max_chunk_size(config.storage.chunk_dir.clone(), config.upload.max_chunk_size);
        let direct_receiver =
            DirectReceiver::new(config.storage.artifact_dir.clone(), config.direct_upload());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                chunk_store,
                direct_receiver,
                jobs,
                shutdown,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the chunk store
    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    /// Get the direct upload receiver
    pub fn direct_receiver(&self) -> &DirectReceiver {
        &self.inner.direct_receiver
    }

    /// Get the processing queue
    pub fn jobs(&self) -> &dyn JobQueue {
        self.inner.jobs.as_ref()
    }

    /// Cancelled when the server begins shutting down
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Sweeper over this state's chunk store
    pub fn sweeper(&self) -> OrphanSweeper {
        OrphanSweeper::new(self.inner.chunk_store.clone(), self.inner.config.retention())
    }
}
