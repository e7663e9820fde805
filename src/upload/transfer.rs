//! Per-transfer control: cancellation and observable progress

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one streaming transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Reading headers and plain fields, nothing written yet
    Waiting,
    /// File bytes are flowing to disk
    Streaming,
    /// Artifact promoted
    Complete,
    /// Cancelled or failed; partial output removed
    Aborted,
}

impl TransferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Streaming,
            2 => Self::Complete,
            3 => Self::Aborted,
            _ => Self::Waiting,
        }
    }
}

/// Handle shared between a running transfer and whoever supervises it.
///
/// Cancelling the handle makes the receiver stop reading, remove its
/// partial output and return [`UploadError::Aborted`](super::UploadError::Aborted).
#[derive(Clone, Default)]
pub struct TransferHandle {
    inner: Arc<TransferInner>,
}

#[derive(Default)]
struct TransferInner {
    cancel: CancellationToken,
    bytes: AtomicU64,
    state: AtomicU8,
}

impl TransferHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that is also cancelled when `parent` is (server shutdown)
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(TransferInner {
                cancel: parent.child_token(),
                ..Default::default()
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// File bytes accepted so far
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> TransferState {
        TransferState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn record(&self, bytes: usize) {
        self.inner.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }
}
