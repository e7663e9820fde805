//! Video Upload Ingestion
//!
//! Two delivery paths end in the same place, a complete hashed artifact:
//!
//! - Chunked: the client sends numbered fragments in any order, then asks
//!   for a merge. Fragments live on disk under the chunk root until merged
//!   or swept.
//! - Direct: one multipart request carrying the whole file, streamed to
//!   disk as it arrives.
//!
//! Small multipart requests are ambiguous (finalize signal or tiny direct
//! upload) and go through the classifier first.

pub mod artifact;
pub mod chunk_store;
pub mod classifier;
pub mod direct;
pub mod merge;
pub mod sweeper;
pub mod transfer;
pub mod types;

pub use artifact::{ArtifactLocation, PartialFile};
pub use chunk_store::ChunkStore;
pub use classifier::{BufferedBody, Classification};
pub use direct::{DirectReceiver, DirectUpload, DirectUploadConfig};
pub use merge::MergeReport;
pub use sweeper::{OrphanSweeper, SweepReport};
pub use transfer::{TransferHandle, TransferState};
pub use types::*;
