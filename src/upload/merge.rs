//! Chunk Merger
//!
//! Streams an upload's fragments, in ordinal order, into one destination
//! file while computing its SHA-256. Memory use is one copy buffer no matter
//! how large the upload is.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use super::chunk_store::parse_ordinal;
use super::types::{ChunkRecord, UploadError};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Outcome of a successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Bytes written to the destination
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the destination
    pub digest: String,
    /// Number of fragments consumed
    pub fragments: usize,
}

/// List the fragments in `dir`, sorted by name.
///
/// Names are zero-padded, so name order is ordinal order.
pub async fn list_fragments(dir: &Path) -> Result<Vec<ChunkRecord>, UploadError> {
    let not_found = || UploadError::NotFound(format!("no chunks found in {}", dir.display()));

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    let upload_id = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(ordinal) = parse_ordinal(&name) {
            records.push((name, ordinal, entry.metadata().await?.len()));
        }
    }

    if records.is_empty() {
        return Err(not_found());
    }

    records.sort();
    Ok(records
        .into_iter()
        .map(|(name, ordinal, size)| ChunkRecord {
            upload_id: upload_id.clone(),
            ordinal,
            size,
            path: dir.join(name),
        })
        .collect())
}

/// Concatenate every fragment in `chunk_dir` into `destination`.
///
/// Does not check that the ordinal set is complete. On error the partially
/// written destination is left for the caller.
pub async fn merge_chunks(chunk_dir: &Path, destination: &Path) -> Result<MergeReport, UploadError> {
    let fragments = list_fragments(chunk_dir).await?;

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut out = BufWriter::new(fs::File::create(destination).await?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes: u64 = 0;

    for fragment in &fragments {
        let mut input = fs::File::open(&fragment.path).await?;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            bytes += n as u64;
        }
    }

    out.flush().await?;
    out.get_ref().sync_all().await?;

    let report = MergeReport {
        bytes,
        digest: hex::encode(hasher.finalize()),
        fragments: fragments.len(),
    };

    tracing::info!(
        destination = %destination.display(),
        fragments = report.fragments,
        bytes = report.bytes,
        digest = %report.digest,
        "Merged chunks"
    );

    Ok(report)
}

/// Compute SHA-256 hash of data
#[cfg(test)]
pub(crate) fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::ChunkStore;
    use crate::upload::types::ChunkMeta;
    use axum::body::Bytes;
    use tempfile::TempDir;

    const MB: usize = 1024 * 1024;

    fn meta(upload_id: &str, index: u32, total: u32) -> ChunkMeta {
        ChunkMeta {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            total_chunks: total,
            filename: "clip.mp4".to_string(),
        }
    }

    /// Deterministic, non-repeating-per-chunk test payload
    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
            .collect()
    }

    #[tokio::test]
    async fn test_merge_empty_dir_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let chunk_dir = temp_dir.path().join("t1").join("up-1");
        fs::create_dir_all(&chunk_dir).await.unwrap();
        let destination = temp_dir.path().join("out.bin");

        let result = merge_chunks(&chunk_dir, &destination).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_merge_absent_dir_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().join("chunks"));
        let destination = temp_dir.path().join("out.bin");

        let result = store.merge("t1", "missing", &destination).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_fragments_in_ordinal_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        for index in [11u32, 2, 0] {
            store
                .store_chunk("t1", &meta("up-1", index, 12), Bytes::from(vec![0u8; index as usize + 1]))
                .await
                .unwrap();
        }

        let records = list_fragments(&store.upload_dir("t1", "up-1")).await.unwrap();

        let ordinals: Vec<u32> = records.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![0, 2, 11]);
        assert_eq!(records[2].size, 12);
        assert!(records.iter().all(|r| r.upload_id == "up-1"));
    }

    #[tokio::test]
    async fn test_merge_is_independent_of_arrival_order() {
        let parts = [payload(1000, 1), payload(777, 2), payload(1500, 3)];
        let source: Vec<u8> = parts.concat();
        let orders: [[u32; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for (n, order) in orders.iter().enumerate() {
            let temp_dir = TempDir::new().unwrap();
            let store = ChunkStore::new(temp_dir.path().join("chunks"));
            let upload_id = format!("up-{n}");

            for &index in order {
                store
                    .store_chunk(
                        "t1",
                        &meta(&upload_id, index, 3),
                        Bytes::from(parts[index as usize].clone()),
                    )
                    .await
                    .unwrap();
            }

            let destination = temp_dir.path().join("artifacts").join("out.bin");
            let report = store.merge("t1", &upload_id, &destination).await.unwrap();

            let merged = fs::read(&destination).await.unwrap();
            assert_eq!(merged, source, "order {:?}", order);
            assert_eq!(report.bytes, source.len() as u64);
            assert_eq!(report.digest, compute_hash(&source));
            assert_eq!(report.fragments, 3);
        }
    }

    #[tokio::test]
    async fn test_merge_removes_fragments() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().join("chunks"));

        store
            .store_chunk("t1", &meta("up-1", 0, 1), Bytes::from_static(b"only"))
            .await
            .unwrap();

        let destination = temp_dir.path().join("out.bin");
        store.merge("t1", "up-1", &destination).await.unwrap();

        assert!(!store.upload_dir("t1", "up-1").exists());
        assert!(store.session("t1", "up-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_three_fragment_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().join("chunks"));
        let parts = [payload(4 * MB, 7), payload(4 * MB, 8), payload(2 * MB, 9)];

        let mut last = None;
        for index in [2u32, 0, 1] {
            let response = store
                .store_chunk(
                    "t1",
                    &meta("video-1", index, 3),
                    Bytes::from(parts[index as usize].clone()),
                )
                .await
                .unwrap();
            last = Some(response);
        }

        let last = last.unwrap();
        assert!(last.is_complete);
        assert_eq!(last.uploaded_chunks, 3);

        let destination = temp_dir.path().join("artifacts").join("video.mp4");
        let report = store.merge("t1", "video-1", &destination).await.unwrap();

        assert_eq!(report.bytes, (10 * MB) as u64);
        let merged = fs::read(&destination).await.unwrap();
        assert_eq!(merged.len(), 10 * MB);
        assert_eq!(merged, parts.concat());
    }
}
