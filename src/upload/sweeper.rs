//! Orphan Sweeper
//!
//! Purges chunked uploads that were abandoned before finalization. An
//! upload directory expires when the newest file in it is older than the
//! retention period. The staging area (`.incoming`) is swept by the same
//! rule, which collects temp directories left behind by a crash.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::chunk_store::{remove_upload_dir, ChunkStore};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub purged: usize,
    pub failed: usize,
}

/// Periodic cleanup of expired upload directories
#[derive(Clone)]
pub struct OrphanSweeper {
    store: ChunkStore,
    retention: Duration,
}

impl OrphanSweeper {
    pub fn new(store: ChunkStore, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now()).await
    }

    /// Sweep as if the current time were `now`.
    ///
    /// A failure on one upload directory is logged and counted; the sweep
    /// carries on with the rest.
    pub async fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let dirs = self.upload_dirs(&mut report).await;
        self.sweep_dirs(&dirs, now, &mut report).await;

        if report.purged > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                purged = report.purged,
                failed = report.failed,
                "Swept orphaned uploads"
            );
        }

        report
    }

    /// Every upload directory under every tenant, `.incoming` included
    async fn upload_dirs(&self, report: &mut SweepReport) -> Vec<PathBuf> {
        let root = self.store.root();
        let mut dirs = Vec::new();

        let mut tenants = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return dirs,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Failed to list chunk root");
                return dirs;
            }
        };

        loop {
            let tenant = match tenants.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list chunk root");
                    break;
                }
            };
            if !is_dir(&tenant).await {
                continue;
            }

            let mut uploads = match fs::read_dir(tenant.path()).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(tenant = %tenant.path().display(), error = %e, "Failed to list tenant");
                    report.failed += 1;
                    continue;
                }
            };

            loop {
                let upload = match uploads.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(tenant = %tenant.path().display(), error = %e, "Failed to list tenant");
                        report.failed += 1;
                        break;
                    }
                };
                if is_dir(&upload).await {
                    dirs.push(upload.path());
                }
            }
        }

        dirs
    }

    async fn sweep_dirs(&self, dirs: &[PathBuf], now: SystemTime, report: &mut SweepReport) {
        for path in dirs {
            report.scanned += 1;
            match self.sweep_upload(path, now).await {
                Ok(true) => report.purged += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(dir = %path.display(), error = %e, "Failed to sweep upload");
                }
            }
        }
    }

    async fn sweep_upload(&self, dir: &Path, now: SystemTime) -> io::Result<bool> {
        let newest = newest_modification(dir).await?;
        let age = now.duration_since(newest).unwrap_or_default();
        if age <= self.retention {
            return Ok(false);
        }

        let removed = remove_upload_dir(dir).await?;
        tracing::debug!(
            dir = %dir.display(),
            removed = removed,
            age_hours = age.as_secs() / 3600,
            "Purged orphaned upload"
        );
        Ok(true)
    }

    /// Run a sweep every `interval` until `shutdown` is cancelled
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }

            tracing::info!("Orphan sweeper stopped");
        })
    }
}

async fn is_dir(entry: &fs::DirEntry) -> bool {
    entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false)
}

/// Newest mtime among the directory's entries; the directory's own mtime if empty
async fn newest_modification(dir: &Path) -> io::Result<SystemTime> {
    let mut newest: Option<SystemTime> = None;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let modified = entry.metadata().await?.modified()?;
        newest = Some(newest.map_or(modified, |t| t.max(modified)));
    }

    match newest {
        Some(t) => Ok(t),
        None => fs::metadata(dir).await?.modified(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::INCOMING_DIR;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn write_aged(path: &Path, age: Duration) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"chunk").unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn upload(root: &Path, tenant: &str, id: &str) -> PathBuf {
        root.join(tenant).join(id)
    }

    fn sweeper(root: &Path) -> OrphanSweeper {
        OrphanSweeper::new(ChunkStore::new(root.to_path_buf()), 24 * HOUR)
    }

    #[tokio::test]
    async fn test_purges_only_expired_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let stale = upload(root, "t1", "stale");
        let fresh = upload(root, "t1", "fresh");
        write_aged(&stale.join("chunk_000000.part"), 25 * HOUR);
        write_aged(&fresh.join("chunk_000000.part"), HOUR);

        let report = sweeper(root).sweep().await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.purged, 1);
        assert_eq!(report.failed, 0);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_newest_file_decides() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mixed = upload(root, "t1", "mixed");
        write_aged(&mixed.join("chunk_000000.part"), 48 * HOUR);
        write_aged(&mixed.join("chunk_000001.part"), 2 * HOUR);

        let report = sweeper(root).sweep().await;

        assert_eq!(report.purged, 0);
        assert!(mixed.exists());
    }

    #[tokio::test]
    async fn test_sweeps_every_tenant_and_staging_area() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let a = upload(root, "t1", "a");
        let b = upload(root, "t2", "b");
        let staged = root.join(INCOMING_DIR).join("abandoned");
        write_aged(&a.join("chunk_000000.part"), 30 * HOUR);
        write_aged(&b.join("upload.json"), 30 * HOUR);
        write_aged(&staged.join("chunk_000004.part"), 30 * HOUR);

        let report = sweeper(root).sweep().await;

        assert_eq!(report.purged, 3);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_empty_upload_dir_uses_own_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let empty = upload(root, "t1", "empty");
        std::fs::create_dir_all(&empty).unwrap();

        let sweeper = sweeper(root);
        assert_eq!(sweeper.sweep().await.purged, 0);

        let later = SystemTime::now() + 25 * HOUR;
        assert_eq!(sweeper.sweep_at(later).await.purged, 1);
        assert!(!empty.exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let report = sweeper(&temp_dir.path().join("absent")).sweep().await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let task = sweeper(temp_dir.path()).spawn(HOUR, shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_stop_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let a = upload(root, "t1", "a");
        let b = upload(root, "t1", "b");
        let c = upload(root, "t2", "c");
        for dir in [&a, &b, &c] {
            write_aged(&dir.join("chunk_000000.part"), 30 * HOUR);
        }

        let sweeper = sweeper(root);
        let mut report = SweepReport::default();
        let dirs = sweeper.upload_dirs(&mut report).await;
        assert_eq!(dirs.len(), 3);

        // Replaced by a plain file after listing, so it cannot be read as a directory
        std::fs::remove_dir_all(&b).unwrap();
        std::fs::write(&b, b"not a directory").unwrap();

        sweeper.sweep_dirs(&dirs, SystemTime::now(), &mut report).await;

        assert_eq!(report.scanned, 3);
        assert_eq!(report.purged, 2);
        assert_eq!(report.failed, 1);
        assert!(!a.exists());
        assert!(!c.exists());
        assert!(b.is_file());
    }
}
