//! Artifact naming and partial-file lifecycle

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use super::types::{throughput, FinalArtifact};

const MAX_EXTENSION_LEN: usize = 10;

/// Where a new artifact will be stored.
///
/// `<root>/<tenant>/<artifact_id>/<artifact_id>_<millis>_<uuid><ext>`
#[derive(Debug, Clone)]
pub struct ArtifactLocation {
    pub tenant_id: String,
    pub artifact_id: String,
    pub original_name: String,
    pub stored_name: String,
    pub dir: PathBuf,
    pub path: PathBuf,
}

impl ArtifactLocation {
    pub fn new(root: &Path, tenant_id: &str, original_name: &str) -> Self {
        let artifact_id = Uuid::new_v4().to_string();
        let ext = extension(original_name)
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let stored_name = format!(
            "{}_{}_{}{}",
            artifact_id,
            Utc::now().timestamp_millis(),
            Uuid::new_v4(),
            ext
        );
        let dir = root.join(tenant_id).join(&artifact_id);
        let path = dir.join(&stored_name);

        Self {
            tenant_id: tenant_id.to_string(),
            artifact_id,
            original_name: original_name.to_string(),
            stored_name,
            dir,
            path,
        }
    }

    pub fn into_artifact(self, size: u64, digest: String, elapsed: Duration) -> FinalArtifact {
        FinalArtifact {
            tenant_id: self.tenant_id,
            artifact_id: self.artifact_id,
            original_name: self.original_name,
            stored_name: self.stored_name,
            path: self.path,
            size,
            digest,
            duration_ms: elapsed.as_millis() as u64,
            throughput: throughput(size, elapsed),
        }
    }
}

/// Lower-cased extension of a client-supplied file name, without the dot.
///
/// Only short alphanumeric extensions are returned, so the result is safe
/// to append to a stored file name.
pub fn extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

// ============================================================================
// Partial File
// ============================================================================

/// A temp file that becomes an artifact only through [`PartialFile::promote`].
///
/// If the owner is dropped first (request future cancelled on client
/// disconnect, panic) the temp file is removed synchronously in `Drop`.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    /// Create the temp file next to the final artifact location
    pub async fn create(location: &ArtifactLocation) -> io::Result<(Self, fs::File)> {
        fs::create_dir_all(&location.dir).await?;
        let path = location
            .dir
            .join(format!(".{}.partial", location.stored_name));
        let file = fs::File::create(&path).await?;
        Ok((Self { path, armed: true }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the temp file to `destination`
    pub async fn promote(mut self, destination: &Path) -> io::Result<()> {
        fs::rename(&self.path, destination).await?;
        self.armed = false;
        Ok(())
    }

    /// Remove the temp file and, if empty, its directory
    pub async fn discard(mut self) {
        self.armed = false;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove partial upload"
                );
            }
        }
        if let Some(dir) = self.path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
            if let Some(dir) = self.path.parent() {
                let _ = std::fs::remove_dir(dir);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extension() {
        assert_eq!(extension("clip.MP4"), Some("mp4".to_string()));
        assert_eq!(extension("dir/clip.final.mov"), Some("mov".to_string()));
        assert_eq!(extension("noext"), None);
        assert_eq!(extension(".hidden"), None);
        assert_eq!(extension("evil.mp4/../x"), None);
    }

    #[test]
    fn test_location_layout() {
        let root = Path::new("/data/artifacts");
        let location = ArtifactLocation::new(root, "t1", "holiday.mp4");

        assert_eq!(location.dir, root.join("t1").join(&location.artifact_id));
        assert!(location.stored_name.starts_with(&location.artifact_id));
        assert!(location.stored_name.ends_with(".mp4"));
        assert_eq!(location.path, location.dir.join(&location.stored_name));
    }

    #[tokio::test]
    async fn test_partial_file_dropped_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let location = ArtifactLocation::new(temp_dir.path(), "t1", "a.mp4");

        let (partial, _file) = PartialFile::create(&location).await.unwrap();
        let path = partial.path().to_path_buf();
        assert!(path.exists());

        drop(partial);
        assert!(!path.exists());
        assert!(!location.dir.exists());
    }

    #[tokio::test]
    async fn test_partial_file_promote() {
        let temp_dir = TempDir::new().unwrap();
        let location = ArtifactLocation::new(temp_dir.path(), "t1", "a.mp4");

        let (partial, file) = PartialFile::create(&location).await.unwrap();
        drop(file);
        partial.promote(&location.path).await.unwrap();

        assert!(location.path.exists());
    }
}
