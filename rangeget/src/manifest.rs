//! Side-car manifest for resuming interrupted downloads.
//!
//! The manifest lives next to the destination file as `<file>.dl.json`:
//!
//! ```json
//! { "url": "...", "pool": { "version": 1, ... }, "fileSize": 10000000 }
//! ```
//!
//! It is rewritten periodically and on shutdown, always through a
//! temporary file and a rename so a crash never leaves a torn manifest, and
//! deleted once the download completes.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pool::{PoolSnapshot, RangePool};

/// Suffix appended to the destination path.
pub const MANIFEST_SUFFIX: &str = ".dl.json";

/// Errors raised while persisting the manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to write manifest {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to delete manifest {}: {source}", path.display())]
    Delete { path: PathBuf, source: io::Error },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestData {
    url: String,
    pool: PoolSnapshot,
    file_size: u64,
}

/// Handle to the manifest of one destination file.
#[derive(Debug, Clone)]
pub struct Manifest {
    url: String,
    path: PathBuf,
    file_size: u64,
}

impl Manifest {
    /// Manifest path for a destination file.
    pub fn path_for(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_owned();
        name.push(MANIFEST_SUFFIX);
        PathBuf::from(name)
    }

    pub fn new(url: impl Into<String>, destination: &Path, file_size: u64) -> Self {
        Self {
            url: url.into(),
            path: Self::path_for(destination),
            file_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Load the pool recorded for this download, if it can be trusted.
    ///
    /// Returns `None` when the manifest is missing, unreadable, invalid,
    /// or describes a different URL or size. Such a manifest is simply
    /// replaced on the next write.
    pub async fn load(&self) -> Option<RangePool> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read manifest");
                return None;
            }
        };

        let data: ManifestData = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unparsable manifest");
                return None;
            }
        };

        if data.url != self.url || data.file_size != self.file_size {
            info!(
                path = %self.path.display(),
                manifest_url = %data.url,
                manifest_size = data.file_size,
                "Manifest describes a different download, starting over"
            );
            return None;
        }
        if data.pool.length != Some(self.file_size) {
            warn!(path = %self.path.display(), "Manifest pool length mismatch, starting over");
            return None;
        }

        match RangePool::restore(data.pool) {
            Ok(pool) => {
                debug!(
                    path = %self.path.display(),
                    completed = pool.completed_bytes(),
                    workers = pool.workers().len(),
                    "Manifest restored"
                );
                Some(pool)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring invalid manifest");
                None
            }
        }
    }

    /// Persist a pool snapshot atomically.
    pub async fn write(&self, pool: PoolSnapshot) -> Result<(), ManifestError> {
        let data = ManifestData {
            url: self.url.clone(),
            pool,
            file_size: self.file_size,
        };
        let json = serde_json::to_vec(&data)?;

        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &json)
            .await
            .map_err(|source| ManifestError::Write {
                path: temp.clone(),
                source,
            })?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|source| ManifestError::Write {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Remove the manifest. A missing file is not an error.
    pub async fn delete(&self) -> Result<(), ManifestError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ManifestError::Delete {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const URL: &str = "http://example.com/file.bin";

    #[test]
    fn test_path_for_appends_suffix() {
        let path = Manifest::path_for(Path::new("/tmp/out/file.tar.gz"));
        assert_eq!(path, PathBuf::from("/tmp/out/file.tar.gz.dl.json"));
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        let manifest = Manifest::new(URL, &destination, 1000);

        let mut pool = RangePool::new(Some(1000));
        let worker = pool.allocate().unwrap();
        pool.reserve(worker.id(), 250).unwrap();
        pool.advance(worker.id(), 250).unwrap();
        manifest.write(pool.snapshot()).await.unwrap();

        let restored = manifest.load().await.unwrap();
        assert_eq!(restored.completed_bytes(), 250);
        assert_eq!(restored.length(), Some(1000));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(manifest.path()).unwrap()).unwrap();
        assert_eq!(raw["url"], URL);
        assert_eq!(raw["fileSize"], 1000);
        assert_eq!(raw["pool"]["version"], 1);
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        let manifest = Manifest::new(URL, &destination, 1000);
        assert!(manifest.load().await.is_none());

        std::fs::write(manifest.path(), b"{ not json").unwrap();
        assert!(manifest.load().await.is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_other_download() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");

        let original = Manifest::new(URL, &destination, 1000);
        original
            .write(RangePool::new(Some(1000)).snapshot())
            .await
            .unwrap();

        let other_url = Manifest::new("http://example.com/other.bin", &destination, 1000);
        assert!(other_url.load().await.is_none());

        let other_size = Manifest::new(URL, &destination, 2000);
        assert!(other_size.load().await.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::new(URL, &temp.path().join("file.bin"), 10);
        manifest
            .write(RangePool::new(Some(10)).snapshot())
            .await
            .unwrap();
        assert!(manifest.path().exists());

        manifest.delete().await.unwrap();
        assert!(!manifest.path().exists());
        manifest.delete().await.unwrap();
    }
}
