//! Destination file shared by all connections of a download.
//!
//! Every connection writes at explicit offsets, never appends, so writes
//! from different connections may complete in any order. Exclusivity comes
//! from the disjoint worker ranges, not from a lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Errors raised by destination file operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write {} at offset {offset}: {source}", path.display())]
    Write {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("failed to resize {}: {source}", path.display())]
    Resize { path: PathBuf, source: io::Error },

    #[error("failed to sync {}: {source}", path.display())]
    Sync { path: PathBuf, source: io::Error },

    #[error("blocking file task failed: {0}")]
    Task(String),
}

/// Cloneable handle to the destination file.
#[derive(Debug, Clone)]
pub struct SharedFile {
    file: Arc<File>,
    path: Arc<PathBuf>,
}

impl SharedFile {
    /// Open for resuming: existing content is kept.
    pub async fn open_resumable(path: &Path) -> Result<Self, StorageError> {
        Self::open(path, false).await
    }

    /// Open and truncate: any existing content is discarded.
    pub async fn create_truncated(path: &Path) -> Result<Self, StorageError> {
        Self::open(path, true).await
    }

    async fn open(path: &Path, truncate: bool) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        run_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(truncate)
                .open(&path)
                .map_err(|source| StorageError::Open {
                    path: path.clone(),
                    source,
                })?;
            Ok(Self {
                file: Arc::new(file),
                path: Arc::new(path),
            })
        })
        .await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole buffer at `offset`.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        let path = Arc::clone(&self.path);
        run_blocking(move || {
            write_all_at(&file, &data, offset).map_err(|source| StorageError::Write {
                path: path.to_path_buf(),
                offset,
                source,
            })
        })
        .await
    }

    /// Set the file length (pre-allocates the final size for range writes).
    pub async fn set_len(&self, len: u64) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        let path = Arc::clone(&self.path);
        run_blocking(move || {
            file.set_len(len).map_err(|source| StorageError::Resize {
                path: path.to_path_buf(),
                source,
            })
        })
        .await
    }

    pub async fn size(&self) -> Result<u64, StorageError> {
        let file = Arc::clone(&self.file);
        let path = Arc::clone(&self.path);
        run_blocking(move || {
            file.metadata()
                .map(|m| m.len())
                .map_err(|source| StorageError::Open {
                    path: path.to_path_buf(),
                    source,
                })
        })
        .await
    }

    /// Flush written data to disk.
    pub async fn sync(&self) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        let path = Arc::clone(&self.path);
        run_blocking(move || {
            file.sync_all().map_err(|source| StorageError::Sync {
                path: path.to_path_buf(),
                source,
            })
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_out_of_order_offset_writes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("out.bin");

        let file = SharedFile::create_truncated(&path).await.unwrap();
        file.set_len(10).await.unwrap();
        file.write_at(5, Bytes::from_static(b"world")).await.unwrap();
        file.write_at(0, Bytes::from_static(b"hello")).await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
        assert_eq!(file.size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_resumable_open_keeps_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = SharedFile::open_resumable(&path).await.unwrap();
        file.write_at(8, Bytes::from_static(b"xy")).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"01234567xy");

        let file = SharedFile::create_truncated(&path).await.unwrap();
        assert_eq!(file.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_fails_for_directory_path() {
        let temp = TempDir::new().unwrap();
        let err = SharedFile::create_truncated(temp.path()).await.unwrap_err();
        assert!(matches!(err, StorageError::Open { .. }));
    }
}
