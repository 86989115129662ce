// src/backend.rs
//
// Narrow interfaces over the native collaborators: the download backend, the
// filesystem, the storage inspector, the telemetry sink, and the download
// completion delegate. The engine only ever talks to these traits; concrete
// implementations live here (`LocalFilesystem`, `LocalStorage`) and in
// `downloader.rs` (`HttpDownloadBackend`).

use crate::events::InteractionEvent;
use crate::models::{DownloadRequest, DownloadStatus};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors surfaced by native collaborators.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unknown download id {0}")]
    UnknownDownload(i64),
}

/// Parameters for submitting one download to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub uri: String,
    pub title: String,
    pub destination: PathBuf,
    pub mime_type: String,
    pub headers: Vec<(String, String)>,
}

/// One row of a backend progress query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub download_id: i64,
    pub bytes_downloaded_so_far: i64,
    pub total_size_bytes: i64,
    pub status: DownloadStatus,
}

/// Download backend: enqueue, query and remove downloads by id.
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<i64, BackendError>;
    async fn query(&self, ids: &[i64]) -> Result<Vec<DownloadEntry>, BackendError>;
    async fn remove(&self, ids: &[i64]) -> Result<(), BackendError>;
}

/// One entry returned by a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_directory: bool,
    pub path: PathBuf,
}

/// Filesystem capability used by the migration pipeline.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, BackendError>;
    async fn read_to_string(&self, dir: &Path, filename: &str) -> Result<String, BackendError>;
    async fn copy_tree(&self, source: &Path, destination: &Path) -> Result<(), BackendError>;
    async fn remove_tree(&self, path: &Path) -> Result<(), BackendError>;
}

/// Reported on-device size of one inspected path.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageUsage {
    pub path: PathBuf,
    pub size_on_device: u64,
}

/// Storage-usage inspector: free bytes on a volume, bytes used by folder
/// trees.
#[async_trait]
pub trait StorageInspector: Send + Sync {
    async fn usable_space(&self, path: &Path) -> Result<u64, BackendError>;
    async fn usage_of(&self, paths: &[PathBuf]) -> Result<Vec<StorageUsage>, BackendError>;
}

/// Sink for structured telemetry. Failures here are logged by callers and
/// never abort the owning operation.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn log_interaction(
        &self,
        event: InteractionEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Single completion callback invoked when a download finishes successfully.
#[async_trait]
pub trait DownloadCompleteDelegate: Send + Sync {
    async fn on_download_completion(
        &self,
        request: DownloadRequest,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// `Filesystem` over the real local disk via `tokio::fs`.
#[derive(Debug, Default, Clone)]
pub struct LocalFilesystem;

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, BackendError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: file_type.is_dir(),
                path: entry.path(),
            });
        }
        Ok(entries)
    }

    async fn read_to_string(&self, dir: &Path, filename: &str) -> Result<String, BackendError> {
        Ok(fs::read_to_string(dir.join(filename)).await?)
    }

    async fn copy_tree(&self, source: &Path, destination: &Path) -> Result<(), BackendError> {
        // Iterative walk; async functions cannot recurse without boxing.
        let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            let metadata = fs::metadata(&from).await?;
            if metadata.is_dir() {
                fs::create_dir_all(&to).await?;
                let mut dir = fs::read_dir(&from).await?;
                while let Some(entry) = dir.next_entry().await? {
                    pending.push((entry.path(), to.join(entry.file_name())));
                }
            } else {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<(), BackendError> {
        let metadata = fs::metadata(path).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// `StorageInspector` over the real local disk. Folder usage is computed by
/// walking the tree; free space comes from the mounted volume whose mount
/// point is the longest prefix of the inspected path.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    async fn tree_size(path: &Path) -> Result<u64, BackendError> {
        let mut total = 0u64;
        let mut pending = vec![path.to_path_buf()];
        while let Some(current) = pending.pop() {
            let metadata = fs::metadata(&current).await?;
            if metadata.is_dir() {
                let mut dir = fs::read_dir(&current).await?;
                while let Some(entry) = dir.next_entry().await? {
                    pending.push(entry.path());
                }
            } else {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl StorageInspector for LocalStorage {
    async fn usable_space(&self, path: &Path) -> Result<u64, BackendError> {
        let path = path.to_path_buf();
        let space = tokio::task::spawn_blocking(move || {
            let disks = sysinfo::Disks::new_with_refreshed_list();
            let mut best: Option<(usize, u64)> = None;
            for disk in disks.list() {
                let mount = disk.mount_point();
                if path.starts_with(mount) {
                    let score = mount.as_os_str().len();
                    if best.map_or(true, |(s, _)| score > s) {
                        best = Some((score, disk.available_space()));
                    }
                }
            }
            best.map(|(_, space)| space)
                .or_else(|| disks.list().first().map(|disk| disk.available_space()))
                .unwrap_or(0)
        })
        .await
        .map_err(|e| BackendError::Io(std::io::Error::other(e)))?;
        Ok(space)
    }

    async fn usage_of(&self, paths: &[PathBuf]) -> Result<Vec<StorageUsage>, BackendError> {
        let mut usages = Vec::with_capacity(paths.len());
        for path in paths {
            usages.push(StorageUsage {
                path: path.clone(),
                size_on_device: Self::tree_size(path).await?,
            });
        }
        Ok(usages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_tree_replicates_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        fs::create_dir_all(src.join("nested")).await.unwrap();
        fs::write(src.join("a.txt"), b"alpha").await.unwrap();
        fs::write(src.join("nested/b.txt"), b"beta").await.unwrap();

        let dest = root.path().join("dest");
        LocalFilesystem.copy_tree(&src, &dest).await.unwrap();

        assert_eq!(fs::read_to_string(dest.join("a.txt")).await.unwrap(), "alpha");
        assert_eq!(
            fs::read_to_string(dest.join("nested/b.txt")).await.unwrap(),
            "beta"
        );
    }

    #[tokio::test]
    async fn remove_tree_deletes_directories_and_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("doomed");
        fs::create_dir_all(dir.join("inner")).await.unwrap();
        fs::write(dir.join("inner/x.bin"), b"x").await.unwrap();

        LocalFilesystem.remove_tree(&dir).await.unwrap();
        assert!(!dir.exists());

        // Removing something that is not there reports an error; callers
        // decide whether to swallow it.
        assert!(LocalFilesystem.remove_tree(&dir).await.is_err());
    }

    #[tokio::test]
    async fn list_dir_flags_directories() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("content-1")).await.unwrap();
        fs::write(root.path().join("stray.json"), b"{}").await.unwrap();

        let mut entries = LocalFilesystem.list_dir(root.path()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory);
        assert_eq!(entries[0].name, "content-1");
        assert!(!entries[1].is_directory);
    }

    #[tokio::test]
    async fn usage_of_sums_file_sizes_recursively() {
        let root = tempfile::tempdir().unwrap();
        let content = root.path().join("content");
        fs::create_dir_all(content.join("assets")).await.unwrap();
        fs::write(content.join("manifest.json"), vec![0u8; 10]).await.unwrap();
        fs::write(content.join("assets/video.mp4"), vec![0u8; 90]).await.unwrap();

        let usages = LocalStorage
            .usage_of(&[content.clone()])
            .await
            .unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].size_on_device, 100);
    }
}
