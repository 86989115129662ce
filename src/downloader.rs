// src/downloader.rs

use crate::backend::{BackendError, DownloadBackend, DownloadEntry, EnqueueRequest};
use crate::models::DownloadStatus;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Live state of one download owned by the backend.
#[derive(Clone)]
struct TrackedDownload {
    destination: PathBuf,
    bytes_downloaded: Arc<AtomicU64>,
    /// -1 until the server reports a content length.
    total_size: Arc<AtomicI64>,
    status: Arc<Mutex<DownloadStatus>>,
    token: CancellationToken,
}

/// A `DownloadBackend` that streams files over HTTP with `reqwest`.
///
/// `enqueue` assigns an id and spawns a transfer task writing straight to the
/// destination path; `query` snapshots byte counts and status; `remove`
/// cancels the task and deletes whatever partial file is on disk.
pub struct HttpDownloadBackend {
    client: Client,
    next_id: AtomicI64,
    downloads: Arc<Mutex<HashMap<i64, TrackedDownload>>>,
}

impl HttpDownloadBackend {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            next_id: AtomicI64::new(1),
            downloads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn transfer(
        client: Client,
        request: EnqueueRequest,
        tracked: TrackedDownload,
    ) -> Result<(), BackendError> {
        let mut http_request = client.get(&request.uri);
        for (name, value) in &request.headers {
            http_request = http_request.header(name, value);
        }
        let response = http_request.send().await?.error_for_status()?;

        if let Some(total) = response.content_length() {
            tracked.total_size.store(total as i64, Ordering::SeqCst);
        }
        {
            let mut status = tracked.status.lock().await;
            *status = DownloadStatus::Running;
        }

        if let Some(parent) = tracked.destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tracked.destination)
            .await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if tracked.token.is_cancelled() {
                return Ok(());
            }
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            tracked
                .bytes_downloaded
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        }
        file.flush().await?;
        Ok(())
    }
}

impl Default for HttpDownloadBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadBackend for HttpDownloadBackend {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<i64, BackendError> {
        let download_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tracked = TrackedDownload {
            destination: request.destination.clone(),
            bytes_downloaded: Arc::new(AtomicU64::new(0)),
            total_size: Arc::new(AtomicI64::new(-1)),
            status: Arc::new(Mutex::new(DownloadStatus::Queued)),
            token: CancellationToken::new(),
        };
        self.downloads
            .lock()
            .await
            .insert(download_id, tracked.clone());

        let client = self.client.clone();
        tokio::spawn(async move {
            debug!(download_id, uri = %request.uri, "starting http transfer");
            let result = Self::transfer(client, request, tracked.clone()).await;
            let mut status = tracked.status.lock().await;
            if tracked.token.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => *status = DownloadStatus::Successful,
                Err(e) => {
                    warn!(download_id, error = %e, "http transfer failed");
                    *status = DownloadStatus::Failed;
                }
            }
        });

        Ok(download_id)
    }

    async fn query(&self, ids: &[i64]) -> Result<Vec<DownloadEntry>, BackendError> {
        let downloads = self.downloads.lock().await;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let tracked = downloads
                .get(id)
                .ok_or(BackendError::UnknownDownload(*id))?;
            entries.push(DownloadEntry {
                download_id: *id,
                bytes_downloaded_so_far: tracked.bytes_downloaded.load(Ordering::SeqCst) as i64,
                total_size_bytes: tracked.total_size.load(Ordering::SeqCst),
                status: *tracked.status.lock().await,
            });
        }
        Ok(entries)
    }

    async fn remove(&self, ids: &[i64]) -> Result<(), BackendError> {
        let mut downloads = self.downloads.lock().await;
        for id in ids {
            if let Some(tracked) = downloads.remove(id) {
                tracked.token.cancel();
                if let Err(e) = fs::remove_file(&tracked.destination).await {
                    debug!(download_id = id, error = %e, "no partial file to clean up");
                }
            }
        }
        Ok(())
    }
}
