// src/manager.rs

use crate::backend::{
    BackendError, DownloadBackend, DownloadCompleteDelegate, EnqueueRequest, TelemetrySink,
};
use crate::events::{Event, EventBus, InteractSubType, InteractionEvent, SdkEvent};
use crate::models::{DownloadProgress, DownloadRequest, DownloadStatus};
use crate::queue::{PersistedDownloadQueue, QueueError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subdirectory of the root storage dir where downloaded files land.
const DOWNLOAD_DIR_NAME: &str = "Download";
/// Default progress poll interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Bookkeeping for the single in-flight download.
struct ActiveDownload {
    request: DownloadRequest,
    token: CancellationToken,
    poll_handle: Option<JoinHandle<()>>,
}

/// Serializes content downloads through the download backend.
///
/// At most one download is active at a time; the rest wait in the persisted
/// queue. Progress is polled on a fixed interval and republished on the event
/// bus under the downloads namespace; a registered completion delegate is
/// invoked once per successful download. A download that finishes
/// (successfully or not) is removed from the persisted queue and the next
/// pending request is promoted, so the queue always keeps advancing.
pub struct DownloadManager {
    backend: Arc<dyn DownloadBackend>,
    queue: PersistedDownloadQueue,
    events: EventBus,
    telemetry: Arc<dyn TelemetrySink>,
    root_dir: PathBuf,
    poll_interval: Duration,
    active: Mutex<Option<ActiveDownload>>,
    delegate: Mutex<Option<Arc<dyn DownloadCompleteDelegate>>>,
}

impl DownloadManager {
    pub fn new(
        backend: Arc<dyn DownloadBackend>,
        queue: PersistedDownloadQueue,
        events: EventBus,
        telemetry: Arc<dyn TelemetrySink>,
        root_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            queue,
            events,
            telemetry,
            root_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            active: Mutex::new(None),
            delegate: Mutex::new(None),
        }
    }

    /// Overrides the progress poll interval (tests use a short one).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Resumes work left over from a previous process: promotes the oldest
    /// pending request, if any.
    pub async fn init(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.promote_next().await
    }

    /// Registers the single completion callback. Last write wins.
    pub async fn register_completion_delegate(&self, delegate: Arc<dyn DownloadCompleteDelegate>) {
        *self.delegate.lock().await = Some(delegate);
    }

    /// Adds requests to the persisted queue, keyed by identifier. Requests
    /// whose identifier is already queued or active are left untouched. If
    /// nothing is currently downloading, one request is promoted immediately.
    pub async fn enqueue(
        self: &Arc<Self>,
        requests: Vec<DownloadRequest>,
    ) -> Result<(), ManagerError> {
        let had_active = self.active.lock().await.is_some();
        self.queue.add_all(&requests).await?;
        if !had_active {
            self.promote_next().await?;
        }
        Ok(())
    }

    /// Cancels one request by identifier. Cancelling the active download
    /// removes it from the backend and promotes the next pending request;
    /// cancelling a queued request only drops it from the queue. An unknown
    /// identifier is a no-op.
    pub async fn cancel(
        self: &Arc<Self>,
        identifier: &str,
        emit_telemetry: bool,
    ) -> Result<(), ManagerError> {
        let taken = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(current) if current.request.identifier == identifier => active.take(),
                _ => None,
            }
        };

        match taken {
            Some(mut current) => {
                current.token.cancel();
                if let Some(handle) = current.poll_handle.take() {
                    let _ = handle.await;
                }
                if let Some(download_id) = current.request.download_id {
                    if let Err(e) = self.backend.remove(&[download_id]).await {
                        warn!(identifier, error = %e, "backend remove failed during cancel");
                    }
                }
                self.remove_from_queue(identifier, emit_telemetry).await?;
                info!(identifier, "active download cancelled");
                self.promote_next().await
            }
            None => self.remove_from_queue(identifier, emit_telemetry).await,
        }
    }

    /// Cancels the active download (if any) and drops every queued request,
    /// emitting one cancellation telemetry event per removed request.
    pub async fn cancel_all(self: &Arc<Self>) -> Result<(), ManagerError> {
        let taken = self.active.lock().await.take();
        if let Some(mut current) = taken {
            current.token.cancel();
            if let Some(handle) = current.poll_handle.take() {
                let _ = handle.await;
            }
            if let Some(download_id) = current.request.download_id {
                if let Err(e) = self.backend.remove(&[download_id]).await {
                    warn!(error = %e, "backend remove failed during cancel_all");
                }
            }
        }

        let removed = self.queue.clear().await?;
        info!(count = removed.len(), "download queue cleared");
        for request in removed {
            self.log_telemetry(InteractionEvent::content_download(
                InteractSubType::ContentDownloadCancel,
                &request.identifier,
            ))
            .await;
        }
        Ok(())
    }

    /// Live view of the queue contents (active download included), re-pushed
    /// on every queue mutation.
    pub fn active_download_requests(&self) -> WatchStream<Vec<DownloadRequest>> {
        WatchStream::new(self.queue.watch())
    }

    /// Snapshot of the request currently submitted to the backend, if any.
    pub async fn current_download(&self) -> Option<DownloadRequest> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.request.clone())
    }

    /// Promotes the oldest pending request: submits it to the backend,
    /// records the assigned id and destination path, and starts the progress
    /// poll. A request whose submission fails is dropped (implicit cancel)
    /// and the next one is tried.
    async fn promote_next(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(());
        }

        loop {
            let pending = self.queue.snapshot().await?;
            let Some(mut request) = pending.into_iter().next() else {
                *active = None;
                return Ok(());
            };

            let destination = self
                .root_dir
                .join(DOWNLOAD_DIR_NAME)
                .join(&request.filename);
            let submission = self
                .backend
                .enqueue(EnqueueRequest {
                    uri: request.download_url.clone(),
                    title: request.filename.clone(),
                    destination: destination.clone(),
                    mime_type: request.mime_type.clone(),
                    headers: Vec::new(),
                })
                .await;

            match submission {
                Ok(download_id) => {
                    request.download_id = Some(download_id);
                    request.downloaded_file_path = Some(destination);
                    self.queue.update(&request).await?;

                    let token = CancellationToken::new();
                    let poll_handle = self.spawn_poll_task(request.clone(), token.clone());
                    *active = Some(ActiveDownload {
                        request: request.clone(),
                        token,
                        poll_handle: Some(poll_handle),
                    });

                    self.log_telemetry(InteractionEvent::content_download(
                        InteractSubType::ContentDownloadInitiate,
                        &request.identifier,
                    ))
                    .await;
                    info!(identifier = %request.identifier, download_id, "download initiated");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        identifier = %request.identifier,
                        error = %e,
                        "backend submission failed, dropping request"
                    );
                    self.remove_from_queue(&request.identifier, true).await?;
                }
            }
        }
    }

    fn spawn_poll_task(
        self: &Arc<Self>,
        request: DownloadRequest,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut last: Option<DownloadProgress> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(manager.poll_interval) => {}
                }

                let (snapshot, query_failed) = manager.poll_progress(&request).await;
                if last.as_ref() != Some(&snapshot) {
                    if snapshot.status == DownloadStatus::Successful {
                        manager.handle_completion(&request).await;
                    }
                    manager
                        .events
                        .emit(SdkEvent::downloads(Event::DownloadProgress(snapshot.clone())));
                }
                let status = snapshot.status;
                last = Some(snapshot);

                if query_failed {
                    // The backend lost track of this download; treat it as a
                    // cancellation so the queue keeps moving.
                    manager
                        .advance_past(&request.identifier, true, true)
                        .await;
                    break;
                }
                match status {
                    DownloadStatus::Successful => {
                        manager
                            .advance_past(&request.identifier, false, false)
                            .await;
                        break;
                    }
                    DownloadStatus::Failed => {
                        manager
                            .advance_past(&request.identifier, true, false)
                            .await;
                        break;
                    }
                    DownloadStatus::Queued | DownloadStatus::Running => {}
                }
            }
        })
    }

    /// Queries the backend for the request's progress. Returns the snapshot
    /// plus whether the query itself failed (in which case the snapshot is a
    /// synthesized terminal failure).
    async fn poll_progress(&self, request: &DownloadRequest) -> (DownloadProgress, bool) {
        let download_id = request.download_id.unwrap_or(-1);
        match self.backend.query(&[download_id]).await {
            Ok(entries) => match entries.first() {
                Some(entry) => {
                    let progress = if entry.total_size_bytes > 0 {
                        let ratio =
                            entry.bytes_downloaded_so_far as f64 / entry.total_size_bytes as f64;
                        (ratio * 100.0).round() as i32
                    } else {
                        -1
                    };
                    (
                        DownloadProgress {
                            download_id,
                            identifier: request.identifier.clone(),
                            progress,
                            status: entry.status,
                        },
                        false,
                    )
                }
                None => (Self::failed_snapshot(request, download_id), true),
            },
            Err(e) => {
                debug!(identifier = %request.identifier, error = %e, "progress query failed");
                (Self::failed_snapshot(request, download_id), true)
            }
        }
    }

    fn failed_snapshot(request: &DownloadRequest, download_id: i64) -> DownloadProgress {
        DownloadProgress {
            download_id,
            identifier: request.identifier.clone(),
            progress: -1,
            status: DownloadStatus::Failed,
        }
    }

    /// Emits completion telemetry and invokes the registered delegate, if
    /// one is present. Delegate failures are logged, never propagated.
    async fn handle_completion(&self, request: &DownloadRequest) {
        let delegate = self.delegate.lock().await.clone();
        let Some(delegate) = delegate else {
            return;
        };
        self.log_telemetry(InteractionEvent::content_download(
            InteractSubType::ContentDownloadSuccess,
            &request.identifier,
        ))
        .await;
        if let Err(e) = delegate.on_download_completion(request.clone()).await {
            warn!(identifier = %request.identifier, error = %e, "completion delegate failed");
        }
        info!(identifier = %request.identifier, "download completed");
    }

    /// Called from the poll task once its download reaches a terminal state:
    /// clears the active slot, optionally removes the backend record, drops
    /// the request from the queue and promotes the next one.
    async fn advance_past(
        self: &Arc<Self>,
        identifier: &str,
        remove_from_backend: bool,
        emit_cancel_telemetry: bool,
    ) {
        let taken = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(current) if current.request.identifier == identifier => active.take(),
                _ => None,
            }
        };
        let Some(current) = taken else {
            // An external cancel got here first.
            return;
        };
        current.token.cancel();

        if remove_from_backend {
            if let Some(download_id) = current.request.download_id {
                if let Err(e) = self.backend.remove(&[download_id]).await {
                    warn!(identifier, error = %e, "backend remove failed while advancing");
                }
            }
        }
        if let Err(e) = self
            .remove_from_queue(identifier, emit_cancel_telemetry)
            .await
        {
            warn!(identifier, error = %e, "queue removal failed while advancing");
        }
        if let Err(e) = self.promote_next().await {
            warn!(error = %e, "failed to promote next download");
        }
    }

    async fn remove_from_queue(
        &self,
        identifier: &str,
        emit_telemetry: bool,
    ) -> Result<(), ManagerError> {
        if let Some(removed) = self.queue.remove(identifier).await? {
            if emit_telemetry {
                self.log_telemetry(InteractionEvent::content_download(
                    InteractSubType::ContentDownloadCancel,
                    &removed.identifier,
                ))
                .await;
            }
        }
        Ok(())
    }

    async fn log_telemetry(&self, event: InteractionEvent) {
        if let Err(e) = self.telemetry.log_interaction(event).await {
            warn!(error = %e, "telemetry sink failure ignored");
        }
    }
}
