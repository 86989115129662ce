pub mod backend;
pub mod downloader;
pub mod events;
pub mod export;
pub mod manager;
pub mod models;
pub mod queue;
pub mod transfer;

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::backend::{
        BackendError, DownloadBackend, DownloadCompleteDelegate, Filesystem, LocalFilesystem,
        LocalStorage, StorageInspector, TelemetrySink,
    };
    pub use crate::downloader::HttpDownloadBackend;
    pub use crate::events::{Event, EventBus, EventNamespace, SdkEvent};
    pub use crate::export::{CreateExportManifest, ExportContext, ItemPopulator};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{
        CompatibilityConfig, ContentEntry, DownloadProgress, DownloadRequest, DownloadStatus,
        ExistingContentAction, Manifest, MoveContentResponse, MoveContentStatus,
    };
    pub use crate::queue::{PersistedDownloadQueue, QueueError};
    pub use crate::transfer::{
        run_pipeline, DeleteSourceFolder, DeviceMemoryCheck, TransferContext, TransferError,
        TransferStep, ValidateDestinationContent,
    };
}
