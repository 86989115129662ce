// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The status of a download, as reported by the download backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Running,
    Successful,
    Failed,
}

/// A request to download a single content package.
///
/// Created by the caller at enqueue time; `download_id` and
/// `downloaded_file_path` are filled in once the request is promoted and
/// submitted to the download backend. Requests are keyed by `identifier` in
/// the persisted queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequest {
    /// Stable content identifier, unique within the queue.
    pub identifier: String,
    pub download_url: String,
    pub filename: String,
    pub mime_type: String,
    /// Backend-assigned id, present once the request has been submitted.
    pub download_id: Option<i64>,
    /// Computed destination path, present once the request has been submitted.
    pub downloaded_file_path: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(identifier: &str, download_url: &str, filename: &str, mime_type: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            download_url: download_url.to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            download_id: None,
            downloaded_file_path: None,
        }
    }
}

/// One progress snapshot for the active download.
///
/// Produced per poll tick and never persisted. `progress` is 0–100 when the
/// total size is known, and -1 when it is unknown or the poll itself failed.
/// Structural equality is what suppresses duplicate emissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadProgress {
    pub download_id: i64,
    pub identifier: String,
    pub progress: i32,
    pub status: DownloadStatus,
}

/// One content row present in the source folder of a migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentEntry {
    pub identifier: String,
    pub path: PathBuf,
}

/// Outcome of comparing the source and destination versions of one content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MoveContentStatus {
    SameVersionInBoth,
    HigherVersionInDestination,
    LowerVersionInDestination,
}

/// Duplicate-resolution outcome for one content identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveContentResponse {
    pub identifier: String,
    pub status: MoveContentStatus,
}

/// Caller-supplied policy deciding which copy of a duplicated content wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExistingContentAction {
    KeepHigherVersion,
    KeepLowerVersion,
    KeepSource,
    KeepDestination,
    Ignore,
}

/// Visibility value that hides an item from standalone listings.
pub const VISIBILITY_PARENT: &str = "Parent";
/// Status value marking an item as an unpublished draft.
pub const STATUS_DRAFT: &str = "Draft";

fn default_compatibility_level() -> i32 {
    1
}

/// One item descriptor inside a content archive manifest.
///
/// Only the fields the engine inspects are modelled; everything else a
/// producer wrote is preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default = "default_compatibility_level")]
    pub compatibility_level: i32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ManifestItem {
    /// Items visible only through their parent collection do not count as
    /// standalone content.
    pub fn is_parent_only(&self) -> bool {
        self.visibility.as_deref() == Some(VISIBILITY_PARENT)
    }

    /// A draft whose expiry timestamp lies in the past is dead content.
    /// An absent or unparsable expiry counts as not expired.
    pub fn is_expired_draft(&self, now: DateTime<Utc>) -> bool {
        if self.status.as_deref() != Some(STATUS_DRAFT) {
            return false;
        }
        match self.expires.as_deref() {
            Some(expires) => match DateTime::parse_from_rfc3339(expires) {
                Ok(expiry) => expiry.with_timezone(&Utc) < now,
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// Archive envelope inside a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Archive {
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub count: usize,
    pub items: Vec<ManifestItem>,
}

/// Metadata envelope at the root of every content directory
/// (`manifest.json`) and of every exported archive.
///
/// Import only requires `version` and `archive`; the remaining fields are
/// filled when a manifest is built for export and default otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub ts: String,
    pub archive: Archive,
}

/// Compatibility window supported by the running app. An item participates
/// in content operations only when its level falls inside the inclusive
/// range.
#[derive(Debug, Clone, Copy)]
pub struct CompatibilityConfig {
    pub min_compatibility_level: i32,
    pub max_compatibility_level: i32,
}

impl CompatibilityConfig {
    pub fn is_compatible(&self, level: i32) -> bool {
        level >= self.min_compatibility_level && level <= self.max_compatibility_level
    }
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            min_compatibility_level: 1,
            max_compatibility_level: 4,
        }
    }
}
