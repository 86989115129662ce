// src/transfer.rs
//
// Content migration pipeline: an ordered sequence of steps sharing one
// `TransferContext`. Each step consumes the context and returns it (possibly
// extended), or fails the whole run. Only the admission check fails the run;
// per-item filesystem trouble later on is logged and skipped so a single bad
// content folder cannot stall a batch.

use crate::backend::{BackendError, Filesystem, StorageInspector};
use crate::models::{
    CompatibilityConfig, ContentEntry, ExistingContentAction, Manifest, MoveContentResponse,
    MoveContentStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the per-content metadata file.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
/// Staging directory under the destination folder holding copies in flight.
const TEMP_DIR_NAME: &str = "temp";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("available storage not sufficient for transfer operation")]
    LowMemory,
    #[error("filesystem error: {0}")]
    Backend(#[from] BackendError),
}

/// Mutable state threaded through the pipeline. Each step owns the context
/// for the duration of its run; a field set by one step is only read or
/// extended by later steps.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    pub source_folder: PathBuf,
    pub destination_folder: PathBuf,
    /// Content rows present in the source folder.
    pub contents_in_source: Vec<ContentEntry>,
    /// Duplicate-resolution outcomes, keyed by content identifier.
    pub duplicate_contents: Vec<MoveContentResponse>,
    /// Destination subdirectories holding at least one valid content item.
    pub valid_content_ids_in_destination: Vec<String>,
    /// Policy for content existing in both locations; `None` means leave
    /// duplicated content alone.
    pub existing_content_action: Option<ExistingContentAction>,
}

impl TransferContext {
    pub fn new(
        source_folder: impl Into<PathBuf>,
        destination_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_folder: source_folder.into(),
            destination_folder: destination_folder.into(),
            ..Self::default()
        }
    }
}

/// One stateless pipeline step.
#[async_trait]
pub trait TransferStep: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, context: TransferContext) -> Result<TransferContext, TransferError>;
}

/// Folds the context through the steps in order, aborting on the first
/// failure.
pub async fn run_pipeline(
    steps: &[Box<dyn TransferStep>],
    mut context: TransferContext,
) -> Result<TransferContext, TransferError> {
    for step in steps {
        debug!(step = step.name(), "running transfer step");
        context = step.execute(context).await?;
    }
    Ok(context)
}

/// Admission control: refuses the batch when the destination volume cannot
/// hold the source content. Runs before any filesystem mutation, so failing
/// here is safe.
pub struct DeviceMemoryCheck {
    storage: Arc<dyn StorageInspector>,
}

impl DeviceMemoryCheck {
    pub fn new(storage: Arc<dyn StorageInspector>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TransferStep for DeviceMemoryCheck {
    fn name(&self) -> &'static str {
        "device_memory_check"
    }

    async fn execute(&self, context: TransferContext) -> Result<TransferContext, TransferError> {
        let usable_space = self
            .storage
            .usable_space(&context.destination_folder)
            .await?;
        let usages = self
            .storage
            .usage_of(&[context.source_folder.clone()])
            .await?;
        let space_required = usages.first().map(|u| u.size_on_device).unwrap_or(0);

        if usable_space < space_required {
            return Err(TransferError::LowMemory);
        }
        Ok(context)
    }
}

/// Scans the destination for subdirectories that already hold recognizable,
/// usable content. A directory counts when its manifest parses and at least
/// one item is standalone-visible, within the supported compatibility window
/// and not an expired draft. Directories without a readable manifest are
/// silently skipped.
pub struct ValidateDestinationContent {
    fs: Arc<dyn Filesystem>,
    config: CompatibilityConfig,
}

impl ValidateDestinationContent {
    pub fn new(fs: Arc<dyn Filesystem>, config: CompatibilityConfig) -> Self {
        Self { fs, config }
    }

    async fn read_manifest(&self, dir: &Path) -> Option<Manifest> {
        let raw = match self.fs.read_to_string(dir, MANIFEST_FILE_NAME).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "no readable manifest, skipping");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "unparsable manifest, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl TransferStep for ValidateDestinationContent {
    fn name(&self) -> &'static str {
        "validate_destination_content"
    }

    async fn execute(
        &self,
        mut context: TransferContext,
    ) -> Result<TransferContext, TransferError> {
        let entries = self.fs.list_dir(&context.destination_folder).await?;
        let now = Utc::now();

        let mut valid_ids = Vec::new();
        for entry in entries.into_iter().filter(|e| e.is_directory) {
            let Some(manifest) = self.read_manifest(&entry.path).await else {
                continue;
            };
            let has_valid_item = manifest.archive.items.iter().any(|item| {
                !item.is_parent_only()
                    && self.config.is_compatible(item.compatibility_level)
                    && !item.is_expired_draft(now)
            });
            if has_valid_item && !valid_ids.contains(&entry.name) {
                valid_ids.push(entry.name);
            }
        }

        context.valid_content_ids_in_destination = valid_ids;
        Ok(context)
    }
}

/// Final step of a migration: promotes staged copies into the destination,
/// applies the duplicate-resolution policy, deletes migrated source folders
/// and reclaims the staging area.
///
/// Everything here is best-effort per content item; a copy or delete failure
/// is logged and the loop moves on. Items are processed strictly in input
/// order and the staging root is only removed after the last one.
pub struct DeleteSourceFolder {
    fs: Arc<dyn Filesystem>,
}

impl DeleteSourceFolder {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }

    /// Copy the staged tree into its final place, then drop the staged copy
    /// and the original source folder.
    async fn finalize(
        &self,
        context: &TransferContext,
        temp_root: &Path,
        content: &ContentEntry,
    ) -> Result<(), BackendError> {
        let staged = temp_root.join(&content.identifier);
        let final_destination = context.destination_folder.join(&content.identifier);
        self.fs.copy_tree(&staged, &final_destination).await?;
        self.fs.remove_tree(&staged).await?;
        self.fs.remove_tree(&content.path).await?;
        Ok(())
    }

    async fn remove_source_and_staged(&self, temp_root: &Path, content: &ContentEntry) {
        let staged = temp_root.join(&content.identifier);
        if let Err(e) = self.fs.remove_tree(&staged).await {
            warn!(identifier = %content.identifier, error = %e, "failed to drop staged copy");
        }
        if let Err(e) = self.fs.remove_tree(&content.path).await {
            warn!(identifier = %content.identifier, error = %e, "failed to drop source copy");
        }
    }

    async fn process_content(
        &self,
        context: &TransferContext,
        temp_root: &Path,
        content: &ContentEntry,
    ) {
        let resolution = context
            .duplicate_contents
            .iter()
            .find(|m| m.identifier == content.identifier);

        let Some(resolution) = resolution else {
            // Nothing already in the destination claims this identifier:
            // promote it unconditionally.
            if let Err(e) = self.finalize(context, temp_root, content).await {
                warn!(identifier = %content.identifier, error = %e, "content transfer failed, continuing");
            }
            return;
        };

        let Some(action) = context.existing_content_action else {
            // Duplicate but no policy: leave both copies untouched.
            return;
        };

        if resolution.status == MoveContentStatus::SameVersionInBoth {
            return;
        }

        match action {
            ExistingContentAction::KeepHigherVersion => {
                if resolution.status != MoveContentStatus::HigherVersionInDestination {
                    self.remove_source_and_staged(temp_root, content).await;
                }
            }
            ExistingContentAction::KeepLowerVersion => {
                if resolution.status != MoveContentStatus::LowerVersionInDestination {
                    self.remove_source_and_staged(temp_root, content).await;
                }
            }
            ExistingContentAction::KeepSource => {
                let existing = context.destination_folder.join(&content.identifier);
                if let Err(e) = self.fs.remove_tree(&existing).await {
                    warn!(identifier = %content.identifier, error = %e, "failed to drop destination copy");
                }
                if let Err(e) = self.finalize(context, temp_root, content).await {
                    warn!(identifier = %content.identifier, error = %e, "content transfer failed, continuing");
                }
            }
            ExistingContentAction::KeepDestination | ExistingContentAction::Ignore => {}
        }
    }
}

#[async_trait]
impl TransferStep for DeleteSourceFolder {
    fn name(&self) -> &'static str {
        "delete_source_folder"
    }

    async fn execute(&self, context: TransferContext) -> Result<TransferContext, TransferError> {
        let temp_root = context.destination_folder.join(TEMP_DIR_NAME);
        let last_index = context.contents_in_source.len().saturating_sub(1);

        for (index, content) in context.contents_in_source.iter().enumerate() {
            self.process_content(&context, &temp_root, content).await;
            if index == last_index {
                // Reclaim the staging area once the batch is done.
                if let Err(e) = self.fs.remove_tree(&temp_root).await {
                    debug!(error = %e, "staging area already gone");
                }
            }
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalFilesystem, StorageUsage};
    use tokio::fs;

    struct MockInspector {
        usable: u64,
        used: u64,
    }

    #[async_trait]
    impl StorageInspector for MockInspector {
        async fn usable_space(&self, _path: &Path) -> Result<u64, BackendError> {
            Ok(self.usable)
        }

        async fn usage_of(&self, paths: &[PathBuf]) -> Result<Vec<StorageUsage>, BackendError> {
            Ok(paths
                .iter()
                .map(|path| StorageUsage {
                    path: path.clone(),
                    size_on_device: self.used,
                })
                .collect())
        }
    }

    fn local_fs() -> Arc<dyn Filesystem> {
        Arc::new(LocalFilesystem)
    }

    async fn write_source_content(source: &Path, identifier: &str) -> ContentEntry {
        let path = source.join(identifier);
        fs::create_dir_all(&path).await.unwrap();
        fs::write(path.join("payload.bin"), identifier.as_bytes())
            .await
            .unwrap();
        ContentEntry {
            identifier: identifier.to_string(),
            path,
        }
    }

    async fn stage_content(destination: &Path, identifier: &str, marker: &str) {
        let staged = destination.join(TEMP_DIR_NAME).join(identifier);
        fs::create_dir_all(&staged).await.unwrap();
        fs::write(staged.join(marker), marker.as_bytes()).await.unwrap();
    }

    async fn write_destination_manifest(destination: &Path, identifier: &str, manifest: &str) {
        let dir = destination.join(identifier);
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(MANIFEST_FILE_NAME), manifest).await.unwrap();
    }

    #[tokio::test]
    async fn admission_fails_when_space_is_insufficient() {
        let step = DeviceMemoryCheck::new(Arc::new(MockInspector {
            usable: 99,
            used: 100,
        }));
        let context = TransferContext::new("/src", "/dest");
        assert!(matches!(
            step.execute(context).await,
            Err(TransferError::LowMemory)
        ));
    }

    #[tokio::test]
    async fn admission_passes_at_the_exact_boundary() {
        let step = DeviceMemoryCheck::new(Arc::new(MockInspector {
            usable: 100,
            used: 100,
        }));
        let context = TransferContext::new("/src", "/dest");
        assert!(step.execute(context).await.is_ok());
    }

    #[tokio::test]
    async fn admission_failure_runs_before_any_mutation() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let destination = root.path().join("destination");
        fs::create_dir_all(&destination).await.unwrap();
        let entry = write_source_content(&source, "c1").await;

        let steps: Vec<Box<dyn TransferStep>> = vec![
            Box::new(DeviceMemoryCheck::new(Arc::new(MockInspector {
                usable: 0,
                used: 1,
            }))),
            Box::new(DeleteSourceFolder::new(local_fs())),
        ];
        let mut context = TransferContext::new(&source, &destination);
        context.contents_in_source = vec![entry.clone()];

        assert!(run_pipeline(&steps, context).await.is_err());
        assert!(entry.path.exists());
        assert!(!destination.join("c1").exists());
    }

    #[tokio::test]
    async fn validation_collects_directories_with_valid_items() {
        let root = tempfile::tempdir().unwrap();
        let destination = root.path();

        write_destination_manifest(
            destination,
            "content-1",
            r#"{"version": "1.0", "archive": {"items": [
                {"identifier": "do_1", "visibility": "Default", "compatibilityLevel": 2},
                {"identifier": "do_1_child", "visibility": "Parent"}
            ]}}"#,
        )
        .await;
        // Parent-only item: the whole directory is excluded.
        write_destination_manifest(
            destination,
            "content-42",
            r#"{"version": "1.0", "archive": {"items": [
                {"identifier": "do_42", "visibility": "Parent"}
            ]}}"#,
        )
        .await;
        // Compatibility level above the supported window.
        write_destination_manifest(
            destination,
            "content-2",
            r#"{"version": "1.0", "archive": {"items": [
                {"identifier": "do_2", "compatibilityLevel": 99}
            ]}}"#,
        )
        .await;
        // No manifest at all.
        fs::create_dir_all(destination.join("content-3")).await.unwrap();
        // Garbage manifest.
        write_destination_manifest(destination, "content-4", "{ not json").await;

        let step =
            ValidateDestinationContent::new(local_fs(), CompatibilityConfig::default());
        let context = step
            .execute(TransferContext::new("/src", destination))
            .await
            .unwrap();

        assert_eq!(
            context.valid_content_ids_in_destination,
            vec!["content-1".to_string()]
        );
    }

    #[tokio::test]
    async fn validation_excludes_expired_drafts() {
        let root = tempfile::tempdir().unwrap();
        let destination = root.path();
        let past = (Utc::now() - chrono::Duration::days(2)).to_rfc3339();

        write_destination_manifest(
            destination,
            "content-5",
            &format!(
                r#"{{"version": "1.0", "archive": {{"items": [
                    {{"identifier": "do_5", "status": "Draft", "expires": "{past}"}}
                ]}}}}"#
            ),
        )
        .await;

        let step =
            ValidateDestinationContent::new(local_fs(), CompatibilityConfig::default());
        let context = step
            .execute(TransferContext::new("/src", destination))
            .await
            .unwrap();
        assert!(context.valid_content_ids_in_destination.is_empty());
    }

    #[tokio::test]
    async fn batch_without_duplicates_moves_every_content() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let destination = root.path().join("destination");
        fs::create_dir_all(&destination).await.unwrap();

        let ids = ["c1", "c2", "c3"];
        let mut contents = Vec::new();
        for id in ids {
            contents.push(write_source_content(&source, id).await);
            stage_content(&destination, id, "payload.bin").await;
        }

        let mut context = TransferContext::new(&source, &destination);
        context.contents_in_source = contents;

        let step = DeleteSourceFolder::new(local_fs());
        step.execute(context).await.unwrap();

        for id in ids {
            assert!(!source.join(id).exists(), "source {id} should be gone");
            assert!(
                destination.join(id).join("payload.bin").exists(),
                "destination {id} should exist"
            );
        }
        assert!(!destination.join(TEMP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn same_version_is_untouched_under_every_policy() {
        for action in [
            ExistingContentAction::KeepHigherVersion,
            ExistingContentAction::KeepLowerVersion,
            ExistingContentAction::KeepSource,
            ExistingContentAction::KeepDestination,
            ExistingContentAction::Ignore,
        ] {
            let root = tempfile::tempdir().unwrap();
            let source = root.path().join("source");
            let destination = root.path().join("destination");
            let entry = write_source_content(&source, "c1").await;
            write_destination_manifest(&destination, "c1", "{}").await;
            stage_content(&destination, "c1", "staged.bin").await;

            let mut context = TransferContext::new(&source, &destination);
            context.contents_in_source = vec![entry.clone()];
            context.duplicate_contents = vec![MoveContentResponse {
                identifier: "c1".to_string(),
                status: MoveContentStatus::SameVersionInBoth,
            }];
            context.existing_content_action = Some(action);

            DeleteSourceFolder::new(local_fs())
                .execute(context)
                .await
                .unwrap();

            assert!(entry.path.exists(), "{action:?}: source must survive");
            assert!(
                destination.join("c1").join(MANIFEST_FILE_NAME).exists(),
                "{action:?}: destination copy must survive"
            );
            assert!(!destination.join(TEMP_DIR_NAME).exists());
        }
    }

    #[tokio::test]
    async fn duplicate_without_policy_leaves_both_copies() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let destination = root.path().join("destination");
        let entry = write_source_content(&source, "c1").await;
        write_destination_manifest(&destination, "c1", "{}").await;
        stage_content(&destination, "c1", "staged.bin").await;

        let mut context = TransferContext::new(&source, &destination);
        context.contents_in_source = vec![entry.clone()];
        context.duplicate_contents = vec![MoveContentResponse {
            identifier: "c1".to_string(),
            status: MoveContentStatus::LowerVersionInDestination,
        }];

        DeleteSourceFolder::new(local_fs())
            .execute(context)
            .await
            .unwrap();

        assert!(entry.path.exists());
        assert!(destination.join("c1").join(MANIFEST_FILE_NAME).exists());
        assert!(!destination.join(TEMP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn policy_matrix_decides_whether_the_source_survives() {
        use ExistingContentAction::*;
        use MoveContentStatus::*;

        // (duplicate status, policy, source survives)
        let cases = [
            (HigherVersionInDestination, KeepHigherVersion, true),
            (LowerVersionInDestination, KeepHigherVersion, false),
            (LowerVersionInDestination, KeepLowerVersion, true),
            (HigherVersionInDestination, KeepLowerVersion, false),
            (HigherVersionInDestination, KeepDestination, true),
            (LowerVersionInDestination, KeepDestination, true),
            (HigherVersionInDestination, Ignore, true),
            (LowerVersionInDestination, Ignore, true),
        ];

        for (status, action, source_survives) in cases {
            let root = tempfile::tempdir().unwrap();
            let source = root.path().join("source");
            let destination = root.path().join("destination");
            let entry = write_source_content(&source, "c1").await;
            write_destination_manifest(&destination, "c1", "{}").await;
            stage_content(&destination, "c1", "staged.bin").await;

            let mut context = TransferContext::new(&source, &destination);
            context.contents_in_source = vec![entry.clone()];
            context.duplicate_contents = vec![MoveContentResponse {
                identifier: "c1".to_string(),
                status,
            }];
            context.existing_content_action = Some(action);

            DeleteSourceFolder::new(local_fs())
                .execute(context)
                .await
                .unwrap();

            assert_eq!(
                entry.path.exists(),
                source_survives,
                "{status:?} + {action:?}"
            );
            // The destination copy is never touched by these policies.
            assert!(
                destination.join("c1").join(MANIFEST_FILE_NAME).exists(),
                "{status:?} + {action:?}: destination copy must survive"
            );
            assert!(!destination.join(TEMP_DIR_NAME).exists());
        }
    }

    #[tokio::test]
    async fn keep_source_replaces_the_destination_copy() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let destination = root.path().join("destination");
        let entry = write_source_content(&source, "c1").await;

        // Stale copy already in the destination.
        let stale = destination.join("c1");
        fs::create_dir_all(&stale).await.unwrap();
        fs::write(stale.join("old.txt"), b"old").await.unwrap();
        // Fresh copy staged from the source.
        stage_content(&destination, "c1", "new.txt").await;

        let mut context = TransferContext::new(&source, &destination);
        context.contents_in_source = vec![entry.clone()];
        context.duplicate_contents = vec![MoveContentResponse {
            identifier: "c1".to_string(),
            status: MoveContentStatus::HigherVersionInDestination,
        }];
        context.existing_content_action = Some(ExistingContentAction::KeepSource);

        DeleteSourceFolder::new(local_fs())
            .execute(context)
            .await
            .unwrap();

        assert!(!entry.path.exists(), "source should be promoted away");
        assert!(destination.join("c1/new.txt").exists());
        assert!(!destination.join("c1/old.txt").exists());
        assert!(!destination.join(TEMP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn one_broken_item_does_not_stall_the_batch() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let destination = root.path().join("destination");
        fs::create_dir_all(&destination).await.unwrap();

        // c1 has no staged copy at all, so its finalize fails; c2 is fine.
        let broken = write_source_content(&source, "c1").await;
        let good = write_source_content(&source, "c2").await;
        stage_content(&destination, "c2", "payload.bin").await;

        let mut context = TransferContext::new(&source, &destination);
        context.contents_in_source = vec![broken.clone(), good.clone()];

        DeleteSourceFolder::new(local_fs())
            .execute(context)
            .await
            .unwrap();

        // The broken item is left behind, the good one migrated.
        assert!(broken.path.exists());
        assert!(!good.path.exists());
        assert!(destination.join("c2/payload.bin").exists());
        assert!(!destination.join(TEMP_DIR_NAME).exists());
    }
}
