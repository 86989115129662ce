// src/export.rs

use crate::models::{Archive, Manifest, ManifestItem};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Archive-type tag written into every exported manifest.
pub const CONTENT_ARCHIVE_ID: &str = "sdk.content.archive";
/// Manifest schema version this engine produces.
pub const SUPPORTED_MANIFEST_VERSION: &str = "1.1";
/// Hours an exported archive stays importable.
const ARCHIVE_TTL_HOURS: u32 = 24;

/// Turns content model descriptors into manifest items. The population logic
/// (flattening hierarchies, stripping server-only fields) lives with the
/// content layer, outside this engine.
pub trait ItemPopulator: Send + Sync {
    fn populate_items(&self, content_models: &[serde_json::Value]) -> Vec<ManifestItem>;
}

/// Context for one export run.
#[derive(Debug, Clone, Default)]
pub struct ExportContext {
    /// Content model descriptors selected for export.
    pub content_models: Vec<serde_json::Value>,
    /// Items populated from the models, in export order.
    pub items: Vec<ManifestItem>,
    /// Manifest envelope, set once the builder has run.
    pub manifest: Option<Manifest>,
}

impl ExportContext {
    pub fn new(content_models: Vec<serde_json::Value>) -> Self {
        Self {
            content_models,
            ..Self::default()
        }
    }
}

/// Assembles the archive manifest for an outbound content package. Item
/// contents are not validated here; the import side does that when it reads
/// the manifest back.
pub struct CreateExportManifest {
    populator: Arc<dyn ItemPopulator>,
}

impl CreateExportManifest {
    pub fn new(populator: Arc<dyn ItemPopulator>) -> Self {
        Self { populator }
    }

    pub fn execute(&self, mut context: ExportContext) -> ExportContext {
        let items = self.populator.populate_items(&context.content_models);
        debug!(count = items.len(), "export manifest populated");
        context.items = items;

        context.manifest = Some(Manifest {
            id: CONTENT_ARCHIVE_ID.to_string(),
            version: SUPPORTED_MANIFEST_VERSION.to_string(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            archive: Archive {
                ttl: ARCHIVE_TTL_HOURS,
                count: context.items.len(),
                items: context.items.clone(),
            },
        });
        context
    }
}
