//! Per-kind snapshot manifest.

use crate::error::Result;
use crate::model::EntityKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The `manifest` file shipped next to each kind's partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    #[serde(default)]
    pub meta: ManifestMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub content_length: Option<u64>,
    pub record_count: Option<u64>,
}

impl SnapshotManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl ManifestEntry {
    /// Path of the partition relative to the snapshot root.
    ///
    /// URLs look like `s3://bucket/data/works/updated_date=.../part_000.gz`;
    /// everything after `/data/` is the local layout. URLs without that
    /// marker are taken to be relative to the kind directory.
    pub fn relative_path(&self, kind: EntityKind) -> String {
        if let Some((_, rest)) = self.url.split_once("/data/") {
            return rest.to_string();
        }
        let trimmed = self.url.trim_start_matches("./");
        let prefix = format!("{}/", kind.as_str());
        if trimmed.starts_with(&prefix) {
            trimmed.to_string()
        } else {
            format!("{}{}", prefix, trimmed)
        }
    }
}
