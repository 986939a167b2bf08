//! Snapshot discovery and streaming partition reads.
//!
//! A snapshot is laid out as `<root>/<kind>/updated_date=<date>/part_<n>.gz`,
//! optionally with a `<root>/<kind>/manifest` listing every partition and its
//! expected record count.

mod manifest;
mod reader;

pub use manifest::{ManifestEntry, ManifestMeta, SnapshotManifest};
pub use reader::{PartitionReader, ReadStats, ReaderOptions};

use crate::config::SourceConfig;
use crate::error::{LoadError, Result};
use crate::model::EntityKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One partition file: the smallest resumable unit of ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub kind: EntityKind,

    /// Path relative to the snapshot root, with `/` separators. Stable
    /// across runs and used as the unit's key in run state.
    pub partition: String,

    /// Absolute path on disk.
    pub path: PathBuf,

    /// Compressed size in bytes.
    pub bytes: u64,

    /// Record count announced by the manifest, when one was used.
    pub expected_records: Option<u64>,

    /// Listed in the manifest but absent on disk.
    pub missing: bool,
}

/// Enumerate every partition of the configured kinds.
///
/// Fails only when the snapshot root itself is missing. A missing kind
/// directory is logged and contributes no units.
pub fn discover(config: &SourceConfig) -> Result<Vec<WorkUnit>> {
    let root = &config.snapshot_root;
    if !root.is_dir() {
        return Err(LoadError::MissingPartitionRoot(root.clone()));
    }

    let mut units = Vec::new();
    for kind in &config.kinds {
        let kind_dir = root.join(kind.as_str());
        if !kind_dir.is_dir() {
            warn!("No directory for {} under {}, skipping", kind, root.display());
            continue;
        }

        let manifest_path = kind_dir.join("manifest");
        let mut kind_units = if config.use_manifest && manifest_path.is_file() {
            let manifest = SnapshotManifest::load(&manifest_path)?;
            units_from_manifest(root, *kind, &manifest)
        } else {
            units_from_walk(root, *kind, &kind_dir)?
        };
        kind_units.sort_by(|a, b| a.partition.cmp(&b.partition));

        let missing = kind_units.iter().filter(|u| u.missing).count();
        if missing > 0 {
            warn!("{}: {} partitions listed in manifest are missing on disk", kind, missing);
        }
        info!("{}: discovered {} partitions", kind, kind_units.len());
        units.extend(kind_units);
    }

    Ok(units)
}

fn units_from_manifest(root: &Path, kind: EntityKind, manifest: &SnapshotManifest) -> Vec<WorkUnit> {
    manifest
        .entries
        .iter()
        .map(|entry| {
            let partition = entry.relative_path(kind);
            let path = root.join(&partition);
            let on_disk = std::fs::metadata(&path).ok();
            WorkUnit {
                kind,
                bytes: entry
                    .meta
                    .content_length
                    .or_else(|| on_disk.as_ref().map(|m| m.len()))
                    .unwrap_or(0),
                expected_records: entry.meta.record_count,
                missing: on_disk.is_none(),
                partition,
                path,
            }
        })
        .collect()
}

fn units_from_walk(root: &Path, kind: EntityKind, kind_dir: &Path) -> Result<Vec<WorkUnit>> {
    let mut units = Vec::new();
    for entry in WalkDir::new(kind_dir).min_depth(1).follow_links(true) {
        let entry = entry.map_err(|e| {
            LoadError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("walking {}: {}", kind_dir.display(), e),
            ))
        })?;
        if !entry.file_type().is_file() || !is_partition_file(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let partition = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!("Found partition {}", partition);
        units.push(WorkUnit {
            kind,
            partition,
            path: entry.path().to_path_buf(),
            bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
            expected_records: None,
            missing: false,
        });
    }
    Ok(units)
}

fn is_partition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("gz") | Some("jsonl") | Some("json")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn source(root: &Path, kinds: Vec<EntityKind>) -> SourceConfig {
        SourceConfig {
            snapshot_root: root.to_path_buf(),
            kinds,
            use_manifest: true,
        }
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let config = source(Path::new("/definitely/not/here"), vec![EntityKind::Works]);
        assert!(matches!(
            discover(&config),
            Err(LoadError::MissingPartitionRoot(_))
        ));
    }

    #[test]
    fn test_walk_discovers_sorted_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("works/updated_date=2024-02-01/part_000.gz"), b"x");
        touch(&root.join("works/updated_date=2024-01-01/part_001.gz"), b"xy");
        touch(&root.join("works/updated_date=2024-01-01/part_000.gz"), b"xyz");
        touch(&root.join("works/updated_date=2024-01-01/README.txt"), b"ignored");
        touch(&root.join("authors/updated_date=2024-01-01/part_000.gz"), b"a");

        let units = discover(&source(root, vec![EntityKind::Works, EntityKind::Topics])).unwrap();
        let names: Vec<_> = units.iter().map(|u| u.partition.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "works/updated_date=2024-01-01/part_000.gz",
                "works/updated_date=2024-01-01/part_001.gz",
                "works/updated_date=2024-02-01/part_000.gz",
            ]
        );
        assert_eq!(units[0].bytes, 3);
        assert!(units.iter().all(|u| u.kind == EntityKind::Works && !u.missing));
    }

    #[test]
    fn test_manifest_drives_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("topics/updated_date=2024-01-01/part_000.gz"), b"abc");
        touch(
            &root.join("topics/manifest"),
            br#"{"entries":[
                {"url":"s3://openalex/data/topics/updated_date=2024-01-01/part_000.gz","meta":{"content_length":3,"record_count":10}},
                {"url":"s3://openalex/data/topics/updated_date=2024-01-02/part_000.gz","meta":{"content_length":9,"record_count":4}}
            ]}"#,
        );

        let units = discover(&source(root, vec![EntityKind::Topics])).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].expected_records, Some(10));
        assert!(!units[0].missing);
        assert!(units[1].missing);

        let mut no_manifest = source(root, vec![EntityKind::Topics]);
        no_manifest.use_manifest = false;
        assert_eq!(discover(&no_manifest).unwrap().len(), 1);
    }
}
