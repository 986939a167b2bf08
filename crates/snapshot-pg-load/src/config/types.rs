//! Configuration type definitions with auto-tuning based on system resources.

use crate::model::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Snapshot location and entity kinds to ingest.
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Ingestion behavior.
    #[serde(default)]
    pub load: LoadConfig,

    /// Constraint phase behavior.
    #[serde(default)]
    pub constraints: ConstraintConfig,

    /// Where run state is persisted.
    #[serde(default)]
    pub state: StateConfig,

    /// Directory that receives JSON run and phase reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.load = self.load.with_auto_tuning(&resources);
        self
    }

    /// Apply a command-line worker count. Call before auto-tuning so the
    /// connection pool is sized from the override.
    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        if workers.is_some() {
            self.load.workers = workers;
        }
        self
    }
}

/// Snapshot source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Root directory of the snapshot (contains one directory per entity kind).
    pub snapshot_root: PathBuf,

    /// Entity kinds to ingest (default: all five).
    #[serde(default = "default_kinds")]
    pub kinds: Vec<EntityKind>,

    /// Use the per-kind `manifest` file when present (default: true).
    #[serde(default = "default_true")]
    pub use_manifest: bool,
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "openalex").
    #[serde(default = "default_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// How rows are written for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Append for fresh units, merge for units that were attempted before.
    #[default]
    Auto,

    /// Plain bulk append.
    Append,

    /// Replace existing rows sharing the incoming keys, then insert.
    Merge,
}

/// What to do with existing target tables when a fresh run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Drop and recreate target tables.
    DropRecreate,

    /// Truncate existing tables, create if missing.
    Truncate,

    /// Create missing tables and columns, leave existing rows alone.
    #[default]
    Keep,
}

/// Ingestion behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Concurrent work units. Auto-tuned based on CPU cores if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Rows buffered per table before a bulk flush. Auto-tuned based on RAM if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_rows: Option<usize>,

    /// Concurrent writers draining each table's channel. Auto-tuned if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writers_per_table: Option<usize>,

    /// Batches queued per table before the reader blocks. Auto-tuned if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_depth: Option<usize>,

    /// Max target connections. Auto-tuned based on workers if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,

    pub write_mode: WriteMode,

    pub target_mode: TargetMode,

    /// Create tables UNLOGGED and switch them to LOGGED once ingestion completes.
    pub unlogged_tables: bool,

    /// Upper bound on a single batch flush.
    pub flush_timeout_secs: u64,

    /// Fraction of malformed lines that marks a partition corrupt.
    pub max_error_rate: f64,

    /// Lines read before the error rate is checked mid-stream.
    pub error_rate_min_lines: u64,

    /// Retries per unit for transient failures.
    pub max_retries: u32,

    /// Base delay for exponential retry backoff.
    pub retry_backoff_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            workers: None,
            batch_rows: None,
            writers_per_table: None,
            channel_depth: None,
            max_pg_connections: None,
            write_mode: WriteMode::default(),
            target_mode: TargetMode::default(),
            unlogged_tables: false,
            flush_timeout_secs: 300,
            max_error_rate: 0.25,
            error_rate_min_lines: 1_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl LoadConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, between 2 and 32
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 32));

        // Batch rows: base 10K, +10K per 8GB of RAM, cap at 100K
        if self.batch_rows.is_none() {
            let rows = 10_000 + ((ram_gb / 8.0) as usize * 10_000);
            self.batch_rows = Some(rows.clamp(10_000, 100_000));
        }

        if self.writers_per_table.is_none() {
            self.writers_per_table = Some((cores / 8).clamp(1, 4));
        }

        if self.channel_depth.is_none() {
            self.channel_depth = Some(((ram_gb / 8.0) as usize).clamp(2, 8));
        }

        if self.max_pg_connections.is_none() {
            self.max_pg_connections = Some((workers * 2).clamp(4, 64));
        }

        info!(
            "Auto-tuned config: workers={}, batch_rows={}, writers_per_table={}, channel_depth={}, pg_conns={}",
            self.get_workers(),
            self.get_batch_rows(),
            self.get_writers_per_table(),
            self.get_channel_depth(),
            self.get_max_pg_connections(),
        );

        self
    }

    // Effective values, with fallbacks for configs that were never auto-tuned.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_batch_rows(&self) -> usize {
        self.batch_rows.unwrap_or(10_000)
    }

    pub fn get_writers_per_table(&self) -> usize {
        self.writers_per_table.unwrap_or(1)
    }

    pub fn get_channel_depth(&self) -> usize {
        self.channel_depth.unwrap_or(4)
    }

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections.unwrap_or(8)
    }
}

/// Constraint phase configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    /// Statement timeout applied to every constraint DDL statement.
    pub statement_timeout_secs: u64,

    /// Foreign keys validated concurrently.
    pub validation_workers: usize,

    /// Delete orphan rows after writing their manifest.
    pub quarantine_orphans: bool,

    /// Directory for orphan manifests.
    pub manifest_dir: PathBuf,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            statement_timeout_secs: 3_600,
            validation_workers: 4,
            quarantine_orphans: false,
            manifest_dir: PathBuf::from("orphans"),
        }
    }
}

/// Run state storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// JSON file on local disk.
    #[default]
    File,

    /// Table in the target database.
    Database,
}

/// Run state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendKind,

    /// State file path (file backend only).
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::File,
            path: PathBuf::from("load-state.json"),
        }
    }
}

// Default value functions for serde
fn default_kinds() -> Vec<EntityKind> {
    EntityKind::ALL.to_vec()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "openalex".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let resources = SystemResources {
            total_memory_bytes: 64 * 1024 * 1024 * 1024,
            total_memory_gb: 64.0,
            cpu_cores: 16,
        };
        let load = LoadConfig {
            workers: Some(3),
            ..Default::default()
        }
        .with_auto_tuning(&resources);

        assert_eq!(load.get_workers(), 3);
        assert_eq!(load.get_batch_rows(), 90_000);
        assert_eq!(load.get_writers_per_table(), 2);
        assert_eq!(load.get_max_pg_connections(), 6);
    }

    #[test]
    fn test_auto_tuning_small_machine() {
        let resources = SystemResources {
            total_memory_bytes: 2 * 1024 * 1024 * 1024,
            total_memory_gb: 2.0,
            cpu_cores: 2,
        };
        let load = LoadConfig::default().with_auto_tuning(&resources);

        assert_eq!(load.get_workers(), 2);
        assert_eq!(load.get_batch_rows(), 10_000);
        assert_eq!(load.get_writers_per_table(), 1);
        assert_eq!(load.get_channel_depth(), 2);
        assert_eq!(load.get_max_pg_connections(), 4);
    }

    #[test]
    fn test_workers_override_sizes_connection_pool() {
        let resources = SystemResources {
            total_memory_bytes: 64 * 1024 * 1024 * 1024,
            total_memory_gb: 64.0,
            cpu_cores: 16,
        };
        let tuned = LoadConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.get_max_pg_connections(), 28);

        let mut config: Config = serde_yaml::from_str(
            "source:\n  snapshot_root: /data\ntarget:\n  host: h\n  database: d\n  user: u\n",
        )
        .unwrap();
        config = config.with_workers(Some(12));
        config.load = config.load.with_auto_tuning(&resources);
        assert_eq!(config.load.get_workers(), 12);
        assert_eq!(config.load.get_max_pg_connections(), 24);

        let explicit = LoadConfig {
            max_pg_connections: Some(5),
            ..Default::default()
        };
        config.load = explicit;
        config = config.with_workers(Some(12));
        config.load = config.load.with_auto_tuning(&resources);
        assert_eq!(config.load.get_max_pg_connections(), 5);
    }

    #[test]
    fn test_debug_redacts_password() {
        let target = TargetConfig {
            host: "db".into(),
            port: 5432,
            database: "openalex".into(),
            user: "loader".into(),
            password: "hunter2".into(),
            schema: "openalex".into(),
            ssl_mode: "disable".into(),
        };
        let printed = format!("{:?}", target);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
