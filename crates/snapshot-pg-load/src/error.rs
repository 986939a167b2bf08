//! Error types for the snapshot loader.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes. Automation distinguishes a resumable partial run (2)
/// from configuration problems (1) and infrastructure failures (3, 4, 7).
pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_PARTIAL: u8 = 2;
pub const EXIT_TARGET_ERROR: u8 = 3;
pub const EXIT_STATE_ERROR: u8 = 4;
pub const EXIT_IO_ERROR: u8 = 7;
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for load and constraint operations.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration error (invalid YAML, missing fields, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot root directory does not exist
    #[error("Snapshot root not found: {}", .0.display())]
    MissingPartitionRoot(PathBuf),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A flush or DDL statement exceeded its time limit
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Decompression failed, or too many lines in a partition were malformed
    #[error("Partition {partition} is corrupt: {message}")]
    CorruptPartition { partition: String, message: String },

    /// Bulk write failed for a specific table
    #[error("Write failed for table {table}: {message}")]
    Write { table: String, message: String },

    /// Primary key cannot be created while duplicate groups remain
    #[error("Table {table} has {groups} duplicate key groups")]
    DuplicateKeys { table: String, groups: i64 },

    /// A key column holds NULLs, so no primary key can ever be created
    #[error("Table {table} has {rows} rows with NULL key columns ({columns})")]
    NullableKey {
        table: String,
        columns: String,
        rows: i64,
    },

    /// A phase prerequisite is not yet satisfied
    #[error("Phase {phase} cannot run for {item}: {reason}")]
    PhaseGate {
        phase: String,
        item: String,
        reason: String,
    },

    /// State storage error
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use --force to continue anyway.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Orphan manifest write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Run was cancelled (SIGINT, SIGTERM)
    #[error("Run cancelled")]
    Cancelled,
}

impl LoadError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        LoadError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        LoadError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a CorruptPartition error
    pub fn corrupt(partition: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::CorruptPartition {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// Connection loss, pool exhaustion, timeouts, serialization failures and
    /// deadlocks are transient. Data errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LoadError::Pool { .. } | LoadError::Timeout { .. } => true,
            LoadError::Target(e) => {
                if e.is_closed() {
                    return true;
                }
                match e.code() {
                    // No SQLSTATE means the failure happened below the protocol layer.
                    None => true,
                    Some(code) => {
                        let code = code.code();
                        code.starts_with("08")
                            || code == "40001"
                            || code == "40P01"
                            || code == "53300"
                            || code == "57P01"
                            || code == "57P03"
                    }
                }
            }
            _ => false,
        }
    }

    /// Whether the same work will keep failing until the schema or
    /// configuration changes, so resuming cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::NullableKey { .. } | LoadError::Config(_))
    }

    /// Map this error to the process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            LoadError::Config(_)
            | LoadError::Yaml(_)
            | LoadError::MissingPartitionRoot(_)
            | LoadError::ConfigChanged
            | LoadError::NullableKey { .. } => EXIT_CONFIG_ERROR,
            LoadError::DuplicateKeys { .. } | LoadError::PhaseGate { .. } => EXIT_PARTIAL,
            LoadError::Target(_)
            | LoadError::Pool { .. }
            | LoadError::Timeout { .. }
            | LoadError::Write { .. } => EXIT_TARGET_ERROR,
            LoadError::State(_) | LoadError::Json(_) => EXIT_STATE_ERROR,
            LoadError::Io(_) | LoadError::Csv(_) | LoadError::CorruptPartition { .. } => {
                EXIT_IO_ERROR
            }
            LoadError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_partial_from_config() {
        assert_eq!(LoadError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            LoadError::MissingPartitionRoot(PathBuf::from("/nope")).exit_code(),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(
            LoadError::DuplicateKeys {
                table: "works".into(),
                groups: 2
            }
            .exit_code(),
            EXIT_PARTIAL
        );
        assert_eq!(LoadError::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(LoadError::State("bad".into()).exit_code(), EXIT_STATE_ERROR);
    }

    #[test]
    fn test_fatal_classification() {
        let null_key = LoadError::NullableKey {
            table: "authors".into(),
            columns: "id".into(),
            rows: 3,
        };
        assert!(null_key.is_fatal());
        assert_eq!(null_key.exit_code(), EXIT_CONFIG_ERROR);
        assert!(!LoadError::DuplicateKeys {
            table: "works".into(),
            groups: 1
        }
        .is_fatal());
        assert!(!LoadError::timeout("index creation", 30).is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(LoadError::timeout("flush works", 300).is_transient());
        assert!(LoadError::pool("exhausted", "copy").is_transient());
        assert!(!LoadError::write("works", "bad row").is_transient());
        assert!(!LoadError::corrupt("works/part_000.gz", "crc mismatch").is_transient());
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = LoadError::write("authorship", "COPY rejected");
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Write failed for table authorship"));
    }
}
