//! # snapshot-pg-load
//!
//! Resumable ingestion of a partitioned scholarly-graph snapshot into
//! PostgreSQL, followed by deferred constraint building.
//!
//! - **Streaming decode** of gzip JSON-lines partitions, one work unit each
//! - **Extract once, write many**: one record fans out into every table of
//!   its kind
//! - **Bulk COPY** with per-row fallback and idempotent merge for reruns
//! - **Resume** from a signed state file or table
//! - **Constraint phases**: dedup, primary keys, indexes, `NOT VALID` foreign
//!   keys, orphan manifests with optional quarantine, validation
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapshot_pg_load::{Config, Orchestrator, Phase};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let report = orchestrator.start().await?;
//!     println!("Loaded {} records", report.records);
//!
//!     let builder = orchestrator.constraint_builder();
//!     builder.run_phase(Phase::Dedup, &[], false).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constraints;
pub mod error;
pub mod extract;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod schema;
pub mod source;
pub mod state;
pub mod target;

// Re-exports for convenient access
pub use config::{Config, LoadConfig, SourceConfig, TargetConfig, TargetMode, WriteMode};
pub use constraints::ConstraintBuilder;
pub use error::{LoadError, Result};
pub use model::{EntityKind, Record};
pub use orchestrator::{health_check, HealthCheckResult, Orchestrator};
pub use report::{IngestReport, PhaseReport, ReportStatus, StatusReport};
pub use schema::Catalog;
pub use state::{Phase, RunState, StateBackend};
pub use target::{MemoryPool, PgPool, SqlValue, TargetPool};
