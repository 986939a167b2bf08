//! Ingestion orchestrator - main workflow coordinator.
//!
//! Owns the run state explicitly: every operation loads it from the state
//! backend, changes it, and saves it after each unit transition.

use crate::config::{Config, SourceConfig, StateBackendKind, TargetMode, WriteMode};
use crate::constraints::ConstraintBuilder;
use crate::error::{LoadError, Result};
use crate::loader::{BulkLoader, FlushMode, LoaderOptions};
use crate::model::EntityKind;
use crate::report::{write_report, IngestReport, StatusReport};
use crate::schema::Catalog;
use crate::source::{discover, WorkUnit};
use crate::state::{
    DbStateBackend, FileStateBackend, MemoryStateBackend, RunState, RunStatus, StateBackend,
    UnitOutcome,
};
use crate::target::{MemoryPool, PgPool, TargetPool};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest wait between retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff: `base`, `2*base`, `4*base`, ... capped at one minute.
pub(crate) fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Ingestion orchestrator.
pub struct Orchestrator {
    config: Arc<Config>,
    catalog: Arc<Catalog>,
    target: Arc<dyn TargetPool>,
    backend: Arc<dyn StateBackend>,
    cancel: CancellationToken,
    dry_run: bool,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub snapshot_root_exists: bool,
    pub kinds_found: Vec<EntityKind>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub state_backend: String,
    pub healthy: bool,
}

/// Open the configured state backend. The database backend shares the
/// target pool.
pub fn open_state_backend(config: &Config, target: Option<&PgPool>) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::File => Ok(Arc::new(FileStateBackend::new(&config.state.path))),
        StateBackendKind::Database => match target {
            Some(pg) => Ok(Arc::new(DbStateBackend::new(pg.pool().clone()))),
            None => Err(LoadError::Config(
                "state.backend=database requires a target connection".to_string(),
            )),
        },
    }
}

impl Orchestrator {
    /// Connect to the target and open the configured state backend.
    pub async fn new(config: Config) -> Result<Self> {
        let max_conns = config.load.get_max_pg_connections();
        let target = PgPool::new(&config.target, max_conns)
            .await?
            .with_statement_timeout(Duration::from_secs(
                config.constraints.statement_timeout_secs,
            ));
        let backend = open_state_backend(&config, Some(&target))?;
        Ok(Self::with_parts(config, Arc::new(target), backend))
    }

    /// Orchestrator over an in-memory store and state. Nothing outside the
    /// process is touched except the snapshot and the report directory.
    pub fn dry_run(config: Config) -> Self {
        let mut orchestrator = Self::with_parts(
            config,
            Arc::new(MemoryPool::new()),
            Arc::new(MemoryStateBackend::new()),
        );
        orchestrator.dry_run = true;
        orchestrator
    }

    /// Orchestrator for `status` and `reset`, which only touch run state.
    /// With the file backend no target connection is opened.
    pub async fn state_only(config: Config) -> Result<Self> {
        match config.state.backend {
            StateBackendKind::File => {
                let backend = open_state_backend(&config, None)?;
                Ok(Self::with_parts(config, Arc::new(MemoryPool::new()), backend))
            }
            StateBackendKind::Database => Self::new(config).await,
        }
    }

    /// Build from explicit parts.
    pub fn with_parts(
        config: Config,
        target: Arc<dyn TargetPool>,
        backend: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog: Arc::new(Catalog::standard()),
            target,
            backend,
            cancel: CancellationToken::new(),
            dry_run: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A constraint builder sharing this orchestrator's target, state and
    /// cancellation.
    pub fn constraint_builder(&self) -> ConstraintBuilder {
        ConstraintBuilder::new(
            self.config.as_ref().clone(),
            self.target.clone(),
            self.backend.clone(),
        )
        .with_cancellation(self.cancel.clone())
    }

    /// Fresh run: discard prior state, discover partitions, prepare tables
    /// and ingest every unit.
    pub async fn start(&self) -> Result<IngestReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting ingestion run {}", run_id);

        self.backend.init_schema().await?;
        self.backend.clear().await?;

        let units = discover(&self.config.source)?;
        let mut state = RunState::new(run_id, self.config.hash());
        for unit in &units {
            state.register_unit(unit);
        }
        info!(
            "Discovered {} partitions ({} kinds)",
            units.len(),
            self.config.source.kinds.len()
        );

        self.prepare_target(&self.config.source.kinds, self.config.load.target_mode)
            .await?;
        self.backend.save(&state).await?;

        self.run_units(&mut state, units).await?;
        self.finish(state, started_at).await
    }

    /// Continue a run from persisted state, re-running only units that did
    /// not complete.
    pub async fn resume(&self, force: bool) -> Result<IngestReport> {
        let started_at = Utc::now();
        self.backend.init_schema().await?;
        let mut state = self.backend.load().await?.ok_or_else(|| {
            LoadError::State("No run state found; use `start` for a fresh run".to_string())
        })?;

        let config_hash = self.config.hash();
        if let Err(e) = state.validate_config(&config_hash) {
            if !force {
                return Err(e);
            }
            warn!("Configuration changed since the run started; continuing because of --force");
            state.config_hash = config_hash;
        }
        info!("Resuming run {} (phase {})", state.run_id, state.phase);

        let kinds: Vec<EntityKind> = {
            let recorded: BTreeSet<EntityKind> = state.units.values().map(|u| u.kind).collect();
            if recorded.is_empty() {
                self.config.source.kinds.clone()
            } else {
                recorded.into_iter().collect()
            }
        };
        let source = SourceConfig {
            kinds: kinds.clone(),
            ..self.config.source.clone()
        };
        let units = discover(&source)?;
        for unit in &units {
            state.register_unit(unit);
        }

        self.prepare_target(&kinds, TargetMode::Keep).await?;
        state.status = RunStatus::Running;
        self.backend.save(&state).await?;

        self.run_units(&mut state, units).await?;
        self.finish(state, started_at).await
    }

    /// Persisted progress, if any run has been started.
    pub async fn status(&self) -> Result<Option<StatusReport>> {
        self.backend.init_schema().await?;
        Ok(self
            .backend
            .load()
            .await?
            .map(|state| StatusReport::from_state(&state, &self.catalog)))
    }

    /// Discard persisted state. Rows already written stay in the target.
    /// Returns whether there was state to discard.
    pub async fn reset(&self) -> Result<bool> {
        self.backend.init_schema().await?;
        let existed = self.backend.load().await?.is_some();
        self.backend.clear().await?;
        if existed {
            info!("Run state cleared ({} backend)", self.backend.backend_type());
        }
        Ok(existed)
    }

    async fn prepare_target(&self, kinds: &[EntityKind], mode: TargetMode) -> Result<()> {
        let schema = &self.config.target.schema;
        self.target.create_schema(schema).await?;
        for kind in kinds {
            for table in self.catalog.tables_for_kind(*kind) {
                self.target
                    .prepare_table(schema, table, mode, self.config.load.unlogged_tables)
                    .await?;
            }
        }
        info!("Target schema {} ready ({:?})", schema, mode);
        Ok(())
    }

    /// Ingest every incomplete unit with at most `workers` in flight,
    /// saving state after each transition.
    async fn run_units(&self, state: &mut RunState, units: Vec<WorkUnit>) -> Result<()> {
        let workers = self.config.load.get_workers().max(1);
        let mut by_partition: BTreeMap<String, WorkUnit> = units
            .into_iter()
            .map(|u| (u.partition.clone(), u))
            .collect();

        let pending = state.incomplete_units();
        if pending.is_empty() {
            info!("No units left to ingest");
            return Ok(());
        }
        info!("Ingesting {} units with {} workers", pending.len(), workers);

        let loader = Arc::new(BulkLoader::new(
            self.target.clone(),
            self.catalog.clone(),
            LoaderOptions::from_config(&self.config),
        ));
        let mut tasks: JoinSet<(String, Result<UnitOutcome>)> = JoinSet::new();

        for partition in pending {
            while tasks.len() >= workers {
                if let Some(joined) = tasks.join_next().await {
                    self.record_unit(state, joined).await?;
                }
            }
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, stopping new units");
                break;
            }

            let unit = match by_partition.remove(&partition) {
                Some(unit) => unit,
                None => match state.unit(&partition) {
                    Some(known) => WorkUnit {
                        kind: known.kind,
                        partition: partition.clone(),
                        path: self.config.source.snapshot_root.join(&partition),
                        bytes: known.bytes,
                        expected_records: known.expected_records,
                        missing: true,
                    },
                    None => continue,
                },
            };

            let previously_attempted = state.was_attempted(&partition);
            state.mark_unit_in_progress(&partition);
            self.backend.save(state).await?;

            let loader = loader.clone();
            let cancel = self.cancel.clone();
            let write_mode = self.config.load.write_mode;
            let max_retries = self.config.load.max_retries;
            let backoff_ms = self.config.load.retry_backoff_ms;
            tasks.spawn(async move {
                let result = load_with_retry(
                    &loader,
                    &unit,
                    write_mode,
                    previously_attempted,
                    max_retries,
                    backoff_ms,
                    &cancel,
                )
                .await;
                (unit.partition, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.record_unit(state, joined).await?;
        }
        Ok(())
    }

    async fn record_unit(
        &self,
        state: &mut RunState,
        joined: std::result::Result<(String, Result<UnitOutcome>), tokio::task::JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((partition, Ok(outcome))) => {
                state.mark_unit_completed(&partition, outcome);
            }
            Ok((partition, Err(LoadError::Cancelled))) => {
                info!("{}: interrupted, left in progress for resume", partition);
            }
            Ok((partition, Err(e))) => {
                error!("{}: failed - {}", partition, e);
                state.mark_unit_failed(&partition, &e.to_string());
            }
            Err(e) => {
                error!("Unit task panicked: {}", e);
            }
        }
        self.backend.save(state).await
    }

    async fn finish(&self, mut state: RunState, started_at: chrono::DateTime<Utc>) -> Result<IngestReport> {
        state.status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if state.ingestion_complete() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        if state.status == RunStatus::Completed {
            if self.config.load.unlogged_tables {
                self.set_tables_logged(&state).await?;
            }
            state.advance_phase(&self.catalog);
        }
        self.backend.save(&state).await?;

        let report = IngestReport::from_state(&state, started_at, self.dry_run);
        write_report(&self.config.report_dir, &report.run_id, "ingest", &report)?;
        info!(
            "Ingestion {}: {}/{} units completed, {} failed, {} records, {} malformed, {} rejected",
            report.status.as_str(),
            report.units_completed,
            report.units_total,
            report.units_failed,
            report.records,
            report.malformed,
            report.rejected
        );
        Ok(report)
    }

    async fn set_tables_logged(&self, state: &RunState) -> Result<()> {
        let kinds: BTreeSet<EntityKind> = state.units.values().map(|u| u.kind).collect();
        for kind in kinds {
            for table in self.catalog.tables_for_kind(kind) {
                self.target
                    .set_table_logged(&self.config.target.schema, &table.name)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Load a unit, retrying transient failures with backoff. Retries (and
/// reruns of previously attempted units in auto mode) merge instead of
/// appending, so rows written by the failed attempt are replaced.
async fn load_with_retry(
    loader: &BulkLoader,
    unit: &WorkUnit,
    write_mode: WriteMode,
    previously_attempted: bool,
    max_retries: u32,
    backoff_ms: u64,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let mut attempt = 0u32;
    loop {
        let mode = match write_mode {
            WriteMode::Append => FlushMode::Append,
            WriteMode::Merge => FlushMode::Merge,
            WriteMode::Auto if previously_attempted || attempt > 0 => FlushMode::Merge,
            WriteMode::Auto => FlushMode::Append,
        };
        let start = Instant::now();
        match loader.load_unit(unit, mode, cancel).await {
            Err(e) if e.is_transient() && attempt < max_retries && !cancel.is_cancelled() => {
                attempt += 1;
                let delay = retry_delay(backoff_ms, attempt);
                warn!(
                    "{}: transient failure after {:?}, retry {}/{} in {:?}: {}",
                    unit.partition,
                    start.elapsed(),
                    attempt,
                    max_retries,
                    delay,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}

/// Check the snapshot, the target and the state backend without changing
/// anything.
pub async fn health_check(config: &Config) -> HealthCheckResult {
    let root = &config.source.snapshot_root;
    let snapshot_root_exists = root.is_dir();
    let kinds_found = config
        .source
        .kinds
        .iter()
        .copied()
        .filter(|k| root.join(k.as_str()).is_dir())
        .collect();

    let start = Instant::now();
    let (target_connected, target_version, target_error) =
        match PgPool::new(&config.target, 1).await {
            Ok(pool) => match pool.health_check().await {
                Ok(version) => (true, Some(version), None),
                Err(e) => (false, None, Some(e.to_string())),
            },
            Err(e) => (false, None, Some(e.to_string())),
        };
    let target_latency_ms = start.elapsed().as_millis() as u64;

    let state_backend = match config.state.backend {
        StateBackendKind::File => format!("file ({})", config.state.path.display()),
        StateBackendKind::Database => "postgres (_snapshot_load.run_state)".to_string(),
    };

    HealthCheckResult {
        snapshot_root_exists,
        kinds_found,
        target_connected,
        target_latency_ms,
        target_version,
        target_error,
        state_backend,
        healthy: snapshot_root_exists && target_connected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadConfig;
    use crate::report::{ItemOutcome, ReportStatus};
    use crate::schema::{WORKS, WORK_REFERENCES};
    use crate::state::Phase;
    use crate::target::ConstraintStatus;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const SCHEMA: &str = "openalex";

    fn test_config(dir: &TempDir) -> Config {
        let yaml = format!(
            r#"
source:
  snapshot_root: {root}/snapshot
  kinds: [works]
target:
  host: localhost
  database: test
  user: test
constraints:
  manifest_dir: {root}/orphans
report_dir: {root}/reports
"#,
            root = dir.path().display()
        );
        let mut config = Config::from_yaml(&yaml).unwrap();
        config.load = LoadConfig {
            workers: Some(2),
            batch_rows: Some(16),
            writers_per_table: Some(2),
            channel_depth: Some(2),
            retry_backoff_ms: 1,
            ..LoadConfig::default()
        };
        config
    }

    fn work_line(i: usize, reference: usize) -> String {
        format!(
            r#"{{"id":"https://openalex.org/W{i}","title":"Paper {i}","publication_year":2020,"referenced_works":["https://openalex.org/W{reference}"]}}"#
        )
    }

    /// Write `works/updated_date=<date>/part_000.gz` with the given lines.
    fn write_partition(dir: &TempDir, date: &str, lines: &[String]) {
        let path = dir
            .path()
            .join("snapshot/works")
            .join(format!("updated_date={}", date));
        std::fs::create_dir_all(&path).unwrap();
        let file = std::fs::File::create(path.join("part_000.gz")).unwrap();
        let mut enc = GzEncoder::new(file, Compression::fast());
        for line in lines {
            writeln!(enc, "{}", line).unwrap();
        }
        enc.finish().unwrap();
    }

    /// Three partitions: 100 records, 50 records plus 5 malformed lines, empty.
    fn write_snapshot(dir: &TempDir) {
        let first: Vec<String> = (1..=100).map(|i| work_line(i, 1)).collect();
        let mut second: Vec<String> = (101..=150).map(|i| work_line(i, 1)).collect();
        for n in 0..5 {
            second.insert(n * 10, "{\"id\": ".to_string());
        }
        write_partition(dir, "2024-01-01", &first);
        write_partition(dir, "2024-01-02", &second);
        write_partition(dir, "2024-01-03", &[]);
    }

    fn orchestrator(
        config: Config,
        pool: Arc<MemoryPool>,
        backend: Arc<MemoryStateBackend>,
    ) -> Orchestrator {
        Orchestrator::with_parts(config, pool, backend)
    }

    #[tokio::test]
    async fn test_start_ingests_every_partition() {
        let dir = TempDir::new().unwrap();
        write_snapshot(&dir);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());

        let report = orch.start().await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.units_total, 3);
        assert_eq!(report.units_completed, 3);
        assert_eq!(report.records, 150);
        assert_eq!(report.malformed, 5);
        assert_eq!(report.rows_per_table[WORKS], 150);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 150);

        let state = backend.load().await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.ingestion_complete());
        assert_eq!(state.phase, Phase::Dedup);

        let reports: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_crash_merges_partial_unit() {
        let dir = TempDir::new().unwrap();
        write_snapshot(&dir);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());
        orch.start().await.unwrap();

        // A crash mid-unit leaves it in progress with its rows already written.
        let partition = "works/updated_date=2024-01-02/part_000.gz";
        let mut state = backend.load().await.unwrap().unwrap();
        state.mark_unit_in_progress(partition);
        state.status = RunStatus::Partial;
        backend.save(&state).await.unwrap();

        let report = orch.resume(false).await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.records, 150);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 150);

        let state = backend.load().await.unwrap().unwrap();
        assert_eq!(state.unit(partition).unwrap().attempts, 3);
        let untouched = state.unit("works/updated_date=2024-01-01/part_000.gz").unwrap();
        assert_eq!(untouched.attempts, 1);
    }

    fn distinct_keys(pool: &MemoryPool, table: &str, columns: usize) -> usize {
        pool.rows(SCHEMA, table)
            .iter()
            .map(|r| format!("{:?}", &r[..columns]))
            .collect::<BTreeSet<_>>()
            .len()
    }

    #[tokio::test]
    async fn test_resume_after_interruption_mid_unit() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (1..=150).map(|i| work_line(i, i + 1000)).collect();
        write_partition(&dir, "2024-03-01", &lines);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());

        // 150 works and 150 references in batches of 16: the fourth flush
        // fails after at least three batches have landed, with no retry left.
        let mut config = test_config(&dir);
        config.load.max_retries = 0;
        pool.interrupt_after_writes(3);
        let orch = orchestrator(config, pool.clone(), backend.clone());
        let report = orch.start().await.unwrap();
        assert_eq!(report.status, ReportStatus::Partial);
        assert_eq!(report.units_failed, 1);

        let written = pool.row_count(SCHEMA, WORKS).await.unwrap()
            + pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap();
        assert!((48..300).contains(&written), "{} rows written", written);

        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());
        let report = orch.resume(false).await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.records, 150);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 150);
        assert_eq!(distinct_keys(&pool, WORKS, 1), 150);
        assert_eq!(distinct_keys(&pool, WORK_REFERENCES, 2), 150);
    }

    #[tokio::test]
    async fn test_retry_after_interruption_mid_unit_merges() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (1..=150).map(|i| work_line(i, i + 1000)).collect();
        write_partition(&dir, "2024-03-01", &lines);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());

        pool.interrupt_after_writes(5);
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());
        let report = orch.start().await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 150);
        assert_eq!(distinct_keys(&pool, WORK_REFERENCES, 2), 150);
    }

    #[tokio::test]
    async fn test_status_and_reset_on_uninitialized_storage() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::with_parts(
            test_config(&dir),
            Arc::new(MemoryPool::new()),
            Arc::new(MemoryStateBackend::requiring_schema()),
        );
        assert!(orch.status().await.unwrap().is_none());

        let orch = Orchestrator::with_parts(
            test_config(&dir),
            Arc::new(MemoryPool::new()),
            Arc::new(MemoryStateBackend::requiring_schema()),
        );
        assert!(!orch.reset().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_start_resumes_to_completion() {
        let dir = TempDir::new().unwrap();
        write_snapshot(&dir);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone())
            .with_cancellation(cancel);
        let report = orch.start().await.unwrap();
        assert_eq!(report.status, ReportStatus::Cancelled);
        assert_eq!(report.units_unfinished, 3);

        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());
        let report = orch.resume(false).await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.records, 150);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        write_snapshot(&dir);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());
        pool.inject_transient_failures(1);
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());

        let report = orch.start().await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.units_failed, 0);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 150);

        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 150);
        let state = backend.load().await.unwrap().unwrap();
        assert!(state.ingestion_complete());
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_config_unless_forced() {
        let dir = TempDir::new().unwrap();
        write_snapshot(&dir);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());
        orchestrator(test_config(&dir), pool.clone(), backend.clone())
            .start()
            .await
            .unwrap();

        let mut changed = test_config(&dir);
        changed.target.database = "elsewhere".to_string();
        let orch = orchestrator(changed, pool.clone(), backend.clone());
        assert!(matches!(orch.resume(false).await, Err(LoadError::ConfigChanged)));
        let report = orch.resume(true).await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_without_state_is_state_error() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            test_config(&dir),
            Arc::new(MemoryPool::new()),
            Arc::new(MemoryStateBackend::new()),
        );
        let err = orch.resume(false).await.unwrap_err();
        assert!(matches!(err, LoadError::State(_)));
        assert!(!orch.reset().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_snapshot_root() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            test_config(&dir),
            Arc::new(MemoryPool::new()),
            Arc::new(MemoryStateBackend::new()),
        );
        let err = orch.start().await.unwrap_err();
        assert!(matches!(err, LoadError::MissingPartitionRoot(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG_ERROR);
    }

    #[tokio::test]
    async fn test_ingest_then_constraints_with_orphans() {
        let dir = TempDir::new().unwrap();
        // Every work cites W0, which is not in the snapshot.
        let lines: Vec<String> = (1..=1000).map(|i| work_line(i, 0)).collect();
        write_partition(&dir, "2024-02-01", &lines);
        let pool = Arc::new(MemoryPool::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let orch = orchestrator(test_config(&dir), pool.clone(), backend.clone());
        orch.start().await.unwrap();

        let fk = "fk_work_references_referenced_work_id";
        let builder = orch.constraint_builder();
        let reports = builder.run_all(&[], false).await.unwrap();
        let orphans = reports.iter().find(|r| r.phase == Phase::Orphans).unwrap();
        assert_eq!(orphans.orphans[fk], 1000);
        assert_eq!(orphans.rows_quarantined, 0);
        let validation = reports.iter().find(|r| r.phase == Phase::Validation).unwrap();
        assert_eq!(validation.validation[fk], ConstraintStatus::ValidationFailed);
        assert_eq!(validation.status, ReportStatus::Partial);

        let manifest =
            std::fs::read_to_string(dir.path().join("orphans").join(format!("{}.csv", fk)))
                .unwrap();
        assert_eq!(manifest.lines().count(), 1001);

        let report = builder.run_phase(Phase::Orphans, &[], true).await.unwrap();
        assert_eq!(report.rows_quarantined, 1000);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 0);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 1000);

        let report = builder.run_phase(Phase::Validation, &[], false).await.unwrap();
        assert_eq!(report.validation[fk], ConstraintStatus::Validated);
        assert_eq!(report.count(ItemOutcome::Failed), 0);
    }

    #[test]
    fn test_retry_delay_backoff() {
        assert_eq!(retry_delay(500, 1), Duration::from_millis(500));
        assert_eq!(retry_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(retry_delay(500, 3), Duration::from_millis(2000));
        assert_eq!(retry_delay(500, 30), MAX_RETRY_DELAY);
    }
}
