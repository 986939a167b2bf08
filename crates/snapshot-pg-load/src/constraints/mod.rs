//! Deferred constraint building.
//!
//! Tables are loaded without keys, indexes or foreign keys. The builder adds
//! them afterwards in six resumable phases:
//!
//! 1. `dedup`: keep the earliest physical row of every key group
//! 2. `keys`: primary keys, after a live check for NULL keys and duplicates
//! 3. `indexes`: foreign-key columns and query-pattern columns
//! 4. `foreign_keys`: created `NOT VALID`, so existing rows are not checked
//! 5. `orphans`: anti-join each relationship into a CSV manifest, optionally
//!    deleting the orphaned rows
//! 6. `validation`: `VALIDATE CONSTRAINT`; failures are recorded, not fatal
//!
//! Every phase accepts a scope (a subset of tables) and records per-item
//! progress in the run state after each item. Each write is a
//! read-modify-write through [`StateBackend::update`], so runs over disjoint
//! scopes in separate processes keep each other's progress.

mod locks;
mod manifest;

pub use locks::TableLocks;
pub use manifest::OrphanManifest;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{LoadError, Result};
use crate::orchestrator::retry_delay;
use crate::report::{write_report, ItemOutcome, PhaseReport, StatusReport};
use crate::schema::{Catalog, ForeignKey, Table};
use crate::state::{Phase, RunState, StateBackend, CONSTRAINT_PHASES};
use crate::target::{orphan_columns, ConstraintStatus, TargetPool, ValidationOutcome};

/// Slack added to the statement timeout before the client gives up on its own.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// One table or relationship scheduled in a phase.
#[derive(Debug, Clone)]
enum WorkItem {
    Table(Table),
    Relationship { table: Table, fk: ForeignKey },
}

impl WorkItem {
    fn name(&self) -> &str {
        match self {
            WorkItem::Table(t) => &t.name,
            WorkItem::Relationship { fk, .. } => &fk.name,
        }
    }

    fn table(&self) -> &str {
        match self {
            WorkItem::Table(t) => &t.name,
            WorkItem::Relationship { table, .. } => &table.name,
        }
    }
}

/// What a finished item produced.
#[derive(Debug)]
enum ItemResult {
    Dedup { groups: u64, deleted: u64 },
    Key { created: bool },
    Indexes { created: u64 },
    ForeignKey { status: ConstraintStatus, created: bool },
    Orphans { count: u64, manifest: Option<PathBuf>, quarantined: u64 },
    Validation { status: ConstraintStatus, message: Option<String> },
}

/// Shared by all item tasks of a phase run.
struct ItemContext {
    schema: String,
    target: Arc<dyn TargetPool>,
    locks: Arc<TableLocks>,
    guard: Duration,
    manifest_dir: PathBuf,
    quarantine: bool,
    max_retries: u32,
    retry_backoff_ms: u64,
    cancel: CancellationToken,
}

impl ItemContext {
    /// Run one store call under the client-side timeout guard.
    async fn guarded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LoadError::Cancelled),
            res = tokio::time::timeout(self.guard, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(LoadError::timeout(operation, self.guard.as_secs())),
            },
        }
    }

    async fn run(&self, phase: Phase, item: &WorkItem) -> Result<ItemResult> {
        let mut attempt = 0u32;
        loop {
            match self.run_once(phase, item).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.retry_backoff_ms, attempt);
                    warn!(
                        "{} {}: transient failure, retry {}/{} in {:?}: {}",
                        phase,
                        item.name(),
                        attempt,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(LoadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn run_once(&self, phase: Phase, item: &WorkItem) -> Result<ItemResult> {
        match (phase, item) {
            (Phase::Dedup, WorkItem::Table(table)) => self.dedup(table).await,
            (Phase::Keys, WorkItem::Table(table)) => self.primary_key(table).await,
            (Phase::Indexes, WorkItem::Table(table)) => self.indexes(table).await,
            (Phase::ForeignKeys, WorkItem::Relationship { fk, .. }) => self.foreign_key(fk).await,
            (Phase::Orphans, WorkItem::Relationship { table, fk }) => {
                self.orphans(table, fk).await
            }
            (Phase::Validation, WorkItem::Relationship { fk, .. }) => self.validate(fk).await,
            _ => Err(LoadError::Config(format!(
                "{} is not a valid item for phase {}",
                item.name(),
                phase
            ))),
        }
    }

    async fn dedup(&self, table: &Table) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[table.name.as_str()]).await;
        let target = &self.target;

        if self
            .guarded("primary key lookup", target.has_primary_key(&self.schema, &table.name))
            .await?
        {
            debug!("{}: primary key present, no duplicates possible", table.name);
            return Ok(ItemResult::Dedup {
                groups: 0,
                deleted: 0,
            });
        }

        let groups = self
            .guarded(
                "duplicate detection",
                target.count_duplicate_groups(&self.schema, table),
            )
            .await?;
        if groups == 0 {
            return Ok(ItemResult::Dedup {
                groups: 0,
                deleted: 0,
            });
        }

        let deleted = self
            .guarded("duplicate elimination", target.delete_duplicates(&self.schema, table))
            .await?;
        info!(
            "{}: removed {} rows from {} duplicate key groups",
            table.name, deleted, groups
        );
        Ok(ItemResult::Dedup {
            groups: groups as u64,
            deleted,
        })
    }

    async fn primary_key(&self, table: &Table) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[table.name.as_str()]).await;
        let target = &self.target;

        if self
            .guarded("primary key lookup", target.has_primary_key(&self.schema, &table.name))
            .await?
        {
            return Ok(ItemResult::Key { created: false });
        }

        let nulls = self
            .guarded("null key check", target.count_null_keys(&self.schema, table))
            .await?;
        if nulls > 0 {
            return Err(LoadError::NullableKey {
                table: table.name.clone(),
                columns: table.primary_key.join(", "),
                rows: nulls,
            });
        }

        let groups = self
            .guarded(
                "duplicate detection",
                target.count_duplicate_groups(&self.schema, table),
            )
            .await?;
        if groups > 0 {
            return Err(LoadError::DuplicateKeys {
                table: table.name.clone(),
                groups,
            });
        }

        self.guarded("primary key creation", target.add_primary_key(&self.schema, table))
            .await?;
        info!(
            "{}: primary key ({}) created",
            table.name,
            table.primary_key.join(", ")
        );
        Ok(ItemResult::Key { created: true })
    }

    async fn indexes(&self, table: &Table) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[table.name.as_str()]).await;
        let mut created = 0u64;
        for index in &table.indexes {
            self.guarded(
                "index creation",
                self.target.create_index(&self.schema, table, index),
            )
            .await?;
            debug!("{}: index {} ready", table.name, index.name);
            created += 1;
        }
        info!("{}: {} indexes ready", table.name, created);
        Ok(ItemResult::Indexes { created })
    }

    async fn foreign_key(&self, fk: &ForeignKey) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[fk.table.as_str(), fk.ref_table.as_str()]).await;
        let status = self
            .guarded(
                "constraint lookup",
                self.target.constraint_status(&self.schema, fk),
            )
            .await?;
        if status != ConstraintStatus::Absent {
            return Ok(ItemResult::ForeignKey {
                status,
                created: false,
            });
        }

        self.guarded(
            "foreign key creation",
            self.target.add_foreign_key(&self.schema, fk),
        )
        .await?;
        info!(
            "{}: {}.{} -> {}.{} created NOT VALID",
            fk.name, fk.table, fk.column, fk.ref_table, fk.ref_column
        );
        Ok(ItemResult::ForeignKey {
            status: ConstraintStatus::CreatedUnvalidated,
            created: true,
        })
    }

    async fn orphans(&self, table: &Table, fk: &ForeignKey) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[fk.table.as_str()]).await;

        let columns = orphan_columns(table, fk);
        // Dropped unfinished on error, which removes the partial file.
        let mut manifest = OrphanManifest::create(&self.manifest_dir, &fk.name, &columns)?;
        let count = self
            .guarded(
                "orphan analysis",
                self.target
                    .export_orphans(&self.schema, table, fk, &mut manifest),
            )
            .await?;
        let manifest = manifest.finish()?;

        if count == 0 {
            info!("{}: no orphaned rows", fk.name);
            return Ok(ItemResult::Orphans {
                count,
                manifest,
                quarantined: 0,
            });
        }

        warn!(
            "{}: {} rows in {} reference a missing {} row",
            fk.name, count, fk.table, fk.ref_table
        );

        let quarantined = if self.quarantine {
            let deleted = self
                .guarded(
                    "orphan quarantine",
                    self.target.delete_orphans(&self.schema, fk),
                )
                .await?;
            warn!("{}: quarantined {} orphaned rows from {}", fk.name, deleted, fk.table);
            deleted
        } else {
            0
        };

        Ok(ItemResult::Orphans {
            count,
            manifest,
            quarantined,
        })
    }

    async fn validate(&self, fk: &ForeignKey) -> Result<ItemResult> {
        let _guards = self.locks.acquire(&[fk.table.as_str()]).await;
        let status = self
            .guarded(
                "constraint lookup",
                self.target.constraint_status(&self.schema, fk),
            )
            .await?;
        match status {
            ConstraintStatus::Absent => {
                return Err(LoadError::PhaseGate {
                    phase: Phase::Validation.to_string(),
                    item: fk.name.clone(),
                    reason: "foreign key does not exist".to_string(),
                })
            }
            ConstraintStatus::Validated => {
                return Ok(ItemResult::Validation {
                    status,
                    message: None,
                })
            }
            _ => {}
        }

        let outcome = self
            .guarded(
                "foreign key validation",
                self.target.validate_foreign_key(&self.schema, fk),
            )
            .await?;
        match outcome {
            ValidationOutcome::Validated => {
                info!("{}: validated", fk.name);
                Ok(ItemResult::Validation {
                    status: ConstraintStatus::Validated,
                    message: None,
                })
            }
            ValidationOutcome::Violated(message) => {
                warn!("{}: validation failed: {}", fk.name, message);
                Ok(ItemResult::Validation {
                    status: ConstraintStatus::ValidationFailed,
                    message: Some(message),
                })
            }
        }
    }
}

/// Runs constraint phases against the target and records their progress.
pub struct ConstraintBuilder {
    config: Arc<Config>,
    catalog: Arc<Catalog>,
    target: Arc<dyn TargetPool>,
    backend: Arc<dyn StateBackend>,
    locks: Arc<TableLocks>,
    cancel: CancellationToken,
}

impl ConstraintBuilder {
    pub fn new(
        config: Config,
        target: Arc<dyn TargetPool>,
        backend: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog: Arc::new(Catalog::standard()),
            target,
            backend,
            locks: Arc::new(TableLocks::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The stored run state, or a new one for a target loaded elsewhere.
    fn adopt(&self, stored: Option<RunState>) -> Result<RunState> {
        let config_hash = self.config.hash();
        match stored {
            Some(state) => {
                state.validate_config(&config_hash)?;
                Ok(state)
            }
            None => {
                info!("No run state found, tracking constraint progress in a new one");
                let mut state = RunState::new(uuid::Uuid::new_v4().to_string(), config_hash);
                state.advance_phase(&self.catalog);
                Ok(state)
            }
        }
    }

    /// Items of a phase restricted to the scope.
    fn items(&self, phase: Phase, scope: &[&Table]) -> Vec<WorkItem> {
        if phase.is_table_phase() {
            scope.iter().map(|t| WorkItem::Table((*t).clone())).collect()
        } else {
            scope
                .iter()
                .flat_map(|t| {
                    t.foreign_keys.iter().map(move |fk| WorkItem::Relationship {
                        table: (*t).clone(),
                        fk: fk.clone(),
                    })
                })
                .collect()
        }
    }

    /// Whether an item finished earlier can be skipped this time.
    fn already_done(&self, state: &RunState, phase: Phase, item: &WorkItem, quarantine: bool) -> bool {
        if !state.is_item_complete(phase, item.name()) {
            return false;
        }
        match phase {
            // A failed validation is terminal but worth retrying after quarantine.
            Phase::Validation => {
                state.constraint_status(item.name()) != ConstraintStatus::ValidationFailed
            }
            // Orphans found by an analysis-only run can still be quarantined.
            Phase::Orphans if quarantine => state
                .constraint(item.name())
                .map(|c| c.orphans.unwrap_or(0) == c.quarantined)
                .unwrap_or(true),
            _ => true,
        }
    }

    /// Why an item cannot run yet, if it can't.
    async fn gate(&self, state: &RunState, phase: Phase, item: &WorkItem) -> Result<Option<String>> {
        if !state.ingestion_complete() {
            return Ok(Some("ingestion is not complete".to_string()));
        }
        let schema = &self.config.target.schema;
        match (phase, item) {
            (Phase::Dedup | Phase::Keys, _) => Ok(None),
            (Phase::Indexes, WorkItem::Table(table)) => {
                if state.is_item_complete(Phase::Keys, &table.name)
                    || self.target.has_primary_key(schema, &table.name).await?
                {
                    Ok(None)
                } else {
                    Ok(Some(format!("primary key for {} not created", table.name)))
                }
            }
            (Phase::ForeignKeys, WorkItem::Relationship { fk, .. }) => {
                let missing: Vec<&str> = [fk.table.as_str(), fk.ref_table.as_str()]
                    .into_iter()
                    .filter(|t| !state.is_item_complete(Phase::Indexes, t))
                    .collect();
                if missing.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(format!("indexes not complete for {}", missing.join(", "))))
                }
            }
            (Phase::Orphans | Phase::Validation, WorkItem::Relationship { fk, .. }) => {
                if state.is_item_complete(Phase::ForeignKeys, &fk.name)
                    || state.constraint_status(&fk.name) != ConstraintStatus::Absent
                    || self.target.constraint_status(schema, fk).await? != ConstraintStatus::Absent
                {
                    Ok(None)
                } else {
                    Ok(Some(format!("foreign key {} not created", fk.name)))
                }
            }
            _ => Ok(Some(format!("not part of phase {}", phase))),
        }
    }

    /// Run one phase for the tables in `scope` (empty means all tables).
    pub async fn run_phase(
        &self,
        phase: Phase,
        scope: &[String],
        quarantine: bool,
    ) -> Result<PhaseReport> {
        if !phase.is_constraint_phase() {
            return Err(LoadError::Config(format!(
                "{} is not a constraint phase",
                phase
            )));
        }
        let tables = self.catalog.resolve_scope(scope)?;
        let scope_names: Vec<String> = if scope.is_empty() {
            Vec::new()
        } else {
            tables.iter().map(|t| t.name.clone()).collect()
        };
        let quarantine = quarantine || self.config.constraints.quarantine_orphans;

        self.backend.init_schema().await?;
        let mut state = self
            .backend
            .update(Box::new(|stored| self.adopt(stored)))
            .await?;
        let mut report = PhaseReport::new(&state.run_id, phase, scope_names);

        info!(
            "Phase {}: {} tables in scope{}",
            phase,
            tables.len(),
            if quarantine && phase == Phase::Orphans {
                ", quarantine enabled"
            } else {
                ""
            }
        );

        let ctx = Arc::new(ItemContext {
            schema: self.config.target.schema.clone(),
            target: self.target.clone(),
            locks: self.locks.clone(),
            guard: Duration::from_secs(self.config.constraints.statement_timeout_secs)
                + TIMEOUT_GRACE,
            manifest_dir: self.config.constraints.manifest_dir.clone(),
            quarantine,
            max_retries: self.config.load.max_retries,
            retry_backoff_ms: self.config.load.retry_backoff_ms,
            cancel: self.cancel.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(
            self.config.constraints.validation_workers.max(1),
        ));
        let mut tasks: JoinSet<(WorkItem, Result<ItemResult>)> = JoinSet::new();

        for item in self.items(phase, &tables) {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, not scheduling further {} work", phase);
                break;
            }
            if self.already_done(&state, phase, &item, quarantine) {
                report.push(item.name(), item.table(), ItemOutcome::Skipped, None);
                continue;
            }
            if let Some(reason) = self.gate(&state, phase, &item).await? {
                let gate = LoadError::PhaseGate {
                    phase: phase.to_string(),
                    item: item.name().to_string(),
                    reason,
                };
                warn!("{}", gate);
                let message = gate.to_string();
                state = self
                    .backend
                    .update(Box::new(|stored| {
                        let mut state = self.adopt(stored)?;
                        state.fail_item(phase, item.name(), &message);
                        Ok(state)
                    }))
                    .await?;
                report.push(item.name(), item.table(), ItemOutcome::Gated, Some(message));
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| LoadError::Cancelled)?;
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let result = ctx.run(phase, &item).await;
                drop(permit);
                (item, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (item, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("{} task panicked: {}", phase, e);
                    report.push("unknown", "unknown", ItemOutcome::Failed, Some(e.to_string()));
                    continue;
                }
            };
            self.backend
                .update(Box::new(|stored| {
                    let mut state = self.adopt(stored)?;
                    apply_result(&mut state, phase, &item, &result);
                    Ok(state)
                }))
                .await?;
            report_result(&mut report, phase, &item, result);
        }

        self.backend
            .update(Box::new(|stored| {
                let mut state = self.adopt(stored)?;
                state.advance_phase(&self.catalog);
                Ok(state)
            }))
            .await?;

        report.finish(self.cancel.is_cancelled());
        write_report(&self.config.report_dir, &report.run_id, &report.name(), &report)?;
        info!(
            "Phase {} {}: {} done, {} skipped, {} gated, {} failed",
            phase,
            report.status.as_str(),
            report.count(ItemOutcome::Done),
            report.count(ItemOutcome::Skipped),
            report.count(ItemOutcome::Gated),
            report.count(ItemOutcome::Failed)
        );
        Ok(report)
    }

    /// Run every constraint phase in order. Later phases gate on earlier
    /// ones per table, so a partial phase does not stop the rest.
    pub async fn run_all(&self, scope: &[String], quarantine: bool) -> Result<Vec<PhaseReport>> {
        let mut reports = Vec::new();
        for phase in CONSTRAINT_PHASES {
            let report = self.run_phase(phase, scope, quarantine).await?;
            reports.push(report);
            if self.cancel.is_cancelled() {
                break;
            }
        }
        Ok(reports)
    }

    /// Forget a phase's progress so its next run starts over.
    pub async fn reset_phase(&self, phase: Phase) -> Result<()> {
        if !phase.is_constraint_phase() {
            return Err(LoadError::Config(format!(
                "{} is not a constraint phase",
                phase
            )));
        }
        self.backend.init_schema().await?;
        let state = self
            .backend
            .update(Box::new(|stored: Option<RunState>| match stored {
                Some(mut state) => {
                    state.reset_phase(phase);
                    Ok(state)
                }
                None => Err(LoadError::State("No run state to reset".to_string())),
            }))
            .await?;
        info!("Phase {} reset; global phase is now {}", phase, state.phase);
        Ok(())
    }

    pub async fn status(&self) -> Result<Option<StatusReport>> {
        self.backend.init_schema().await?;
        Ok(self
            .backend
            .load()
            .await?
            .map(|state| StatusReport::from_state(&state, &self.catalog)))
    }
}

/// Record an item's result in the run state.
fn apply_result(state: &mut RunState, phase: Phase, item: &WorkItem, result: &Result<ItemResult>) {
    let name = item.name();
    let table = item.table();

    let result = match result {
        Ok(result) => result,
        Err(LoadError::Cancelled) => return,
        Err(e) => {
            state.fail_item(phase, name, &e.to_string());
            if matches!(phase, Phase::ForeignKeys | Phase::Orphans | Phase::Validation) {
                state.constraint_mut(name, table).error = Some(e.to_string());
            }
            return;
        }
    };

    match result {
        ItemResult::Dedup { .. } | ItemResult::Key { .. } | ItemResult::Indexes { .. } => {}
        ItemResult::ForeignKey { status, .. } => {
            let c = state.constraint_mut(name, table);
            c.status = *status;
            c.error = None;
        }
        ItemResult::Orphans {
            count, quarantined, ..
        } => {
            let c = state.constraint_mut(name, table);
            c.orphans = Some(*count);
            c.quarantined = *quarantined;
            c.error = None;
        }
        ItemResult::Validation { status, message } => {
            let c = state.constraint_mut(name, table);
            c.status = *status;
            c.error = message.clone();
        }
    }
    state.complete_item(phase, name);
}

/// Add an item's result to the phase report.
fn report_result(report: &mut PhaseReport, phase: Phase, item: &WorkItem, result: Result<ItemResult>) {
    let name = item.name();
    let table = item.table();

    let result = match result {
        Ok(result) => result,
        Err(LoadError::Cancelled) => {
            report.push(name, table, ItemOutcome::Failed, Some("cancelled".to_string()));
            return;
        }
        Err(e) => {
            error!("{} {}: {}", phase, name, e);
            if phase == Phase::Keys {
                report.key_failures.insert(name.to_string(), e.to_string());
            }
            report.push_failure(name, table, &e);
            return;
        }
    };

    let detail = match result {
        ItemResult::Dedup { groups, deleted } => {
            report.duplicate_groups += groups;
            report.rows_deduplicated += deleted;
            (deleted > 0).then(|| format!("{} rows removed from {} groups", deleted, groups))
        }
        ItemResult::Key { created } => (!created).then(|| "already present".to_string()),
        ItemResult::Indexes { created } => {
            report.indexes_created += created;
            None
        }
        ItemResult::ForeignKey { status, created } => {
            if created {
                report.constraints_created.push(name.to_string());
                None
            } else {
                Some(format!("already present ({})", status))
            }
        }
        ItemResult::Orphans {
            count,
            manifest,
            quarantined,
        } => {
            report.orphans.insert(name.to_string(), count);
            report.rows_quarantined += quarantined;
            let detail = manifest
                .as_ref()
                .map(|p| format!("{} orphans listed in {}", count, p.display()));
            report.manifests.extend(manifest);
            detail
        }
        ItemResult::Validation { status, message } => {
            report.validation.insert(name.to_string(), status);
            message
        }
    };
    report.push(name, table, ItemOutcome::Done, detail);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadConfig, TargetMode};
    use crate::report::{overall_status, ReportStatus};
    use crate::schema::{AUTHORS, AUTHORSHIP, WORKS};
    use crate::state::{FileStateBackend, MemoryStateBackend};
    use crate::target::{MemoryPool, SqlValue};
    use tempfile::TempDir;

    const SCHEMA: &str = "openalex";

    fn test_config(dir: &TempDir) -> Config {
        let yaml = format!(
            r#"
source:
  snapshot_root: {root}
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
            retry_backoff_ms: 1,
            ..LoadConfig::default()
        };
        config
    }

    async fn prepared_pool(catalog: &Catalog) -> Arc<MemoryPool> {
        let pool = Arc::new(MemoryPool::new());
        pool.create_schema(SCHEMA).await.unwrap();
        for table in catalog.tables() {
            pool.prepare_table(SCHEMA, table, TargetMode::Keep, false)
                .await
                .unwrap();
        }
        pool
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    fn authorship_row(work: &str, author: &str, position: i32) -> Vec<SqlValue> {
        vec![
            text(work),
            text(author),
            SqlValue::I32(position),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
        ]
    }

    fn author_row(author: &str) -> Vec<SqlValue> {
        let mut row = vec![text(author)];
        row.resize(7, SqlValue::Null);
        row
    }

    fn work_row(work: &str) -> Vec<SqlValue> {
        let mut row = vec![text(work)];
        row.resize(11, SqlValue::Null);
        row
    }

    fn builder(config: Config, pool: Arc<MemoryPool>) -> ConstraintBuilder {
        ConstraintBuilder::new(config, pool, Arc::new(MemoryStateBackend::new()))
    }

    #[tokio::test]
    async fn test_keys_fail_with_duplicate_group_count_until_dedup() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;

        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(authorship_row(&format!("W{}", i), "A1", 0));
        }
        rows.push(authorship_row("W1", "A1", 0));
        rows.push(authorship_row("W2", "A1", 0));
        pool.seed_rows(SCHEMA, AUTHORSHIP, rows);

        let builder = builder(test_config(&dir), pool.clone());
        let scope = vec![AUTHORSHIP.to_string()];

        let report = builder.run_phase(Phase::Keys, &scope, false).await.unwrap();
        assert_eq!(report.status.as_str(), "partial");
        let failure = &report.key_failures[AUTHORSHIP];
        assert!(failure.contains("2 duplicate key groups"), "{}", failure);
        assert!(!pool.has_primary_key(SCHEMA, AUTHORSHIP).await.unwrap());

        let report = builder.run_phase(Phase::Dedup, &scope, false).await.unwrap();
        assert_eq!(report.duplicate_groups, 2);
        assert_eq!(report.rows_deduplicated, 2);
        assert_eq!(pool.row_count(SCHEMA, AUTHORSHIP).await.unwrap(), 10);

        let report = builder.run_phase(Phase::Keys, &scope, false).await.unwrap();
        assert_eq!(report.count(ItemOutcome::Done), 1);
        assert!(pool.has_primary_key(SCHEMA, AUTHORSHIP).await.unwrap());
    }

    #[tokio::test]
    async fn test_null_key_is_reported_for_table() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        let mut row = author_row("A1");
        row[0] = SqlValue::Null;
        pool.seed_rows(SCHEMA, AUTHORS, vec![row]);

        let builder = builder(test_config(&dir), pool);
        let report = builder
            .run_phase(Phase::Keys, &[AUTHORS.to_string()], false)
            .await
            .unwrap();
        assert!(report.key_failures[AUTHORS].contains("NULL key columns"));
        assert!(report.items[0].fatal);
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.status.exit_code(), crate::error::EXIT_CONFIG_ERROR);
    }

    #[tokio::test]
    async fn test_null_key_fails_run_all_with_config_exit_code() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        let mut row = author_row("A1");
        row[0] = SqlValue::Null;
        pool.seed_rows(SCHEMA, AUTHORS, vec![row]);

        let builder = builder(test_config(&dir), pool);
        let reports = builder.run_all(&[AUTHORS.to_string()], false).await.unwrap();
        let keys = reports.iter().find(|r| r.phase == Phase::Keys).unwrap();
        assert_eq!(keys.status, ReportStatus::Failed);
        let indexes = reports.iter().find(|r| r.phase == Phase::Indexes).unwrap();
        assert_eq!(indexes.status, ReportStatus::Partial);
        assert_eq!(overall_status(&reports).exit_code(), 1);
    }

    #[tokio::test]
    async fn test_state_commands_initialize_storage_first() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;

        let fresh = ConstraintBuilder::new(
            test_config(&dir),
            pool.clone(),
            Arc::new(MemoryStateBackend::requiring_schema()),
        );
        assert!(fresh.status().await.unwrap().is_none());

        let fresh = ConstraintBuilder::new(
            test_config(&dir),
            pool.clone(),
            Arc::new(MemoryStateBackend::requiring_schema()),
        );
        let err = fresh.reset_phase(Phase::Orphans).await.unwrap_err();
        assert!(err.to_string().contains("No run state to reset"), "{}", err);

        let fresh = ConstraintBuilder::new(
            test_config(&dir),
            pool,
            Arc::new(MemoryStateBackend::requiring_schema()),
        );
        let report = fresh
            .run_phase(Phase::Dedup, &[WORKS.to_string()], false)
            .await
            .unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert!(fresh.status().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scopes_keep_each_others_progress() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        pool.seed_rows(SCHEMA, WORKS, vec![work_row("W1"), work_row("W1")]);
        pool.seed_rows(SCHEMA, AUTHORS, vec![author_row("A1"), author_row("A1")]);

        // Two handles on one state file, as two processes would have.
        let state_path = dir.path().join("state.json");
        let first = ConstraintBuilder::new(
            test_config(&dir),
            pool.clone(),
            Arc::new(FileStateBackend::new(&state_path)),
        );
        let second = ConstraintBuilder::new(
            test_config(&dir),
            pool.clone(),
            Arc::new(FileStateBackend::new(&state_path)),
        );

        let works = vec![WORKS.to_string()];
        let authors = vec![AUTHORS.to_string()];
        for phase in [Phase::Dedup, Phase::Keys, Phase::Indexes] {
            let (a, b) = tokio::join!(
                first.run_phase(phase, &works, false),
                second.run_phase(phase, &authors, false)
            );
            assert_eq!(a.unwrap().count(ItemOutcome::Done), 1);
            assert_eq!(b.unwrap().count(ItemOutcome::Done), 1);
        }

        let state = FileStateBackend::new(&state_path).load().await.unwrap().unwrap();
        for phase in [Phase::Dedup, Phase::Keys, Phase::Indexes] {
            assert!(state.is_item_complete(phase, WORKS), "{} lost works", phase);
            assert!(state.is_item_complete(phase, AUTHORS), "{} lost authors", phase);
        }
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 1);
        assert_eq!(pool.row_count(SCHEMA, AUTHORS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_ddl_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        pool.inject_ddl_failures(2);

        let builder = builder(test_config(&dir), pool.clone());
        let report = builder
            .run_phase(Phase::Keys, &[AUTHORS.to_string()], false)
            .await
            .unwrap();
        assert_eq!(report.count(ItemOutcome::Done), 1);
        assert!(pool.has_primary_key(SCHEMA, AUTHORS).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_backoff() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        pool.inject_ddl_failures(1);

        let mut config = test_config(&dir);
        config.load.retry_backoff_ms = 600_000;
        let token = CancellationToken::new();
        let builder = builder(config, pool.clone()).with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            builder.run_phase(Phase::Keys, &[AUTHORS.to_string()], false),
        )
        .await
        .expect("retry back-off ignored cancellation")
        .unwrap();
        assert_eq!(report.status, ReportStatus::Cancelled);
        assert_eq!(report.items[0].detail.as_deref(), Some("cancelled"));
        assert!(!pool.has_primary_key(SCHEMA, AUTHORS).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_orphan_analysis_leaves_no_manifest() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let catalog = Catalog::standard();
        // The referenced authors table is missing, so the anti-join fails.
        let pool = Arc::new(MemoryPool::new());
        pool.create_schema(SCHEMA).await.unwrap();
        pool.prepare_table(SCHEMA, catalog.table(AUTHORSHIP).unwrap(), TargetMode::Keep, false)
            .await
            .unwrap();
        pool.seed_rows(SCHEMA, AUTHORSHIP, vec![authorship_row("W1", "A404", 0)]);

        let fk = "fk_authorship_author_id";
        let backend = Arc::new(MemoryStateBackend::new());
        let mut state = RunState::new("run-1".into(), config.hash());
        state.constraint_mut(fk, AUTHORSHIP).status = ConstraintStatus::CreatedUnvalidated;
        backend.save(&state).await.unwrap();

        let manifest_dir = config.constraints.manifest_dir.clone();
        let builder = ConstraintBuilder::new(config, pool, backend);
        let report = builder
            .run_phase(Phase::Orphans, &[AUTHORSHIP.to_string()], false)
            .await
            .unwrap();
        let item = report.items.iter().find(|i| i.item == fk).unwrap();
        assert_eq!(item.outcome, ItemOutcome::Failed);

        let leftovers: Vec<_> = std::fs::read_dir(&manifest_dir)
            .map(|entries| entries.map(|e| e.unwrap().file_name()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        let status = builder.status().await.unwrap().unwrap();
        assert!(status.constraints[fk].error.is_some());
    }

    #[tokio::test]
    async fn test_indexes_gated_on_keys() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        let builder = builder(test_config(&dir), pool);

        let report = builder
            .run_phase(Phase::Indexes, &[WORKS.to_string()], false)
            .await
            .unwrap();
        assert_eq!(report.count(ItemOutcome::Gated), 1);
        assert_eq!(report.status.as_str(), "partial");

        let status = builder.status().await.unwrap().unwrap();
        let indexes = status
            .phases
            .iter()
            .find(|p| p.phase == Phase::Indexes)
            .unwrap();
        assert!(indexes.failures[WORKS].contains("primary key for works not created"));
    }

    #[tokio::test]
    async fn test_unknown_scope_is_config_error() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        let builder = builder(test_config(&dir), pool);
        let err = builder
            .run_phase(Phase::Dedup, &["nope".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[tokio::test]
    async fn test_orphans_manifest_quarantine_and_validation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;

        pool.seed_rows(SCHEMA, AUTHORS, vec![author_row("A1"), author_row("A2")]);
        pool.seed_rows(SCHEMA, WORKS, vec![work_row("W1")]);
        pool.seed_rows(
            SCHEMA,
            AUTHORSHIP,
            vec![
                authorship_row("W1", "A1", 0),
                authorship_row("W1", "A2", 1),
                authorship_row("W1", "A404", 2),
                authorship_row("W1", "A405", 3),
            ],
        );

        let builder = builder(config.clone(), pool.clone());
        let scope: Vec<String> = vec![AUTHORSHIP.into(), AUTHORS.into(), WORKS.into()];
        for phase in [Phase::Dedup, Phase::Keys, Phase::Indexes, Phase::ForeignKeys] {
            let report = builder.run_phase(phase, &scope, false).await.unwrap();
            assert_eq!(report.count(ItemOutcome::Failed), 0, "{:?}", report.items);
        }

        let fk = "fk_authorship_author_id";
        let report = builder.run_phase(Phase::Validation, &scope, false).await.unwrap();
        assert_eq!(report.validation[fk], ConstraintStatus::ValidationFailed);

        let report = builder.run_phase(Phase::Orphans, &scope, false).await.unwrap();
        assert_eq!(report.orphans[fk], 2);
        assert_eq!(report.rows_quarantined, 0);
        let manifest = config.constraints.manifest_dir.join(format!("{}.csv", fk));
        let content = std::fs::read_to_string(&manifest).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.starts_with("work_id,author_id,position\n"));
        assert!(content.contains("W1,A404,2"));

        let report = builder.run_phase(Phase::Orphans, &scope, true).await.unwrap();
        assert_eq!(report.rows_quarantined, 2);
        assert_eq!(pool.row_count(SCHEMA, AUTHORSHIP).await.unwrap(), 2);

        let report = builder.run_phase(Phase::Validation, &scope, false).await.unwrap();
        assert_eq!(report.validation[fk], ConstraintStatus::Validated);

        let status = builder.status().await.unwrap().unwrap();
        assert_eq!(status.constraints[fk].status, ConstraintStatus::Validated);
        assert_eq!(status.constraints[fk].quarantined, 2);
    }

    #[tokio::test]
    async fn test_run_all_and_reset_phase() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::standard();
        let pool = prepared_pool(&catalog).await;
        let builder = builder(test_config(&dir), pool);

        let reports = builder.run_all(&[], false).await.unwrap();
        assert_eq!(reports.len(), CONSTRAINT_PHASES.len());
        for report in &reports {
            assert_eq!(report.status.as_str(), "completed", "{:?}", report.items);
        }
        let status = builder.status().await.unwrap().unwrap();
        assert_eq!(status.phase, Phase::Done);

        builder.reset_phase(Phase::Indexes).await.unwrap();
        let status = builder.status().await.unwrap().unwrap();
        assert_eq!(status.phase, Phase::Indexes);

        let report = builder.run_phase(Phase::Keys, &[], false).await.unwrap();
        assert_eq!(report.count(ItemOutcome::Skipped), catalog.tables().len());
    }
}
