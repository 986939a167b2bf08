//! Run reports.
//!
//! Every ingestion pass and every constraint phase run produces a report
//! that is printed and written to `<report_dir>/<run_id>-<name>.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{LoadError, Result, EXIT_CANCELLED, EXIT_CONFIG_ERROR, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::model::EntityKind;
use crate::schema::Catalog;
use crate::state::{ConstraintState, Phase, RunState, RunStatus, TaskStatus, UnitCounts};
use crate::target::ConstraintStatus;

/// How a run or phase ended, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    /// Something failed; resume or rerun the phase.
    Partial,
    Cancelled,
    /// An item failed in a way only a schema or config fix resolves.
    Failed,
}

impl ReportStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            ReportStatus::Completed => EXIT_SUCCESS,
            ReportStatus::Partial => EXIT_PARTIAL,
            ReportStatus::Cancelled => EXIT_CANCELLED,
            ReportStatus::Failed => EXIT_CONFIG_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Completed => "completed",
            ReportStatus::Partial => "partial",
            ReportStatus::Cancelled => "cancelled",
            ReportStatus::Failed => "failed",
        }
    }
}

/// A unit that ended in `failed`.
#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub partition: String,
    pub error: String,
}

/// A partition whose decoded record count differs from its manifest entry.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestMismatch {
    pub partition: String,
    pub expected: u64,
    pub actual: u64,
}

/// Result of an ingestion pass.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub status: ReportStatus,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub units_total: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    /// Units left pending or in progress, only after cancellation.
    pub units_unfinished: usize,
    pub records: u64,
    pub malformed: u64,
    pub rejected: u64,
    /// Rows refused by the store during per-row fallback.
    pub rows_rejected: u64,
    /// Batches the store refused in bulk and took row by row.
    pub bulk_fallbacks: u64,
    pub rows_per_table: BTreeMap<String, u64>,
    pub rows_per_second: u64,
    pub failed_units: Vec<FailedUnit>,
    pub manifest_mismatches: Vec<ManifestMismatch>,
}

impl IngestReport {
    /// Summarize the units of a run after an ingestion pass.
    pub fn from_state(state: &RunState, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let mut report = Self {
            run_id: state.run_id.clone(),
            status: match state.status {
                RunStatus::Cancelled => ReportStatus::Cancelled,
                RunStatus::Partial => ReportStatus::Partial,
                RunStatus::Running | RunStatus::Completed => {
                    if state.ingestion_complete() {
                        ReportStatus::Completed
                    } else {
                        ReportStatus::Partial
                    }
                }
            },
            dry_run,
            started_at,
            completed_at,
            duration_seconds: duration,
            units_total: state.units.len(),
            units_completed: 0,
            units_failed: 0,
            units_unfinished: 0,
            records: 0,
            malformed: 0,
            rejected: 0,
            rows_rejected: 0,
            bulk_fallbacks: 0,
            rows_per_table: state.table_rows.clone(),
            rows_per_second: 0,
            failed_units: Vec::new(),
            manifest_mismatches: Vec::new(),
        };

        for (partition, unit) in &state.units {
            match unit.status {
                TaskStatus::Completed => report.units_completed += 1,
                TaskStatus::Failed => {
                    report.units_failed += 1;
                    report.failed_units.push(FailedUnit {
                        partition: partition.clone(),
                        error: unit.error.clone().unwrap_or_default(),
                    });
                }
                TaskStatus::Pending | TaskStatus::InProgress => report.units_unfinished += 1,
            }
            report.records += unit.stats.records;
            report.malformed += unit.stats.malformed;
            report.rejected += unit.stats.rejected;
            report.rows_rejected += unit.rows_rejected;
            report.bulk_fallbacks += unit.bulk_fallbacks;

            if unit.status == TaskStatus::Completed {
                if let Some(expected) = unit.expected_records {
                    let actual = unit.stats.records + unit.stats.rejected;
                    if expected != actual {
                        report.manifest_mismatches.push(ManifestMismatch {
                            partition: partition.clone(),
                            expected,
                            actual,
                        });
                    }
                }
            }
        }

        let total_rows: u64 = report.rows_per_table.values().sum();
        if duration > 0.0 {
            report.rows_per_second = (total_rows as f64 / duration) as u64;
        }
        report
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What happened to one table or relationship in a phase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Done,
    /// Already complete from an earlier run.
    Skipped,
    /// A prerequisite phase is not complete for this item.
    Gated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    /// Table name or constraint name.
    pub item: String,
    pub table: String,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Rerunning will fail the same way until the schema or data is fixed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,
}

/// Result of one constraint phase run.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub run_id: String,
    pub phase: Phase,
    /// Tables the run was restricted to; empty means all.
    pub scope: Vec<String>,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub items: Vec<ItemReport>,
    pub duplicate_groups: u64,
    pub rows_deduplicated: u64,
    pub key_failures: BTreeMap<String, String>,
    pub indexes_created: u64,
    pub constraints_created: Vec<String>,
    pub orphans: BTreeMap<String, u64>,
    pub manifests: Vec<PathBuf>,
    pub rows_quarantined: u64,
    pub validation: BTreeMap<String, ConstraintStatus>,
}

impl PhaseReport {
    pub fn new(run_id: &str, phase: Phase, scope: Vec<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase,
            scope,
            status: ReportStatus::Completed,
            started_at: Utc::now(),
            duration_seconds: 0.0,
            items: Vec::new(),
            duplicate_groups: 0,
            rows_deduplicated: 0,
            key_failures: BTreeMap::new(),
            indexes_created: 0,
            constraints_created: Vec::new(),
            orphans: BTreeMap::new(),
            manifests: Vec::new(),
            rows_quarantined: 0,
            validation: BTreeMap::new(),
        }
    }

    pub fn push(
        &mut self,
        item: &str,
        table: &str,
        outcome: ItemOutcome,
        detail: Option<String>,
    ) {
        self.items.push(ItemReport {
            item: item.to_string(),
            table: table.to_string(),
            outcome,
            detail,
            fatal: false,
        });
    }

    /// Record a failed item, keeping whether the error is fatal.
    pub fn push_failure(&mut self, item: &str, table: &str, error: &LoadError) {
        self.items.push(ItemReport {
            item: item.to_string(),
            table: table.to_string(),
            outcome: ItemOutcome::Failed,
            detail: Some(error.to_string()),
            fatal: error.is_fatal(),
        });
    }

    pub fn count(&self, outcome: ItemOutcome) -> usize {
        self.items.iter().filter(|i| i.outcome == outcome).count()
    }

    /// Settle status and duration once every item is accounted for.
    pub fn finish(&mut self, cancelled: bool) {
        self.duration_seconds =
            (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let validation_failed = self
            .validation
            .values()
            .any(|s| *s == ConstraintStatus::ValidationFailed);
        self.status = if self.items.iter().any(|i| i.fatal) {
            ReportStatus::Failed
        } else if cancelled {
            ReportStatus::Cancelled
        } else if self.count(ItemOutcome::Failed) > 0
            || self.count(ItemOutcome::Gated) > 0
            || validation_failed
        {
            ReportStatus::Partial
        } else {
            ReportStatus::Completed
        };
    }

    pub fn name(&self) -> String {
        format!("constraints-{}", self.phase)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The worst outcome across the phases of a `run-all`.
pub fn overall_status(reports: &[PhaseReport]) -> ReportStatus {
    reports
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(ReportStatus::Completed)
}

/// Progress of one constraint phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
    pub failures: BTreeMap<String, String>,
}

/// Snapshot of the persisted run state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub status: RunStatus,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub units: BTreeMap<EntityKind, UnitCounts>,
    pub failed_units: Vec<FailedUnit>,
    pub table_rows: BTreeMap<String, u64>,
    pub phases: Vec<PhaseStatus>,
    pub constraints: BTreeMap<String, ConstraintState>,
}

impl StatusReport {
    pub fn from_state(state: &RunState, catalog: &Catalog) -> Self {
        let failed_units = state
            .units
            .iter()
            .filter(|(_, u)| u.status == TaskStatus::Failed)
            .map(|(partition, u)| FailedUnit {
                partition: partition.clone(),
                error: u.error.clone().unwrap_or_default(),
            })
            .collect();

        let phases = crate::state::CONSTRAINT_PHASES
            .iter()
            .map(|phase| {
                let items = phase.items(catalog);
                let progress = state.phases.get(phase);
                PhaseStatus {
                    phase: *phase,
                    completed: items
                        .iter()
                        .filter(|i| state.is_item_complete(*phase, i))
                        .count(),
                    total: items.len(),
                    failures: progress.map(|p| p.failures.clone()).unwrap_or_default(),
                }
            })
            .collect();

        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            phase: state.phase,
            started_at: state.started_at,
            updated_at: state.updated_at,
            units: state.unit_counts(),
            failed_units,
            table_rows: state.table_rows.clone(),
            phases,
            constraints: state.constraints.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Write a report to `<dir>/<run_id>-<name>.json`.
pub fn write_report<T: Serialize>(dir: &Path, run_id: &str, name: &str, report: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}.json", run_id, name));
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
    info!("Wrote report {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ReadStats, WorkUnit};
    use crate::state::UnitOutcome;
    use tempfile::TempDir;

    fn unit(partition: &str, expected: Option<u64>) -> WorkUnit {
        WorkUnit {
            kind: EntityKind::Works,
            partition: partition.to_string(),
            path: PathBuf::from(partition),
            bytes: 1,
            expected_records: expected,
            missing: false,
        }
    }

    #[test]
    fn test_ingest_report_totals() {
        let mut state = RunState::new("run-1".into(), "h".into());
        state.register_unit(&unit("works/a.gz", Some(10)));
        state.register_unit(&unit("works/b.gz", None));
        state.mark_unit_in_progress("works/a.gz");
        state.mark_unit_completed(
            "works/a.gz",
            UnitOutcome {
                stats: ReadStats {
                    lines: 12,
                    records: 9,
                    malformed: 3,
                    rejected: 0,
                },
                rows: BTreeMap::from([("works".to_string(), 9)]),
                rows_rejected: 2,
                bulk_fallbacks: 1,
            },
        );
        state.mark_unit_in_progress("works/b.gz");
        state.mark_unit_failed("works/b.gz", "connection reset");

        let report = IngestReport::from_state(&state, Utc::now(), false);
        assert_eq!(report.status, ReportStatus::Partial);
        assert_eq!(report.status.exit_code(), EXIT_PARTIAL);
        assert_eq!(report.units_completed, 1);
        assert_eq!(report.units_failed, 1);
        assert_eq!(report.records, 9);
        assert_eq!(report.malformed, 3);
        assert_eq!(report.rows_rejected, 2);
        assert_eq!(report.bulk_fallbacks, 1);
        assert_eq!(report.rows_per_table["works"], 9);
        assert_eq!(report.failed_units[0].partition, "works/b.gz");
        assert_eq!(report.manifest_mismatches.len(), 1);
        assert_eq!(report.manifest_mismatches[0].expected, 10);
    }

    #[test]
    fn test_phase_report_status() {
        let mut report = PhaseReport::new("run-1", Phase::Keys, vec![]);
        report.push("works", "works", ItemOutcome::Done, None);
        report.finish(false);
        assert_eq!(report.status, ReportStatus::Completed);

        report.push("authorship", "authorship", ItemOutcome::Failed, Some("2 duplicate groups".into()));
        report.finish(false);
        assert_eq!(report.status, ReportStatus::Partial);

        report.finish(true);
        assert_eq!(report.status, ReportStatus::Cancelled);
    }

    #[test]
    fn test_null_key_failure_is_fatal_with_config_exit_code() {
        let mut report = PhaseReport::new("run-1", Phase::Keys, vec![]);
        report.push_failure(
            "authorship",
            "authorship",
            &LoadError::DuplicateKeys {
                table: "authorship".into(),
                groups: 2,
            },
        );
        report.finish(false);
        assert_eq!(report.status, ReportStatus::Partial);

        report.push_failure(
            "authors",
            "authors",
            &LoadError::NullableKey {
                table: "authors".into(),
                columns: "id".into(),
                rows: 1,
            },
        );
        report.finish(true);
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.status.exit_code(), EXIT_CONFIG_ERROR);
        assert!(report.to_json().unwrap().contains("\"fatal\": true"));
    }

    #[test]
    fn test_overall_status_takes_the_worst_phase() {
        let mut keys = PhaseReport::new("run-1", Phase::Keys, vec![]);
        keys.status = ReportStatus::Failed;
        let mut indexes = PhaseReport::new("run-1", Phase::Indexes, vec![]);
        indexes.status = ReportStatus::Partial;
        let dedup = PhaseReport::new("run-1", Phase::Dedup, vec![]);

        assert_eq!(overall_status(&[]), ReportStatus::Completed);
        assert_eq!(overall_status(&[dedup.clone(), indexes.clone()]), ReportStatus::Partial);
        let status = overall_status(&[dedup, keys, indexes]);
        assert_eq!(status, ReportStatus::Failed);
        assert_eq!(status.exit_code(), 1);
    }

    #[test]
    fn test_write_report() {
        let dir = TempDir::new().unwrap();
        let report = PhaseReport::new("run-1", Phase::Dedup, vec!["works".into()]);
        let path = write_report(dir.path(), "run-1", &report.name(), &report).unwrap();
        assert!(path.ends_with("run-1-constraints-dedup.json"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"phase\": \"dedup\""));
    }
}
