//! Durable run state for resume.
//!
//! One [`RunState`] records every work unit, every constraint phase and every
//! foreign key. It is written after each completed unit and each completed
//! phase item, so a crash loses at most the units that were in flight.

mod backend;
mod db;
mod file;
mod memory;
mod phase;

pub use backend::{StateBackend, StateChange};
pub use db::DbStateBackend;
pub use file::FileStateBackend;
pub use memory::MemoryStateBackend;
pub use phase::{Phase, CONSTRAINT_PHASES};

use crate::error::{LoadError, Result};
use crate::model::EntityKind;
use crate::schema::Catalog;
use crate::source::{ReadStats, WorkUnit};
use crate::target::ConstraintStatus;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet};

type HmacSha256 = Hmac<Sha256>;

/// Run state for resume capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run identifier.
    pub run_id: String,

    /// Hash of the settings that shaped this run.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Outcome of the most recent ingestion pass.
    pub status: RunStatus,

    /// Global phase marker.
    pub phase: Phase,

    /// Work units keyed by partition path.
    pub units: BTreeMap<String, UnitState>,

    /// Rows written per table by completed units.
    #[serde(default)]
    pub table_rows: BTreeMap<String, u64>,

    /// Per-phase item progress.
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseProgress>,

    /// Foreign keys keyed by constraint name.
    #[serde(default)]
    pub constraints: BTreeMap<String, ConstraintState>,

    /// HMAC-SHA256 over the serialized state (without this field), keyed
    /// by the config hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall ingestion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished with failed units; resume to retry them.
    Partial,
    Cancelled,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-unit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitState {
    pub kind: EntityKind,
    pub status: TaskStatus,
    /// Attempts started, across runs.
    #[serde(default)]
    pub attempts: u32,
    pub bytes: u64,
    pub expected_records: Option<u64>,
    #[serde(default)]
    pub stats: ReadStats,
    /// Rows written per table.
    #[serde(default)]
    pub rows: BTreeMap<String, u64>,
    /// Rows the store refused even one at a time.
    #[serde(default)]
    pub rows_rejected: u64,
    /// Batches that fell back to row-by-row writes.
    #[serde(default)]
    pub bulk_fallbacks: u64,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a finished unit produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub stats: ReadStats,
    pub rows: BTreeMap<String, u64>,
    pub rows_rejected: u64,
    pub bulk_fallbacks: u64,
}

/// Progress of one constraint phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// Items (tables or constraint names) finished in this phase.
    pub completed: BTreeSet<String>,
    /// Last failure per item not yet finished.
    pub failures: BTreeMap<String, String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// State of one foreign key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintState {
    pub table: String,
    pub status: ConstraintStatus,
    /// Orphan rows found by the last analysis.
    pub orphans: Option<u64>,
    #[serde(default)]
    pub quarantined: u64,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Unit counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub records: u64,
}

impl RunState {
    /// Create a new run state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            config_hash,
            started_at: now,
            updated_at: now,
            status: RunStatus::Running,
            phase: Phase::Ingestion,
            units: BTreeMap::new(),
            table_rows: BTreeMap::new(),
            phases: BTreeMap::new(),
            constraints: BTreeMap::new(),
            hmac: None,
        }
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)
            .map_err(|e| LoadError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| LoadError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Serialize with a fresh signature.
    pub fn to_signed_json(&self) -> Result<String> {
        let mut signed = self.clone();
        signed.updated_at = Utc::now();
        signed.hmac = None;
        signed.hmac = Some(signed.compute_hmac()?);
        serde_json::to_string_pretty(&signed)
            .map_err(|e| LoadError::State(format!("Failed to serialize state: {}", e)))
    }

    /// Parse and verify a signed state document.
    pub fn from_signed_json(content: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(content)
            .map_err(|e| LoadError::State(format!("Failed to parse state: {}", e)))?;
        match &state.hmac {
            Some(stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(LoadError::State(
                "State integrity check failed: HMAC mismatch (possible tampering)".to_string(),
            )),
            None => Err(LoadError::State(
                "State has no HMAC signature, integrity cannot be verified".to_string(),
            )),
        }
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(LoadError::ConfigChanged);
        }
        Ok(())
    }

    /// Record a discovered unit. Existing entries keep their status; a newly
    /// seen pending unit reopens ingestion.
    pub fn register_unit(&mut self, unit: &WorkUnit) {
        let mut added = false;
        let entry = self
            .units
            .entry(unit.partition.clone())
            .or_insert_with(|| {
                added = true;
                UnitState {
                    kind: unit.kind,
                    status: TaskStatus::Pending,
                    attempts: 0,
                    bytes: unit.bytes,
                    expected_records: unit.expected_records,
                    stats: ReadStats::default(),
                    rows: BTreeMap::new(),
                    rows_rejected: 0,
                    bulk_fallbacks: 0,
                    error: None,
                    completed_at: None,
                }
            });
        entry.bytes = unit.bytes;
        entry.expected_records = unit.expected_records;
        if added && self.phase != Phase::Ingestion {
            self.phase = Phase::Ingestion;
        }
    }

    pub fn unit(&self, partition: &str) -> Option<&UnitState> {
        self.units.get(partition)
    }

    /// Whether a unit already wrote rows before: it was started and did not
    /// complete, so a rerun must not blindly append.
    pub fn was_attempted(&self, partition: &str) -> bool {
        self.units
            .get(partition)
            .map(|u| u.attempts > 0 && u.status != TaskStatus::Completed)
            .unwrap_or(false)
    }

    pub fn mark_unit_in_progress(&mut self, partition: &str) {
        if let Some(unit) = self.units.get_mut(partition) {
            unit.status = TaskStatus::InProgress;
            unit.attempts += 1;
            unit.error = None;
        }
    }

    pub fn mark_unit_completed(&mut self, partition: &str, outcome: UnitOutcome) {
        if let Some(unit) = self.units.get_mut(partition) {
            unit.status = TaskStatus::Completed;
            unit.stats = outcome.stats;
            unit.rows = outcome.rows;
            unit.rows_rejected = outcome.rows_rejected;
            unit.bulk_fallbacks = outcome.bulk_fallbacks;
            unit.error = None;
            unit.completed_at = Some(Utc::now());
        }
        self.recompute_table_rows();
    }

    pub fn mark_unit_failed(&mut self, partition: &str, error: &str) {
        if let Some(unit) = self.units.get_mut(partition) {
            unit.status = TaskStatus::Failed;
            unit.error = Some(error.to_string());
        }
    }

    /// Partitions that still need ingesting, in key order.
    pub fn incomplete_units(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|(_, u)| u.status != TaskStatus::Completed)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// True when no unit is pending, in progress or failed.
    pub fn ingestion_complete(&self) -> bool {
        self.units
            .values()
            .all(|u| u.status == TaskStatus::Completed)
    }

    pub fn unit_counts(&self) -> BTreeMap<EntityKind, UnitCounts> {
        let mut counts: BTreeMap<EntityKind, UnitCounts> = BTreeMap::new();
        for unit in self.units.values() {
            let c = counts.entry(unit.kind).or_default();
            match unit.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::InProgress => c.in_progress += 1,
                TaskStatus::Completed => c.completed += 1,
                TaskStatus::Failed => c.failed += 1,
            }
            c.records += unit.stats.records;
        }
        counts
    }

    fn recompute_table_rows(&mut self) {
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for unit in self.units.values().filter(|u| u.status == TaskStatus::Completed) {
            for (table, rows) in &unit.rows {
                *totals.entry(table.clone()).or_default() += rows;
            }
        }
        self.table_rows = totals;
    }

    pub fn is_item_complete(&self, phase: Phase, item: &str) -> bool {
        self.phases
            .get(&phase)
            .map(|p| p.completed.contains(item))
            .unwrap_or(false)
    }

    pub fn complete_item(&mut self, phase: Phase, item: &str) {
        let progress = self.phases.entry(phase).or_default();
        progress.failures.remove(item);
        progress.completed.insert(item.to_string());
    }

    pub fn fail_item(&mut self, phase: Phase, item: &str, error: &str) {
        self.phases
            .entry(phase)
            .or_default()
            .failures
            .insert(item.to_string(), error.to_string());
    }

    /// Forget a phase's progress and move the marker back if it had passed
    /// the phase. Validation results are reverted to unvalidated.
    pub fn reset_phase(&mut self, phase: Phase) {
        self.phases.remove(&phase);
        if phase == Phase::Validation {
            for c in self.constraints.values_mut() {
                if matches!(
                    c.status,
                    ConstraintStatus::Validated | ConstraintStatus::ValidationFailed
                ) {
                    c.status = ConstraintStatus::CreatedUnvalidated;
                    c.error = None;
                }
            }
        }
        if phase == Phase::Orphans {
            for c in self.constraints.values_mut() {
                c.orphans = None;
            }
        }
        if self.phase > phase {
            self.phase = phase;
        }
    }

    /// Advance the global marker past every phase whose items are all done.
    pub fn advance_phase(&mut self, catalog: &Catalog) {
        loop {
            let done = match self.phase {
                Phase::Ingestion => self.ingestion_complete(),
                Phase::Done => return,
                phase => phase
                    .items(catalog)
                    .iter()
                    .all(|item| self.is_item_complete(phase, item)),
            };
            if !done {
                return;
            }
            if let Some(progress) = self.phases.get_mut(&self.phase) {
                progress.completed_at.get_or_insert_with(Utc::now);
            }
            match self.phase.next() {
                Some(next) => self.phase = next,
                None => return,
            }
        }
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintState> {
        self.constraints.get(name)
    }

    pub fn constraint_status(&self, name: &str) -> ConstraintStatus {
        self.constraints
            .get(name)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    pub fn constraint_mut(&mut self, name: &str, table: &str) -> &mut ConstraintState {
        let entry = self
            .constraints
            .entry(name.to_string())
            .or_insert_with(|| ConstraintState {
                table: table.to_string(),
                status: ConstraintStatus::Absent,
                orphans: None,
                quarantined: 0,
                error: None,
                updated_at: Utc::now(),
            });
        entry.updated_at = Utc::now();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unit(partition: &str) -> WorkUnit {
        WorkUnit {
            kind: EntityKind::Works,
            partition: partition.to_string(),
            path: PathBuf::from(partition),
            bytes: 10,
            expected_records: None,
            missing: false,
        }
    }

    fn outcome(rows: u64) -> UnitOutcome {
        UnitOutcome {
            stats: ReadStats {
                lines: rows,
                records: rows,
                malformed: 0,
                rejected: 0,
            },
            rows: BTreeMap::from([("works".to_string(), rows)]),
            rows_rejected: 0,
            bulk_fallbacks: 0,
        }
    }

    #[test]
    fn test_signed_round_trip() {
        let mut state = RunState::new("run-1".into(), "abc123".into());
        state.register_unit(&unit("works/a.gz"));
        let json = state.to_signed_json().unwrap();
        let loaded = RunState::from_signed_json(&json).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert!(loaded.units.contains_key("works/a.gz"));
    }

    #[test]
    fn test_tampering_detected() {
        let mut state = RunState::new("run-1".into(), "abc123".into());
        state.register_unit(&unit("works/a.gz"));
        let json = state.to_signed_json().unwrap();
        let tampered = json.replace("\"pending\"", "\"completed\"");
        assert!(matches!(
            RunState::from_signed_json(&tampered),
            Err(LoadError::State(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let state = RunState::new("run-1".into(), "abc123".into());
        assert!(state.validate_config("abc123").is_ok());
        assert!(matches!(
            state.validate_config("other"),
            Err(LoadError::ConfigChanged)
        ));
    }

    #[test]
    fn test_unit_lifecycle_and_totals() {
        let mut state = RunState::new("run-1".into(), "h".into());
        state.register_unit(&unit("works/a.gz"));
        state.register_unit(&unit("works/b.gz"));
        assert!(!state.was_attempted("works/a.gz"));

        state.mark_unit_in_progress("works/a.gz");
        assert!(state.was_attempted("works/a.gz"));
        state.mark_unit_completed("works/a.gz", outcome(100));
        assert!(!state.was_attempted("works/a.gz"));

        state.mark_unit_in_progress("works/b.gz");
        state.mark_unit_failed("works/b.gz", "boom");
        assert!(state.was_attempted("works/b.gz"));
        assert!(!state.ingestion_complete());
        assert_eq!(state.incomplete_units(), vec!["works/b.gz".to_string()]);

        state.mark_unit_in_progress("works/b.gz");
        state.mark_unit_completed("works/b.gz", outcome(50));
        assert!(state.ingestion_complete());
        assert_eq!(state.table_rows.get("works"), Some(&150));
        assert_eq!(state.units["works/b.gz"].attempts, 2);

        let counts = state.unit_counts();
        assert_eq!(counts[&EntityKind::Works].completed, 2);
        assert_eq!(counts[&EntityKind::Works].records, 150);
    }

    #[test]
    fn test_phase_marker_advances_and_resets() {
        let catalog = Catalog::standard();
        let mut state = RunState::new("run-1".into(), "h".into());
        state.register_unit(&unit("works/a.gz"));
        state.advance_phase(&catalog);
        assert_eq!(state.phase, Phase::Ingestion);

        state.mark_unit_in_progress("works/a.gz");
        state.mark_unit_completed("works/a.gz", outcome(1));
        state.advance_phase(&catalog);
        assert_eq!(state.phase, Phase::Dedup);

        for table in catalog.tables() {
            state.complete_item(Phase::Dedup, &table.name);
        }
        state.advance_phase(&catalog);
        assert_eq!(state.phase, Phase::Keys);

        state.reset_phase(Phase::Dedup);
        assert_eq!(state.phase, Phase::Dedup);
        assert!(!state.is_item_complete(Phase::Dedup, "works"));

        // A newly discovered partition reopens ingestion.
        state.register_unit(&unit("works/new.gz"));
        assert_eq!(state.phase, Phase::Ingestion);
    }

    #[test]
    fn test_reset_validation_reverts_constraint_status() {
        let mut state = RunState::new("run-1".into(), "h".into());
        state.constraint_mut("fk_works_source_id", "works").status =
            ConstraintStatus::ValidationFailed;
        state.complete_item(Phase::Validation, "fk_works_source_id");
        state.reset_phase(Phase::Validation);
        assert_eq!(
            state.constraint_status("fk_works_source_id"),
            ConstraintStatus::CreatedUnvalidated
        );
        assert!(!state.is_item_complete(Phase::Validation, "fk_works_source_id"));
    }
}
