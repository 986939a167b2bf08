//! In-process implementation of [`TargetPool`].
//!
//! Mirrors the PostgreSQL behavior the loader depends on: NOT NULL columns,
//! rejection of NUL characters in text, primary-key uniqueness once a key
//! exists, and NOT VALID foreign keys that only check rows on validation.
//! Used by `start --dry-run` and by tests.

use super::{orphan_columns, ConstraintStatus, Row, SqlValue, TargetPool, ValidationOutcome};
use crate::config::TargetMode;
use crate::constraints::OrphanManifest;
use crate::error::{LoadError, Result};
use crate::schema::{ForeignKey, Index, Table};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type Key = Vec<Option<String>>;

#[derive(Debug, Default)]
struct MemTable {
    def: Option<Table>,
    rows: Vec<Row>,
    primary_key: Option<Vec<usize>>,
    indexes: BTreeSet<String>,
    /// Foreign key name to validated flag.
    foreign_keys: BTreeMap<String, bool>,
    unlogged: bool,
}

impl MemTable {
    fn def(&self) -> Result<&Table> {
        self.def
            .as_ref()
            .ok_or_else(|| LoadError::write("?", "table has no definition"))
    }

    fn key_of(row: &[SqlValue], positions: &[usize]) -> Key {
        positions.iter().map(|&i| row[i].to_text()).collect()
    }

    fn check_row(&self, row: &[SqlValue]) -> Result<()> {
        let def = self.def()?;
        if row.len() != def.columns.len() {
            return Err(LoadError::write(
                &def.name,
                format!("expected {} columns, got {}", def.columns.len(), row.len()),
            ));
        }
        for (column, value) in def.columns.iter().zip(row) {
            if !column.is_nullable && value.is_null() {
                return Err(LoadError::write(
                    &def.name,
                    format!("null value in column \"{}\" violates not-null constraint", column.name),
                ));
            }
            if let SqlValue::Text(s) = value {
                if s.contains('\0') {
                    return Err(LoadError::write(
                        &def.name,
                        "invalid byte sequence for encoding \"UTF8\": 0x00",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate a batch against column rules and, when a key exists,
    /// uniqueness against stored rows and within the batch.
    fn check_batch(&self, rows: &[Row]) -> Result<()> {
        for row in rows {
            self.check_row(row)?;
        }
        if let Some(positions) = &self.primary_key {
            let mut seen: HashSet<Key> = self
                .rows
                .iter()
                .map(|r| Self::key_of(r, positions))
                .collect();
            for row in rows {
                if !seen.insert(Self::key_of(row, positions)) {
                    return Err(LoadError::write(
                        &self.def()?.name,
                        "duplicate key value violates unique constraint",
                    ));
                }
            }
        }
        Ok(())
    }

    fn duplicate_groups(&self, positions: &[usize]) -> i64 {
        let mut counts: HashMap<Key, usize> = HashMap::new();
        for row in &self.rows {
            *counts.entry(Self::key_of(row, positions)).or_default() += 1;
        }
        counts.values().filter(|&&c| c > 1).count() as i64
    }
}

/// Target that keeps every table in memory.
#[derive(Debug, Default)]
pub struct MemoryPool {
    tables: Mutex<HashMap<String, MemTable>>,
    schemas: Mutex<BTreeSet<String>>,
    transient_failures: AtomicUsize,
    ddl_failures: AtomicUsize,
    row_delay_ms: AtomicU64,
    writes_before_interruption: Mutex<Option<usize>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` bulk writes fail with a transient error.
    pub fn inject_transient_failures(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Let `n` more bulk writes through, then fail the next one with a
    /// transient error, as a connection dropped mid-unit would.
    pub fn interrupt_after_writes(&self, n: usize) {
        *self
            .writes_before_interruption
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(n);
    }

    /// Make the next `n` schema changes (keys, indexes, foreign keys) fail
    /// with a transient error.
    pub fn inject_ddl_failures(&self, n: usize) {
        self.ddl_failures.store(n, Ordering::SeqCst);
    }

    /// Stall every single-row insert, as a locked or overloaded table would.
    pub fn delay_single_row_writes(&self, delay: Duration) {
        self.row_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.lock()
            .get(&key(schema, table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Insert rows without any checks, e.g. to seed a table with bad data.
    pub fn seed_rows(&self, schema: &str, table: &str, rows: Vec<Row>) {
        if let Some(t) = self.lock().get_mut(&key(schema, table)) {
            t.rows.extend(rows);
        }
    }

    pub fn has_index(&self, schema: &str, table: &str, index: &str) -> bool {
        self.lock()
            .get(&key(schema, table))
            .map(|t| t.indexes.contains(index))
            .unwrap_or(false)
    }

    pub fn is_unlogged(&self, schema: &str, table: &str) -> bool {
        self.lock()
            .get(&key(schema, table))
            .map(|t| t.unlogged)
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemTable>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_transient_failure(&self) -> bool {
        let mut interruption = self
            .writes_before_interruption
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *interruption {
            Some(0) => {
                *interruption = None;
                return true;
            }
            Some(n) => *interruption = Some(n - 1),
            None => {}
        }
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_ddl_failure(&self, operation: &str) -> Result<()> {
        if self
            .ddl_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LoadError::pool("injected failure", operation.to_string()));
        }
        Ok(())
    }

    fn with_table<T>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&mut MemTable) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.lock();
        let t = tables.get_mut(&key(schema, table)).ok_or_else(|| {
            LoadError::write(table, format!("relation \"{}.{}\" does not exist", schema, table))
        })?;
        f(t)
    }

    fn referenced_keys(&self, schema: &str, fk: &ForeignKey) -> Result<HashSet<String>> {
        self.with_table(schema, &fk.ref_table, |parent| {
            let position = parent.def()?.column_index(&fk.ref_column).ok_or_else(|| {
                LoadError::write(&fk.ref_table, format!("no column {}", fk.ref_column))
            })?;
            Ok(parent
                .rows
                .iter()
                .filter_map(|r| r[position].to_text())
                .collect())
        })
    }

    fn orphan_filter(
        &self,
        schema: &str,
        fk: &ForeignKey,
    ) -> Result<impl Fn(&Row) -> bool> {
        let parents = self.referenced_keys(schema, fk)?;
        let position = self.with_table(schema, &fk.table, |t| {
            t.def()?
                .column_index(&fk.column)
                .ok_or_else(|| LoadError::write(&fk.table, format!("no column {}", fk.column)))
        })?;
        Ok(move |row: &Row| match row[position].to_text() {
            Some(value) => !parents.contains(&value),
            None => false,
        })
    }
}

fn key(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

#[async_trait]
impl TargetPool for MemoryPool {
    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.schemas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(schema.to_string());
        Ok(())
    }

    async fn prepare_table(
        &self,
        schema: &str,
        table: &Table,
        mode: TargetMode,
        unlogged: bool,
    ) -> Result<()> {
        let mut tables = self.lock();
        let k = key(schema, &table.name);
        if mode == TargetMode::DropRecreate {
            tables.remove(&k);
        }
        let entry = tables.entry(k).or_insert_with(|| MemTable {
            def: Some(table.clone()),
            unlogged,
            ..Default::default()
        });
        if mode == TargetMode::Truncate {
            entry.rows.clear();
        }
        Ok(())
    }

    async fn set_table_logged(&self, schema: &str, table: &str) -> Result<()> {
        self.with_table(schema, table, |t| {
            t.unlogged = false;
            Ok(())
        })
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        self.with_table(schema, table, |t| Ok(t.rows.len() as i64))
    }

    async fn copy_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64> {
        if self.take_transient_failure() {
            return Err(LoadError::pool("injected failure", "bulk copy"));
        }
        self.with_table(schema, &table.name, |t| {
            t.check_batch(rows)?;
            t.rows.extend(rows.iter().cloned());
            Ok(rows.len() as u64)
        })
    }

    async fn merge_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64> {
        if self.take_transient_failure() {
            return Err(LoadError::pool("injected failure", "merge"));
        }
        let positions = table.key_positions();
        self.with_table(schema, &table.name, |t| {
            for row in rows {
                t.check_row(row)?;
            }
            let mut incoming: Vec<Row> = Vec::with_capacity(rows.len());
            let mut keys: HashSet<Key> = HashSet::new();
            for row in rows {
                if keys.insert(MemTable::key_of(row, &positions)) {
                    incoming.push(row.clone());
                }
            }
            t.rows
                .retain(|r| !keys.contains(&MemTable::key_of(r, &positions)));
            let inserted = incoming.len() as u64;
            t.rows.extend(incoming);
            Ok(inserted)
        })
    }

    async fn insert_row(&self, schema: &str, table: &Table, row: &[SqlValue]) -> Result<()> {
        let delay = self.row_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.with_table(schema, &table.name, |t| {
            let batch = vec![row.to_vec()];
            t.check_batch(&batch)?;
            t.rows.extend(batch);
            Ok(())
        })
    }

    async fn count_null_keys(&self, schema: &str, table: &Table) -> Result<i64> {
        let positions = table.key_positions();
        self.with_table(schema, &table.name, |t| {
            Ok(t.rows
                .iter()
                .filter(|r| positions.iter().any(|&i| r[i].is_null()))
                .count() as i64)
        })
    }

    async fn count_duplicate_groups(&self, schema: &str, table: &Table) -> Result<i64> {
        let positions = table.key_positions();
        self.with_table(schema, &table.name, |t| Ok(t.duplicate_groups(&positions)))
    }

    async fn delete_duplicates(&self, schema: &str, table: &Table) -> Result<u64> {
        let positions = table.key_positions();
        self.with_table(schema, &table.name, |t| {
            let before = t.rows.len();
            let mut seen: HashSet<Key> = HashSet::new();
            t.rows.retain(|r| seen.insert(MemTable::key_of(r, &positions)));
            Ok((before - t.rows.len()) as u64)
        })
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        self.with_table(schema, table, |t| Ok(t.primary_key.is_some()))
    }

    async fn add_primary_key(&self, schema: &str, table: &Table) -> Result<()> {
        self.take_ddl_failure("primary key creation")?;
        let positions = table.key_positions();
        self.with_table(schema, &table.name, |t| {
            if t.primary_key.is_some() {
                return Err(LoadError::write(
                    &table.name,
                    "multiple primary keys are not allowed",
                ));
            }
            let nulls = t
                .rows
                .iter()
                .filter(|r| positions.iter().any(|&i| r[i].is_null()))
                .count() as i64;
            if nulls > 0 {
                return Err(LoadError::NullableKey {
                    table: table.name.clone(),
                    columns: table.primary_key.join(", "),
                    rows: nulls,
                });
            }
            let groups = t.duplicate_groups(&positions);
            if groups > 0 {
                return Err(LoadError::DuplicateKeys {
                    table: table.name.clone(),
                    groups,
                });
            }
            t.primary_key = Some(positions.clone());
            t.indexes.insert(table.primary_key_name());
            Ok(())
        })
    }

    async fn create_index(&self, schema: &str, table: &Table, index: &Index) -> Result<()> {
        self.take_ddl_failure("index creation")?;
        self.with_table(schema, &table.name, |t| {
            t.indexes.insert(index.name.clone());
            Ok(())
        })
    }

    async fn constraint_status(&self, schema: &str, fk: &ForeignKey) -> Result<ConstraintStatus> {
        self.with_table(schema, &fk.table, |t| {
            Ok(match t.foreign_keys.get(&fk.name) {
                None => ConstraintStatus::Absent,
                Some(true) => ConstraintStatus::Validated,
                Some(false) => ConstraintStatus::CreatedUnvalidated,
            })
        })
    }

    async fn add_foreign_key(&self, schema: &str, fk: &ForeignKey) -> Result<()> {
        self.take_ddl_failure("foreign key creation")?;
        let parent_has_key = self.with_table(schema, &fk.ref_table, |p| Ok(p.primary_key.is_some()))?;
        if !parent_has_key {
            return Err(LoadError::write(
                &fk.table,
                format!(
                    "there is no unique constraint matching given keys for referenced table \"{}\"",
                    fk.ref_table
                ),
            ));
        }
        self.with_table(schema, &fk.table, |t| {
            if t.foreign_keys.contains_key(&fk.name) {
                return Err(LoadError::write(
                    &fk.table,
                    format!("constraint \"{}\" already exists", fk.name),
                ));
            }
            t.foreign_keys.insert(fk.name.clone(), false);
            Ok(())
        })
    }

    async fn export_orphans(
        &self,
        schema: &str,
        table: &Table,
        fk: &ForeignKey,
        manifest: &mut OrphanManifest,
    ) -> Result<u64> {
        let is_orphan = self.orphan_filter(schema, fk)?;
        let positions: Vec<usize> = orphan_columns(table, fk)
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        let orphans: Vec<Vec<Option<String>>> = self.with_table(schema, &fk.table, |t| {
            Ok(t.rows
                .iter()
                .filter(|r| is_orphan(*r))
                .map(|r| MemTable::key_of(r, &positions))
                .collect())
        })?;
        for values in &orphans {
            manifest.write_row(values)?;
        }
        Ok(orphans.len() as u64)
    }

    async fn delete_orphans(&self, schema: &str, fk: &ForeignKey) -> Result<u64> {
        let is_orphan = self.orphan_filter(schema, fk)?;
        self.with_table(schema, &fk.table, |t| {
            let before = t.rows.len();
            t.rows.retain(|r| !is_orphan(r));
            Ok((before - t.rows.len()) as u64)
        })
    }

    async fn validate_foreign_key(
        &self,
        schema: &str,
        fk: &ForeignKey,
    ) -> Result<ValidationOutcome> {
        let is_orphan = self.orphan_filter(schema, fk)?;
        self.with_table(schema, &fk.table, |t| {
            if !t.foreign_keys.contains_key(&fk.name) {
                return Err(LoadError::write(
                    &fk.table,
                    format!("constraint \"{}\" does not exist", fk.name),
                ));
            }
            let violations = t.rows.iter().filter(|r| is_orphan(*r)).count();
            if violations > 0 {
                return Ok(ValidationOutcome::Violated(format!(
                    "insert or update on table \"{}\" violates foreign key constraint \"{}\" ({} rows)",
                    fk.table, fk.name, violations
                )));
            }
            t.foreign_keys.insert(fk.name.clone(), true);
            Ok(ValidationOutcome::Validated)
        })
    }

    async fn health_check(&self) -> Result<String> {
        Ok("in-memory target".to_string())
    }
}
