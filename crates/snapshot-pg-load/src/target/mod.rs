//! Target database operations.
//!
//! [`TargetPool`] covers both halves of a load: bulk row writes during
//! ingestion, and the key, index and foreign-key DDL of the constraint
//! phases. [`PgPool`] talks to PostgreSQL; [`MemoryPool`] keeps tables in
//! process for dry runs and tests.

mod memory;
mod postgres;
mod tls;
mod value;

pub use memory::MemoryPool;
pub use postgres::PgPool;
pub use tls::{make_connector, SslMode};
pub use value::{encode_copy_row, Row, SqlValue};

use crate::config::TargetMode;
use crate::constraints::OrphanManifest;
use crate::error::Result;
use crate::schema::{ColumnType, ForeignKey, Index, Table};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a foreign key in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintStatus {
    #[default]
    Absent,
    CreatedUnvalidated,
    Validated,
    ValidationFailed,
}

impl fmt::Display for ConstraintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintStatus::Absent => "absent",
            ConstraintStatus::CreatedUnvalidated => "created_unvalidated",
            ConstraintStatus::Validated => "validated",
            ConstraintStatus::ValidationFailed => "validation_failed",
        };
        f.write_str(s)
    }
}

/// Result of validating an existing NOT VALID foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Validated,
    /// Existing rows violate the constraint; the message comes from the store.
    Violated(String),
}

/// Trait for target database operations.
#[async_trait]
pub trait TargetPool: Send + Sync {
    /// Create a schema if it doesn't exist.
    async fn create_schema(&self, schema: &str) -> Result<()>;

    /// Make a bare table (no keys, no indexes) ready for ingestion.
    async fn prepare_table(
        &self,
        schema: &str,
        table: &Table,
        mode: TargetMode,
        unlogged: bool,
    ) -> Result<()>;

    /// Switch an UNLOGGED table to LOGGED.
    async fn set_table_logged(&self, schema: &str, table: &str) -> Result<()>;

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Bulk-append rows.
    async fn copy_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64>;

    /// Replace existing rows that share a key with an incoming row, then
    /// insert the incoming rows. Works with or without a primary key.
    async fn merge_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64>;

    /// Insert a single row. Used to isolate bad rows after a bulk write fails.
    async fn insert_row(&self, schema: &str, table: &Table, row: &[SqlValue]) -> Result<()>;

    /// Rows with NULL in any primary key column.
    async fn count_null_keys(&self, schema: &str, table: &Table) -> Result<i64>;

    /// Number of key values that occur more than once.
    async fn count_duplicate_groups(&self, schema: &str, table: &Table) -> Result<i64>;

    /// Keep one row per key, deleting the rest. Returns rows deleted.
    async fn delete_duplicates(&self, schema: &str, table: &Table) -> Result<u64>;

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool>;

    /// Create the primary key. Fails with `DuplicateKeys` while duplicates remain.
    async fn add_primary_key(&self, schema: &str, table: &Table) -> Result<()>;

    /// Create an index if it doesn't exist.
    async fn create_index(&self, schema: &str, table: &Table, index: &Index) -> Result<()>;

    async fn constraint_status(&self, schema: &str, fk: &ForeignKey) -> Result<ConstraintStatus>;

    /// Create a foreign key without checking existing rows.
    async fn add_foreign_key(&self, schema: &str, fk: &ForeignKey) -> Result<()>;

    /// Write every referencing row whose target is absent to the manifest.
    /// Returns the number of orphan rows.
    async fn export_orphans(
        &self,
        schema: &str,
        table: &Table,
        fk: &ForeignKey,
        manifest: &mut OrphanManifest,
    ) -> Result<u64>;

    /// Delete every referencing row whose target is absent.
    async fn delete_orphans(&self, schema: &str, fk: &ForeignKey) -> Result<u64>;

    /// Check existing rows against a NOT VALID foreign key.
    async fn validate_foreign_key(&self, schema: &str, fk: &ForeignKey)
        -> Result<ValidationOutcome>;

    /// Round-trip a trivial query and report the server version.
    async fn health_check(&self) -> Result<String>;
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Manifest columns for an orphan: the referencing table's key, then the
/// dangling foreign-key value when it is not already part of the key.
pub fn orphan_columns(table: &Table, fk: &ForeignKey) -> Vec<String> {
    let mut columns = table.primary_key.clone();
    if !columns.contains(&fk.column) {
        columns.push(fk.column.clone());
    }
    columns
}

pub(crate) fn create_table_sql(schema: &str, table: &Table, unlogged: bool) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| {
            format!(
                "    {} {}{}",
                quote_ident(&c.name),
                c.data_type.sql(),
                if c.is_nullable { "" } else { " NOT NULL" }
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE {}TABLE {} (\n{}\n)",
        if unlogged { "UNLOGGED " } else { "" },
        qualify_table(schema, &table.name),
        columns
    )
}

pub(crate) fn copy_in_sql(target: &str, table: &Table) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        target,
        column_list(&columns)
    )
}

/// Parameterized single-row INSERT. Every parameter is bound as text and
/// cast to the column type on the server.
pub(crate) fn insert_row_sql(schema: &str, table: &Table) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
    let placeholders = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| match c.data_type {
            ColumnType::Text => format!("${}::text", i + 1),
            other => format!("${}::text::{}", i + 1, other.sql()),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualify_table(schema, &table.name),
        column_list(&columns),
        placeholders
    )
}

pub(crate) fn null_keys_sql(schema: &str, table: &Table) -> String {
    let predicate = table
        .primary_key
        .iter()
        .map(|k| format!("{} IS NULL", quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        qualify_table(schema, &table.name),
        predicate
    )
}

pub(crate) fn duplicate_groups_sql(schema: &str, table: &Table) -> String {
    format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1) dup",
        qualify_table(schema, &table.name),
        column_list(&table.primary_key)
    )
}

/// Keeps the physically first row of each key group.
pub(crate) fn delete_duplicates_sql(schema: &str, table: &Table) -> String {
    let qualified = qualify_table(schema, &table.name);
    format!(
        "DELETE FROM {q} WHERE ctid IN (\
         SELECT ctid FROM (\
         SELECT ctid, row_number() OVER (PARTITION BY {k} ORDER BY ctid) AS rn FROM {q}\
         ) ranked WHERE rn > 1)",
        q = qualified,
        k = column_list(&table.primary_key)
    )
}

pub(crate) fn add_primary_key_sql(schema: &str, table: &Table) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
        qualify_table(schema, &table.name),
        quote_ident(&table.primary_key_name()),
        column_list(&table.primary_key)
    )
}

pub(crate) fn create_index_sql(schema: &str, table: &Table, index: &Index) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index.name),
        qualify_table(schema, &table.name),
        column_list(&index.columns)
    )
}

pub(crate) fn add_foreign_key_sql(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) NOT VALID",
        qualify_table(schema, &fk.table),
        quote_ident(&fk.name),
        quote_ident(&fk.column),
        qualify_table(schema, &fk.ref_table),
        quote_ident(&fk.ref_column)
    )
}

fn orphan_predicate(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "c.{col} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{rcol} = c.{col})",
        col = quote_ident(&fk.column),
        parent = qualify_table(schema, &fk.ref_table),
        rcol = quote_ident(&fk.ref_column)
    )
}

pub(crate) fn select_orphans_sql(schema: &str, table: &Table, fk: &ForeignKey) -> String {
    let columns = orphan_columns(table, fk)
        .iter()
        .map(|c| format!("c.{}::text", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {} c WHERE {}",
        columns,
        qualify_table(schema, &fk.table),
        orphan_predicate(schema, fk)
    )
}

pub(crate) fn delete_orphans_sql(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "DELETE FROM {} c WHERE {}",
        qualify_table(schema, &fk.table),
        orphan_predicate(schema, fk)
    )
}

pub(crate) fn validate_foreign_key_sql(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} VALIDATE CONSTRAINT {}",
        qualify_table(schema, &fk.table),
        quote_ident(&fk.name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Catalog, AUTHORSHIP, WORKS};

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("works"), "\"works\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify_table("openalex", "works"), "\"openalex\".\"works\"");
    }

    #[test]
    fn test_create_table_has_no_constraints() {
        let catalog = Catalog::standard();
        let sql = create_table_sql("openalex", catalog.table(WORKS).unwrap(), true);
        assert!(sql.starts_with("CREATE UNLOGGED TABLE \"openalex\".\"works\""));
        assert!(sql.contains("\"work_id\" text NOT NULL"));
        assert!(sql.contains("\"publication_date\" date,"));
        assert!(!sql.contains("PRIMARY KEY"));
    }

    #[test]
    fn test_insert_row_casts_through_text() {
        let catalog = Catalog::standard();
        let sql = insert_row_sql("s", catalog.table(AUTHORSHIP).unwrap());
        assert!(sql.contains("$1::text, $2::text, $3::text::integer"));
        assert!(sql.contains("$6::text::boolean"));
    }

    #[test]
    fn test_dedup_and_key_sql() {
        let catalog = Catalog::standard();
        let authorship = catalog.table(AUTHORSHIP).unwrap();
        let sql = duplicate_groups_sql("s", authorship);
        assert!(sql.contains("GROUP BY \"work_id\", \"author_id\", \"position\" HAVING COUNT(*) > 1"));

        let sql = delete_duplicates_sql("s", authorship);
        assert!(sql.contains("PARTITION BY \"work_id\", \"author_id\", \"position\" ORDER BY ctid"));
        assert!(sql.contains("rn > 1"));

        let sql = add_primary_key_sql("s", authorship);
        assert!(sql.ends_with("ADD CONSTRAINT \"pk_authorship\" PRIMARY KEY (\"work_id\", \"author_id\", \"position\")"));
    }

    #[test]
    fn test_foreign_key_sql_is_not_valid() {
        let catalog = Catalog::standard();
        let fk = catalog.foreign_key("fk_authorship_author_id").unwrap();
        let sql = add_foreign_key_sql("s", fk);
        assert!(sql.ends_with("REFERENCES \"s\".\"authors\" (\"author_id\") NOT VALID"));

        let sql = select_orphans_sql("s", catalog.table(AUTHORSHIP).unwrap(), fk);
        assert!(sql.starts_with("SELECT c.\"work_id\"::text, c.\"author_id\"::text, c.\"position\"::text FROM"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM \"s\".\"authors\" p WHERE p.\"author_id\" = c.\"author_id\")"));
    }

    #[test]
    fn test_orphan_columns_append_fk_when_not_in_key() {
        let catalog = Catalog::standard();
        let works = catalog.table(WORKS).unwrap();
        let fk = catalog.foreign_key("fk_works_source_id").unwrap();
        assert_eq!(orphan_columns(works, fk), vec!["work_id", "source_id"]);
    }
}
