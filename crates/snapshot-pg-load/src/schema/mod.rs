//! Relational layout of the snapshot: tables, keys, indexes and relationships.
//!
//! The catalog is static. Ingestion creates bare tables from it, and the
//! constraint phases read keys, indexes and foreign keys from it.

use crate::error::{LoadError, Result};
use crate::model::EntityKind;
use serde::Serialize;

pub const WORKS: &str = "works";
pub const AUTHORSHIP: &str = "authorship";
pub const AUTHORSHIP_INSTITUTIONS: &str = "authorship_institutions";
pub const WORK_REFERENCES: &str = "work_references";
pub const WORK_TOPICS: &str = "work_topics";
pub const AUTHORS: &str = "authors";
pub const INSTITUTIONS: &str = "institutions";
pub const SOURCES: &str = "sources";
pub const TOPICS: &str = "topics";

/// Column data types used by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    BigInt,
    Double,
    Boolean,
    Date,
}

impl ColumnType {
    /// PostgreSQL type name.
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    pub is_nullable: bool,
}

/// Index metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

/// Single-column foreign key. The referenced column is always the
/// referenced table's primary key.
#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    pub name: String,
    pub table: String,
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

/// Table metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Table {
    pub name: String,

    /// Entity kind whose records produce rows for this table.
    pub kind: EntityKind,

    /// Columns in row order; extracted rows follow this order.
    pub columns: Vec<Column>,

    /// Primary key column names.
    pub primary_key: Vec<String>,

    /// Secondary indexes, including one per foreign-key column not already
    /// leading the primary key.
    pub indexes: Vec<Index>,

    /// Foreign keys declared on this table.
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions of the primary key columns within a row.
    pub fn key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    pub fn primary_key_name(&self) -> String {
        format!("pk_{}", self.name)
    }
}

/// The full set of tables produced from a snapshot.
#[derive(Debug, Clone)]
pub struct Catalog {
    tables: Vec<Table>,
}

impl Catalog {
    /// The standard scholarly-graph layout.
    pub fn standard() -> Self {
        use ColumnType::*;

        let tables = vec![
            TableBuilder::new(WORKS, EntityKind::Works)
                .column("work_id", Text, false)
                .column("doi", Text, true)
                .column("title", Text, true)
                .column("publication_year", Integer, true)
                .column("publication_date", Date, true)
                .column("type", Text, true)
                .column("language", Text, true)
                .column("cited_by_count", BigInt, true)
                .column("is_retracted", Boolean, true)
                .column("source_id", Text, true)
                .column("updated_date", Date, true)
                .primary_key(&["work_id"])
                .references("source_id", SOURCES, "source_id")
                .index(&["publication_year"])
                .index(&["publication_date"])
                .index(&["cited_by_count"])
                .build(),
            TableBuilder::new(AUTHORSHIP, EntityKind::Works)
                .column("work_id", Text, false)
                .column("author_id", Text, false)
                .column("position", Integer, false)
                .column("author_position", Text, true)
                .column("raw_author_name", Text, true)
                .column("is_corresponding", Boolean, true)
                .primary_key(&["work_id", "author_id", "position"])
                .references("work_id", WORKS, "work_id")
                .references("author_id", AUTHORS, "author_id")
                .build(),
            TableBuilder::new(AUTHORSHIP_INSTITUTIONS, EntityKind::Works)
                .column("work_id", Text, false)
                .column("author_id", Text, false)
                .column("institution_id", Text, false)
                .primary_key(&["work_id", "author_id", "institution_id"])
                .references("work_id", WORKS, "work_id")
                .references("institution_id", INSTITUTIONS, "institution_id")
                .build(),
            TableBuilder::new(WORK_REFERENCES, EntityKind::Works)
                .column("work_id", Text, false)
                .column("referenced_work_id", Text, false)
                .primary_key(&["work_id", "referenced_work_id"])
                .references("work_id", WORKS, "work_id")
                .references("referenced_work_id", WORKS, "work_id")
                .build(),
            TableBuilder::new(WORK_TOPICS, EntityKind::Works)
                .column("work_id", Text, false)
                .column("topic_id", Text, false)
                .column("score", Double, true)
                .primary_key(&["work_id", "topic_id"])
                .references("work_id", WORKS, "work_id")
                .references("topic_id", TOPICS, "topic_id")
                .build(),
            TableBuilder::new(AUTHORS, EntityKind::Authors)
                .column("author_id", Text, false)
                .column("display_name", Text, true)
                .column("orcid", Text, true)
                .column("works_count", BigInt, true)
                .column("cited_by_count", BigInt, true)
                .column("last_known_institution_id", Text, true)
                .column("updated_date", Date, true)
                .primary_key(&["author_id"])
                .references("last_known_institution_id", INSTITUTIONS, "institution_id")
                .index(&["works_count"])
                .index(&["cited_by_count"])
                .build(),
            TableBuilder::new(INSTITUTIONS, EntityKind::Institutions)
                .column("institution_id", Text, false)
                .column("display_name", Text, true)
                .column("ror", Text, true)
                .column("country_code", Text, true)
                .column("type", Text, true)
                .column("works_count", BigInt, true)
                .column("cited_by_count", BigInt, true)
                .column("updated_date", Date, true)
                .primary_key(&["institution_id"])
                .index(&["country_code"])
                .build(),
            TableBuilder::new(SOURCES, EntityKind::Sources)
                .column("source_id", Text, false)
                .column("display_name", Text, true)
                .column("issn_l", Text, true)
                .column("type", Text, true)
                .column("publisher", Text, true)
                .column("works_count", BigInt, true)
                .column("cited_by_count", BigInt, true)
                .column("updated_date", Date, true)
                .primary_key(&["source_id"])
                .build(),
            TableBuilder::new(TOPICS, EntityKind::Topics)
                .column("topic_id", Text, false)
                .column("display_name", Text, true)
                .column("subfield", Text, true)
                .column("field", Text, true)
                .column("domain", Text, true)
                .column("works_count", BigInt, true)
                .column("cited_by_count", BigInt, true)
                .column("updated_date", Date, true)
                .primary_key(&["topic_id"])
                .build(),
        ];

        Self { tables }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables fed by records of the given kind.
    pub fn tables_for_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(move |t| t.kind == kind)
    }

    /// Every foreign key in the catalog.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &ForeignKey> {
        self.tables.iter().flat_map(|t| t.foreign_keys.iter())
    }

    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys().find(|fk| fk.name == name)
    }

    /// Resolve a scope list to tables. An empty scope means every table.
    pub fn resolve_scope(&self, scope: &[String]) -> Result<Vec<&Table>> {
        if scope.is_empty() {
            return Ok(self.tables.iter().collect());
        }
        let mut resolved = Vec::new();
        for name in scope {
            let table = self.table(name.trim()).ok_or_else(|| {
                LoadError::Config(format!(
                    "unknown table '{}' in scope (known: {})",
                    name,
                    self.tables
                        .iter()
                        .map(|t| t.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;
            if !resolved.iter().any(|t: &&Table| t.name == table.name) {
                resolved.push(table);
            }
        }
        Ok(resolved)
    }
}

struct TableBuilder {
    table: Table,
}

impl TableBuilder {
    fn new(name: &str, kind: EntityKind) -> Self {
        Self {
            table: Table {
                name: name.to_string(),
                kind,
                columns: Vec::new(),
                primary_key: Vec::new(),
                indexes: Vec::new(),
                foreign_keys: Vec::new(),
            },
        }
    }

    fn column(mut self, name: &str, data_type: ColumnType, is_nullable: bool) -> Self {
        self.table.columns.push(Column {
            name: name.to_string(),
            data_type,
            is_nullable,
        });
        self
    }

    fn primary_key(mut self, columns: &[&str]) -> Self {
        self.table.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    fn references(mut self, column: &str, ref_table: &str, ref_column: &str) -> Self {
        self.table.foreign_keys.push(ForeignKey {
            name: format!("fk_{}_{}", self.table.name, column),
            table: self.table.name.clone(),
            column: column.to_string(),
            ref_table: ref_table.to_string(),
            ref_column: ref_column.to_string(),
        });
        self
    }

    fn index(mut self, columns: &[&str]) -> Self {
        self.table.indexes.push(Index {
            name: format!("idx_{}_{}", self.table.name, columns.join("_")),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    fn build(mut self) -> Table {
        // Foreign-key columns get an index unless the primary key already leads with them.
        let leading_key = self.table.primary_key.first().cloned();
        let fk_columns: Vec<String> = self
            .table
            .foreign_keys
            .iter()
            .map(|fk| fk.column.clone())
            .filter(|c| Some(c) != leading_key.as_ref())
            .collect();
        for column in fk_columns {
            if !self
                .table
                .indexes
                .iter()
                .any(|i| i.columns.first() == Some(&column))
            {
                self = self.index(&[column.as_str()]);
            }
        }
        self.table
    }
}
