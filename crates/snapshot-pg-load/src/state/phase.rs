use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::schema::Catalog;

/// Ordered pipeline phases. Ordering follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingestion,
    Dedup,
    Keys,
    Indexes,
    ForeignKeys,
    Orphans,
    Validation,
    Done,
}

/// Phases run by the constraint builder, in order.
pub const CONSTRAINT_PHASES: [Phase; 6] = [
    Phase::Dedup,
    Phase::Keys,
    Phase::Indexes,
    Phase::ForeignKeys,
    Phase::Orphans,
    Phase::Validation,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ingestion => "ingestion",
            Phase::Dedup => "dedup",
            Phase::Keys => "keys",
            Phase::Indexes => "indexes",
            Phase::ForeignKeys => "foreign_keys",
            Phase::Orphans => "orphans",
            Phase::Validation => "validation",
            Phase::Done => "done",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Ingestion => Some(Phase::Dedup),
            Phase::Dedup => Some(Phase::Keys),
            Phase::Keys => Some(Phase::Indexes),
            Phase::Indexes => Some(Phase::ForeignKeys),
            Phase::ForeignKeys => Some(Phase::Orphans),
            Phase::Orphans => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    /// Whether this phase works per table (as opposed to per foreign key).
    pub fn is_table_phase(&self) -> bool {
        matches!(self, Phase::Dedup | Phase::Keys | Phase::Indexes)
    }

    pub fn is_constraint_phase(&self) -> bool {
        CONSTRAINT_PHASES.contains(self)
    }

    /// Items tracked for this phase: table names or foreign key names.
    pub fn items(&self, catalog: &Catalog) -> Vec<String> {
        if self.is_table_phase() {
            catalog.tables().iter().map(|t| t.name.clone()).collect()
        } else if self.is_constraint_phase() {
            catalog.foreign_keys().map(|fk| fk.name.clone()).collect()
        } else {
            Vec::new()
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "ingestion" => Ok(Phase::Ingestion),
            "dedup" => Ok(Phase::Dedup),
            "keys" | "primary_keys" => Ok(Phase::Keys),
            "indexes" => Ok(Phase::Indexes),
            "foreign_keys" | "fks" => Ok(Phase::ForeignKeys),
            "orphans" => Ok(Phase::Orphans),
            "validation" | "validate" => Ok(Phase::Validation),
            "done" => Ok(Phase::Done),
            other => Err(LoadError::Config(format!(
                "Unknown phase '{}'. Valid phases: dedup, keys, indexes, foreign-keys, orphans, validation",
                other
            ))),
        }
    }
}
