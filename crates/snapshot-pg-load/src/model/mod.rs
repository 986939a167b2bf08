//! Entity kinds and decoded snapshot records.

mod records;

pub use records::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ID_PREFIX: &str = "https://openalex.org/";

/// One of the five top-level entity kinds in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Works,
    Authors,
    Institutions,
    Sources,
    Topics,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Works,
        EntityKind::Authors,
        EntityKind::Institutions,
        EntityKind::Sources,
        EntityKind::Topics,
    ];

    /// Directory name under the snapshot root.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Works => "works",
            EntityKind::Authors => "authors",
            EntityKind::Institutions => "institutions",
            EntityKind::Sources => "sources",
            EntityKind::Topics => "topics",
        }
    }

    /// Decode one line of a partition into a typed record.
    pub fn decode(&self, line: &[u8]) -> Result<Record, DecodeError> {
        let text = std::str::from_utf8(line).map_err(|e| DecodeError::Utf8(e.to_string()))?;
        let record = match self {
            EntityKind::Works => Record::Work(serde_json::from_str(text)?),
            EntityKind::Authors => Record::Author(serde_json::from_str(text)?),
            EntityKind::Institutions => Record::Institution(serde_json::from_str(text)?),
            EntityKind::Sources => Record::Source(serde_json::from_str(text)?),
            EntityKind::Topics => Record::Topic(serde_json::from_str(text)?),
        };
        match record.id() {
            Some(_) => Ok(record),
            None => Err(DecodeError::MissingId),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                format!(
                    "unknown entity kind '{}' (expected one of works, authors, institutions, sources, topics)",
                    s
                )
            })
    }
}

/// Why a line did not produce a record.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Line is not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    Utf8(String),

    /// Line is not a JSON document of the expected shape.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed document without a usable identifier.
    #[error("missing required field `id`")]
    MissingId,
}

impl DecodeError {
    /// Rejections are well-formed documents that fail a required-field check;
    /// everything else is a malformed line and counts toward the error rate.
    pub fn is_rejection(&self) -> bool {
        matches!(self, DecodeError::MissingId)
    }
}

/// A decoded snapshot document, tagged by kind.
#[derive(Debug, Clone)]
pub enum Record {
    Work(WorkRecord),
    Author(AuthorRecord),
    Institution(InstitutionRecord),
    Source(VenueRecord),
    Topic(TopicRecord),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Work(_) => EntityKind::Works,
            Record::Author(_) => EntityKind::Authors,
            Record::Institution(_) => EntityKind::Institutions,
            Record::Source(_) => EntityKind::Sources,
            Record::Topic(_) => EntityKind::Topics,
        }
    }

    /// Normalized identifier, or None when absent or blank.
    pub fn id(&self) -> Option<String> {
        let raw = match self {
            Record::Work(r) => r.id.as_deref(),
            Record::Author(r) => r.id.as_deref(),
            Record::Institution(r) => r.id.as_deref(),
            Record::Source(r) => r.id.as_deref(),
            Record::Topic(r) => r.id.as_deref(),
        };
        raw.and_then(short_id)
    }
}

/// Strip the canonical URL prefix from an entity identifier.
///
/// `https://openalex.org/W2741809807` becomes `W2741809807`. Blank ids yield None.
pub fn short_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let id = trimmed
        .strip_prefix(ID_PREFIX)
        .or_else(|| trimmed.strip_prefix("http://openalex.org/"))
        .unwrap_or(trimmed);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
