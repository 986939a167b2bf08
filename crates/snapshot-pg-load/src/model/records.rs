//! Typed views of snapshot documents.
//!
//! Only the fields the relational schema needs are declared; everything else
//! in a document is ignored by serde. Arrays that the snapshot sometimes
//! writes as `null` are read as empty.

use serde::{Deserialize, Deserializer};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkRecord {
    pub id: Option<String>,
    pub doi: Option<String>,
    pub title: Option<String>,
    pub display_name: Option<String>,
    pub publication_year: Option<i32>,
    pub publication_date: Option<String>,
    #[serde(rename = "type")]
    pub work_type: Option<String>,
    pub language: Option<String>,
    pub cited_by_count: Option<i64>,
    pub is_retracted: Option<bool>,
    pub updated_date: Option<String>,
    pub primary_location: Option<Location>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub authorships: Vec<Authorship>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub referenced_works: Vec<Option<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub topics: Vec<TopicScore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub source: Option<EntityRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authorship {
    pub author_position: Option<String>,
    pub author: Option<EntityRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub institutions: Vec<EntityRef>,
    pub raw_author_name: Option<String>,
    pub is_corresponding: Option<bool>,
}

/// Reference to another entity embedded inside a document.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicScore {
    pub id: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorRecord {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub orcid: Option<String>,
    pub works_count: Option<i64>,
    pub cited_by_count: Option<i64>,
    pub last_known_institution: Option<EntityRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_known_institutions: Vec<EntityRef>,
    pub updated_date: Option<String>,
}

impl AuthorRecord {
    /// Newer snapshots carry a list; older ones a single object.
    pub fn latest_institution(&self) -> Option<&EntityRef> {
        self.last_known_institutions
            .first()
            .or(self.last_known_institution.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstitutionRecord {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub ror: Option<String>,
    pub country_code: Option<String>,
    #[serde(rename = "type")]
    pub institution_type: Option<String>,
    pub works_count: Option<i64>,
    pub cited_by_count: Option<i64>,
    pub updated_date: Option<String>,
}

/// A publication venue (journal, repository, conference).
#[derive(Debug, Clone, Deserialize)]
pub struct VenueRecord {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub issn_l: Option<String>,
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    pub host_organization_name: Option<String>,
    pub works_count: Option<i64>,
    pub cited_by_count: Option<i64>,
    pub updated_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicRecord {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub subfield: Option<EntityRef>,
    pub field: Option<EntityRef>,
    pub domain: Option<EntityRef>,
    pub works_count: Option<i64>,
    pub cited_by_count: Option<i64>,
    pub updated_date: Option<String>,
}
