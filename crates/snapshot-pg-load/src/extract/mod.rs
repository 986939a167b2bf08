//! Fan-out of decoded records into per-table rows.
//!
//! Extraction is pure: one record in, every row it implies out, plus any
//! field-level problems. A bad field becomes NULL (or drops the child row it
//! identifies) and is reported; it never fails the record.

use crate::model::{short_id, Record, WorkRecord};
use crate::schema;
use crate::target::{Row, SqlValue};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Rows produced from one or more records, grouped by table.
#[derive(Debug, Default)]
pub struct RowSet {
    rows: BTreeMap<&'static str, Vec<Row>>,
}

impl RowSet {
    pub fn push(&mut self, table: &'static str, row: Row) {
        self.rows.entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.rows.get(table).map(|r| r.as_slice()).unwrap_or(&[])
    }
}

impl IntoIterator for RowSet {
    type Item = (&'static str, Vec<Row>);
    type IntoIter = std::collections::btree_map::IntoIter<&'static str, Vec<Row>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// A field that could not be mapped cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

/// Result of extracting one record.
#[derive(Debug, Default)]
pub struct Extracted {
    pub id: String,
    pub rows: RowSet,
    pub issues: Vec<FieldIssue>,
}

impl Extracted {
    fn issue(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(FieldIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Parse an ISO date, keeping only the date part of timestamps.
    fn date(&mut self, field: &str, value: Option<&str>) -> SqlValue {
        let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) else {
            return SqlValue::Null;
        };
        let date_part = raw.get(..10).unwrap_or(raw);
        match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            Ok(d) => SqlValue::Date(d),
            Err(e) => {
                self.issue(field, format!("unparseable date '{}': {}", raw, e));
                SqlValue::Null
            }
        }
    }
}

/// Map a decoded record to the rows of every table it feeds.
///
/// The record must carry an id; decoding rejects records without one.
pub fn extract(record: &Record) -> Extracted {
    let mut out = Extracted {
        id: record.id().unwrap_or_default(),
        ..Default::default()
    };
    let id = SqlValue::Text(out.id.clone());

    match record {
        Record::Work(work) => extract_work(work, id, &mut out),
        Record::Author(author) => {
            let institution = author
                .latest_institution()
                .and_then(|i| i.id.as_deref())
                .and_then(short_id);
            let updated = out.date("updated_date", author.updated_date.as_deref());
            out.rows.push(
                schema::AUTHORS,
                vec![
                    id,
                    SqlValue::text(author.display_name.as_deref()),
                    SqlValue::text(author.orcid.as_deref()),
                    opt_i64(author.works_count),
                    opt_i64(author.cited_by_count),
                    SqlValue::text(institution.as_deref()),
                    updated,
                ],
            );
        }
        Record::Institution(inst) => {
            let updated = out.date("updated_date", inst.updated_date.as_deref());
            out.rows.push(
                schema::INSTITUTIONS,
                vec![
                    id,
                    SqlValue::text(inst.display_name.as_deref()),
                    SqlValue::text(inst.ror.as_deref()),
                    SqlValue::text(inst.country_code.as_deref()),
                    SqlValue::text(inst.institution_type.as_deref()),
                    opt_i64(inst.works_count),
                    opt_i64(inst.cited_by_count),
                    updated,
                ],
            );
        }
        Record::Source(venue) => {
            let updated = out.date("updated_date", venue.updated_date.as_deref());
            out.rows.push(
                schema::SOURCES,
                vec![
                    id,
                    SqlValue::text(venue.display_name.as_deref()),
                    SqlValue::text(venue.issn_l.as_deref()),
                    SqlValue::text(venue.source_type.as_deref()),
                    SqlValue::text(venue.host_organization_name.as_deref()),
                    opt_i64(venue.works_count),
                    opt_i64(venue.cited_by_count),
                    updated,
                ],
            );
        }
        Record::Topic(topic) => {
            let name = |r: &Option<crate::model::EntityRef>| {
                SqlValue::text(r.as_ref().and_then(|e| e.display_name.as_deref()))
            };
            let updated = out.date("updated_date", topic.updated_date.as_deref());
            out.rows.push(
                schema::TOPICS,
                vec![
                    id,
                    SqlValue::text(topic.display_name.as_deref()),
                    name(&topic.subfield),
                    name(&topic.field),
                    name(&topic.domain),
                    opt_i64(topic.works_count),
                    opt_i64(topic.cited_by_count),
                    updated,
                ],
            );
        }
    }

    out
}

fn extract_work(work: &WorkRecord, id: SqlValue, out: &mut Extracted) {
    let source_id = work
        .primary_location
        .as_ref()
        .and_then(|l| l.source.as_ref())
        .and_then(|s| s.id.as_deref())
        .and_then(short_id);
    let publication_date = out.date("publication_date", work.publication_date.as_deref());
    let updated = out.date("updated_date", work.updated_date.as_deref());

    out.rows.push(
        schema::WORKS,
        vec![
            id.clone(),
            SqlValue::text(work.doi.as_deref()),
            SqlValue::text(work.title.as_deref().or(work.display_name.as_deref())),
            work.publication_year.map(SqlValue::I32).unwrap_or(SqlValue::Null),
            publication_date,
            SqlValue::text(work.work_type.as_deref()),
            SqlValue::text(work.language.as_deref()),
            opt_i64(work.cited_by_count),
            work.is_retracted.map(SqlValue::Bool).unwrap_or(SqlValue::Null),
            SqlValue::text(source_id.as_deref()),
            updated,
        ],
    );

    for (position, authorship) in work.authorships.iter().enumerate() {
        let author_id = authorship
            .author
            .as_ref()
            .and_then(|a| a.id.as_deref())
            .and_then(short_id);
        let Some(author_id) = author_id else {
            out.issue(
                format!("authorships[{}].author.id", position),
                "missing author id, authorship dropped",
            );
            continue;
        };

        out.rows.push(
            schema::AUTHORSHIP,
            vec![
                id.clone(),
                SqlValue::Text(author_id.clone()),
                SqlValue::I32(position as i32),
                SqlValue::text(authorship.author_position.as_deref()),
                SqlValue::text(authorship.raw_author_name.as_deref()),
                authorship
                    .is_corresponding
                    .map(SqlValue::Bool)
                    .unwrap_or(SqlValue::Null),
            ],
        );

        for institution in &authorship.institutions {
            match institution.id.as_deref().and_then(short_id) {
                Some(institution_id) => out.rows.push(
                    schema::AUTHORSHIP_INSTITUTIONS,
                    vec![
                        id.clone(),
                        SqlValue::Text(author_id.clone()),
                        SqlValue::Text(institution_id),
                    ],
                ),
                // Unaffiliated placeholders carry a name but no id.
                None => continue,
            }
        }
    }

    for referenced in work.referenced_works.iter().flatten() {
        if let Some(referenced_id) = short_id(referenced) {
            out.rows.push(
                schema::WORK_REFERENCES,
                vec![id.clone(), SqlValue::Text(referenced_id)],
            );
        }
    }

    for (i, topic) in work.topics.iter().enumerate() {
        match topic.id.as_deref().and_then(short_id) {
            Some(topic_id) => out.rows.push(
                schema::WORK_TOPICS,
                vec![
                    id.clone(),
                    SqlValue::Text(topic_id),
                    topic.score.map(SqlValue::F64).unwrap_or(SqlValue::Null),
                ],
            ),
            None => out.issue(format!("topics[{}].id", i), "missing topic id, topic dropped"),
        }
    }
}

fn opt_i64(value: Option<i64>) -> SqlValue {
    value.map(SqlValue::I64).unwrap_or(SqlValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::schema::Catalog;

    fn decode(kind: EntityKind, json: &str) -> Record {
        kind.decode(json.as_bytes()).unwrap()
    }

    const WORK: &str = r#"{
        "id": "https://openalex.org/W10",
        "doi": "https://doi.org/10.1/x",
        "title": "Graphs",
        "publication_year": 2021,
        "publication_date": "2021-03-04",
        "type": "article",
        "cited_by_count": 12,
        "is_retracted": false,
        "updated_date": "2024-01-02T03:04:05.678",
        "primary_location": {"source": {"id": "https://openalex.org/S5"}},
        "authorships": [
            {"author_position": "first", "author": {"id": "https://openalex.org/A1"},
             "institutions": [{"id": "https://openalex.org/I1"}, {"id": null, "display_name": "Unknown"}],
             "raw_author_name": "Ada"},
            {"author_position": "middle", "author": {"id": null}},
            {"author_position": "last", "author": {"id": "https://openalex.org/A2"}, "institutions": null}
        ],
        "referenced_works": ["https://openalex.org/W1", null, "https://openalex.org/W2"],
        "topics": [{"id": "https://openalex.org/T9", "score": 0.9}]
    }"#;

    #[test]
    fn test_work_fans_out_to_child_tables() {
        let out = extract(&decode(EntityKind::Works, WORK));
        assert_eq!(out.id, "W10");

        let works = out.rows.rows(schema::WORKS);
        assert_eq!(works.len(), 1);
        assert_eq!(works[0][0], SqlValue::Text("W10".into()));
        assert_eq!(works[0][9], SqlValue::Text("S5".into()));
        assert_eq!(
            works[0][10],
            SqlValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );

        let authorship = out.rows.rows(schema::AUTHORSHIP);
        assert_eq!(authorship.len(), 2);
        // Positions follow the source order even when an entry is dropped.
        assert_eq!(authorship[0][2], SqlValue::I32(0));
        assert_eq!(authorship[1][2], SqlValue::I32(2));

        assert_eq!(out.rows.rows(schema::AUTHORSHIP_INSTITUTIONS).len(), 1);
        assert_eq!(out.rows.rows(schema::WORK_REFERENCES).len(), 2);
        assert_eq!(out.rows.rows(schema::WORK_TOPICS).len(), 1);

        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].field, "authorships[1].author.id");
    }

    #[test]
    fn test_rows_match_catalog_width() {
        let catalog = Catalog::standard();
        let records = [
            decode(EntityKind::Works, WORK),
            decode(EntityKind::Authors, r#"{"id":"A1","last_known_institutions":[{"id":"https://openalex.org/I1"}]}"#),
            decode(EntityKind::Institutions, r#"{"id":"I1","country_code":"NZ"}"#),
            decode(EntityKind::Sources, r#"{"id":"S1","issn_l":"1234-5678"}"#),
            decode(EntityKind::Topics, r#"{"id":"T1","field":{"display_name":"Physics"}}"#),
        ];
        for record in &records {
            for (table, rows) in extract(record).rows {
                let width = catalog.table(table).unwrap().columns.len();
                for row in rows {
                    assert_eq!(row.len(), width, "{}", table);
                }
            }
        }
    }

    #[test]
    fn test_bad_date_becomes_null_with_issue() {
        let out = extract(&decode(
            EntityKind::Works,
            r#"{"id":"W1","publication_date":"2021-13-45"}"#,
        ));
        assert_eq!(out.rows.rows(schema::WORKS)[0][4], SqlValue::Null);
        assert_eq!(out.issues[0].field, "publication_date");
    }

    #[test]
    fn test_author_institution_normalized() {
        let out = extract(&decode(
            EntityKind::Authors,
            r#"{"id":"https://openalex.org/A7","last_known_institution":{"id":"https://openalex.org/I3"}}"#,
        ));
        let row = &out.rows.rows(schema::AUTHORS)[0];
        assert_eq!(row[0], SqlValue::Text("A7".into()));
        assert_eq!(row[5], SqlValue::Text("I3".into()));
    }
}
