//! Bulk loading of one work unit.
//!
//! A unit is loaded by a small pipeline:
//! - a blocking decode thread reads the partition, extracts every record once
//!   and batches the rows per destination table ([`BatchRouter`])
//! - per table, `writers_per_table` async writers drain a bounded channel and
//!   flush each batch with COPY (append) or a staged merge ([`TableWriter`])
//!
//! A flush that fails for a data reason is retried row by row so one bad row
//! only costs itself. Transient failures and timeouts fail the unit, which
//! the orchestrator retries in merge mode.

mod router;
mod writer;

pub use router::BatchRouter;
pub use writer::{TableWriter, WriterStats};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{LoadError, Result};
use crate::extract::extract;
use crate::schema::Catalog;
use crate::source::{PartitionReader, ReadStats, ReaderOptions, WorkUnit};
use crate::state::UnitOutcome;
use crate::target::{Row, TargetPool};

/// How batches are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// COPY straight into the table.
    Append,
    /// Replace rows sharing a key, so a rerun does not duplicate.
    Merge,
}

/// Loader tuning, resolved from the configuration.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub schema: String,
    pub batch_rows: usize,
    pub writers_per_table: usize,
    pub channel_depth: usize,
    pub flush_timeout: Duration,
    pub reader: ReaderOptions,
}

impl LoaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema: config.target.schema.clone(),
            batch_rows: config.load.get_batch_rows(),
            writers_per_table: config.load.get_writers_per_table(),
            channel_depth: config.load.get_channel_depth(),
            flush_timeout: Duration::from_secs(config.load.flush_timeout_secs),
            reader: ReaderOptions {
                max_error_rate: config.load.max_error_rate,
                error_rate_min_lines: config.load.error_rate_min_lines,
            },
        }
    }
}

/// Loads work units into the target.
pub struct BulkLoader {
    target: Arc<dyn TargetPool>,
    catalog: Arc<Catalog>,
    options: LoaderOptions,
}

/// What the decode thread reports.
struct DecodeSummary {
    stats: ReadStats,
    field_issues: u64,
}

impl BulkLoader {
    pub fn new(target: Arc<dyn TargetPool>, catalog: Arc<Catalog>, options: LoaderOptions) -> Self {
        Self {
            target,
            catalog,
            options,
        }
    }

    /// Load one partition. Every table fed by the unit's kind receives its
    /// rows; the unit succeeds only if every writer does.
    pub async fn load_unit(
        &self,
        unit: &WorkUnit,
        mode: FlushMode,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome> {
        if unit.missing {
            return Err(LoadError::corrupt(
                &unit.partition,
                "listed in the snapshot manifest but not present on disk",
            ));
        }

        let start = Instant::now();
        let unit_cancel = cancel.child_token();
        let mut senders = HashMap::new();
        let mut writers: JoinSet<(String, Result<WriterStats>)> = JoinSet::new();

        for table in self.catalog.tables_for_kind(unit.kind) {
            let (tx, rx) = async_channel::bounded::<Vec<Row>>(self.options.channel_depth.max(1));
            senders.insert(table.name.clone(), tx);

            for id in 0..self.options.writers_per_table.max(1) {
                let writer = TableWriter {
                    id,
                    target: self.target.clone(),
                    schema: self.options.schema.clone(),
                    table: table.clone(),
                    mode,
                    flush_timeout: self.options.flush_timeout,
                    partition: unit.partition.clone(),
                };
                let rx = rx.clone();
                let token = unit_cancel.clone();
                let name = table.name.clone();
                writers.spawn(async move { (name, writer.run(rx, token).await) });
            }
        }

        let decode = {
            let unit = unit.clone();
            let options = self.options.reader;
            let batch_rows = self.options.batch_rows;
            let token = unit_cancel.clone();
            tokio::task::spawn_blocking(move || decode_unit(&unit, options, senders, batch_rows, &token))
        };

        let decoded = match decode.await {
            Ok(res) => res,
            Err(e) => Err(LoadError::corrupt(
                &unit.partition,
                format!("decode task panicked: {}", e),
            )),
        };
        if decoded.is_err() {
            unit_cancel.cancel();
        }

        let mut rows: BTreeMap<String, u64> = BTreeMap::new();
        let mut totals = WriterStats::default();
        let mut writer_error: Option<LoadError> = None;
        while let Some(joined) = writers.join_next().await {
            match joined {
                Ok((table, Ok(stats))) => {
                    *rows.entry(table).or_default() += stats.rows;
                    totals.merge(stats);
                }
                Ok((table, Err(e))) => {
                    warn!("{} ({}): writer failed: {}", table, unit.partition, e);
                    writer_error.get_or_insert(e);
                }
                Err(e) => {
                    writer_error.get_or_insert(LoadError::write(
                        "unknown",
                        format!("writer task panicked: {}", e),
                    ));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if let Some(e) = writer_error {
            return Err(e);
        }
        let summary = decoded?;

        let elapsed = start.elapsed();
        let total_rows: u64 = rows.values().sum();
        info!(
            "{}: {} records ({} malformed, {} rejected) -> {} rows in {} batches, {:?} ({} rows/sec, {} field issues, {} bulk fallbacks, {} rows refused)",
            unit.partition,
            summary.stats.records,
            summary.stats.malformed,
            summary.stats.rejected,
            total_rows,
            totals.batches,
            elapsed,
            if elapsed.as_secs_f64() > 0.0 {
                (total_rows as f64 / elapsed.as_secs_f64()) as u64
            } else {
                0
            },
            summary.field_issues,
            totals.fallbacks,
            totals.rows_rejected
        );

        Ok(UnitOutcome {
            stats: summary.stats,
            rows,
            rows_rejected: totals.rows_rejected,
            bulk_fallbacks: totals.fallbacks,
        })
    }
}

/// Decode, extract and route every record of a unit. Runs on a blocking thread.
fn decode_unit(
    unit: &WorkUnit,
    options: ReaderOptions,
    senders: HashMap<String, async_channel::Sender<Vec<Row>>>,
    batch_rows: usize,
    cancel: &CancellationToken,
) -> Result<DecodeSummary> {
    let mut reader = PartitionReader::open(unit, options)?;
    let mut router = BatchRouter::new(senders, batch_rows);
    let mut field_issues = 0u64;

    while let Some(record) = reader.next_record()? {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let extracted = extract(&record);
        for issue in &extracted.issues {
            field_issues += 1;
            warn!(
                kind = %unit.kind,
                partition = %unit.partition,
                line = reader.stats().lines,
                id = %extracted.id,
                field = %issue.field,
                "field skipped: {}",
                issue.message
            );
        }
        router.route(extracted.rows)?;
    }

    router.close()?;
    Ok(DecodeSummary {
        stats: reader.stats(),
        field_issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetMode;
    use crate::model::EntityKind;
    use crate::schema::{AUTHORSHIP, WORKS, WORK_REFERENCES};
    use crate::target::MemoryPool;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const SCHEMA: &str = "openalex";

    fn write_gz(path: &Path, lines: &[String]) {
        let file = std::fs::File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::fast());
        for line in lines {
            writeln!(enc, "{}", line).unwrap();
        }
        enc.finish().unwrap();
    }

    fn work_line(i: usize) -> String {
        format!(
            r#"{{"id":"https://openalex.org/W{i}","title":"Paper {i}","publication_year":2020,"authorships":[{{"author_position":"first","author":{{"id":"https://openalex.org/A{i}"}},"institutions":[]}}],"referenced_works":["https://openalex.org/W1"]}}"#
        )
    }

    fn options(batch_rows: usize) -> LoaderOptions {
        LoaderOptions {
            schema: SCHEMA.to_string(),
            batch_rows,
            writers_per_table: 2,
            channel_depth: 2,
            flush_timeout: Duration::from_secs(30),
            reader: ReaderOptions::default(),
        }
    }

    async fn setup(batch_rows: usize) -> (Arc<MemoryPool>, BulkLoader) {
        let catalog = Arc::new(Catalog::standard());
        let pool = Arc::new(MemoryPool::new());
        pool.create_schema(SCHEMA).await.unwrap();
        for table in catalog.tables() {
            pool.prepare_table(SCHEMA, table, TargetMode::Keep, false)
                .await
                .unwrap();
        }
        let loader = BulkLoader::new(pool.clone(), catalog, options(batch_rows));
        (pool, loader)
    }

    fn unit(path: &Path) -> WorkUnit {
        WorkUnit {
            kind: EntityKind::Works,
            partition: "works/updated_date=2024-01-01/part_000.gz".to_string(),
            path: path.to_path_buf(),
            bytes: 0,
            expected_records: None,
            missing: false,
        }
    }

    #[tokio::test]
    async fn test_fan_out_into_every_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_000.gz");
        let mut lines: Vec<String> = (0..25).map(work_line).collect();
        lines.insert(3, "{not json".to_string());
        write_gz(&path, &lines);

        let (pool, loader) = setup(7).await;
        let outcome = loader
            .load_unit(&unit(&path), FlushMode::Append, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats.records, 25);
        assert_eq!(outcome.stats.malformed, 1);
        assert_eq!(outcome.rows[WORKS], 25);
        assert_eq!(outcome.rows[AUTHORSHIP], 25);
        assert_eq!(outcome.rows[WORK_REFERENCES], 25);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 25);
        assert_eq!(pool.row_count(SCHEMA, AUTHORSHIP).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_merge_rerun_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_000.gz");
        write_gz(&path, &(0..10).map(work_line).collect::<Vec<_>>());

        let (pool, loader) = setup(4).await;
        let token = CancellationToken::new();
        loader
            .load_unit(&unit(&path), FlushMode::Append, &token)
            .await
            .unwrap();
        loader
            .load_unit(&unit(&path), FlushMode::Merge, &token)
            .await
            .unwrap();

        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 10);
        assert_eq!(pool.row_count(SCHEMA, AUTHORSHIP).await.unwrap(), 10);
        assert_eq!(pool.row_count(SCHEMA, WORK_REFERENCES).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_bad_row_is_isolated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_000.gz");
        let mut lines: Vec<String> = (0..5).map(work_line).collect();
        lines.push(
            r#"{"id":"https://openalex.org/W99","title":"bad\u0000title"}"#.to_string(),
        );
        write_gz(&path, &lines);

        let (pool, loader) = setup(100).await;
        let outcome = loader
            .load_unit(&unit(&path), FlushMode::Append, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.rows_rejected, 1);
        assert_eq!(outcome.bulk_fallbacks, 1);
        assert_eq!(outcome.rows[WORKS], 5);
        assert_eq!(pool.row_count(SCHEMA, WORKS).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_transient_failure_fails_unit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_000.gz");
        write_gz(&path, &(0..3).map(work_line).collect::<Vec<_>>());

        let (pool, loader) = setup(100).await;
        pool.inject_transient_failures(1);
        let err = loader
            .load_unit(&unit(&path), FlushMode::Append, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_partition_fails() {
        let (_pool, loader) = setup(10).await;
        let mut missing = unit(Path::new("/nonexistent/part.gz"));
        missing.missing = true;
        let err = loader
            .load_unit(&missing, FlushMode::Append, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::CorruptPartition { .. }));
    }
}
