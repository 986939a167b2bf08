//! Table writers: bulk flush with per-row fallback.

use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::FlushMode;
use crate::error::{LoadError, Result};
use crate::schema::Table;
use crate::target::{Row, TargetPool};

/// Totals from one writer task.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub rows: u64,
    pub rows_rejected: u64,
    pub batches: u64,
    /// Batches the store refused in bulk, written row by row instead.
    pub fallbacks: u64,
}

impl WriterStats {
    pub fn merge(&mut self, other: WriterStats) {
        self.rows += other.rows;
        self.rows_rejected += other.rows_rejected;
        self.batches += other.batches;
        self.fallbacks += other.fallbacks;
    }
}

/// One of several writers draining a table's batch channel.
pub struct TableWriter {
    pub(super) id: usize,
    pub(super) target: Arc<dyn TargetPool>,
    pub(super) schema: String,
    pub(super) table: Table,
    pub(super) mode: FlushMode,
    pub(super) flush_timeout: Duration,
    pub(super) partition: String,
}

impl TableWriter {
    /// Drain the channel until it closes. On a fatal error the unit token is
    /// cancelled so the decoder stops feeding the other tables.
    pub async fn run(self, rx: Receiver<Vec<Row>>, unit_cancel: CancellationToken) -> Result<WriterStats> {
        let mut stats = WriterStats::default();
        loop {
            let batch = tokio::select! {
                _ = unit_cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Ok(batch) => batch,
                    Err(_) => break,
                },
            };
            if let Err(e) = self.write_batch(&batch, &mut stats).await {
                unit_cancel.cancel();
                rx.close();
                return Err(e);
            }
            stats.batches += 1;
            debug!(
                "{} writer {} ({}): wrote {} rows (local total: {})",
                self.table.name,
                self.id,
                self.partition,
                batch.len(),
                stats.rows
            );
        }
        Ok(stats)
    }

    async fn flush(&self, rows: &[Row]) -> Result<u64> {
        let write = async {
            match self.mode {
                FlushMode::Append => self.target.copy_rows(&self.schema, &self.table, rows).await,
                FlushMode::Merge => self.target.merge_rows(&self.schema, &self.table, rows).await,
            }
        };
        match tokio::time::timeout(self.flush_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(LoadError::timeout(
                format!("flush of {} rows into {}", rows.len(), self.table.name),
                self.flush_timeout.as_secs(),
            )),
        }
    }

    /// Write a single row under the same timeout as a bulk flush.
    async fn write_row(&self, row: &Row) -> Result<()> {
        let write = async {
            match self.mode {
                FlushMode::Append => self.target.insert_row(&self.schema, &self.table, row).await,
                FlushMode::Merge => self
                    .target
                    .merge_rows(&self.schema, &self.table, std::slice::from_ref(row))
                    .await
                    .map(|_| ()),
            }
        };
        match tokio::time::timeout(self.flush_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(LoadError::timeout(
                format!("single-row write into {}", self.table.name),
                self.flush_timeout.as_secs(),
            )),
        }
    }

    async fn write_batch(&self, batch: &[Row], stats: &mut WriterStats) -> Result<()> {
        let err = match self.flush(batch).await {
            Ok(written) => {
                stats.rows += written;
                return Ok(());
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => e,
        };

        warn!(
            "{} ({}): bulk write of {} rows failed, retrying row by row: {}",
            self.table.name,
            self.partition,
            batch.len(),
            err
        );
        stats.fallbacks += 1;

        for row in batch {
            match self.write_row(row).await {
                Ok(()) => stats.rows += 1,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    stats.rows_rejected += 1;
                    warn!(
                        table = %self.table.name,
                        partition = %self.partition,
                        key = %self.describe_key(row),
                        "row rejected: {}",
                        e
                    );
                }
            }
        }
        Ok(())
    }

    fn describe_key(&self, row: &[crate::target::SqlValue]) -> String {
        self.table
            .key_positions()
            .iter()
            .map(|&i| {
                row.get(i)
                    .and_then(|v| v.to_text())
                    .unwrap_or_else(|| "NULL".to_string())
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}
