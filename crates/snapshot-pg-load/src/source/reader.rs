//! Line-at-a-time partition reader.
//!
//! Memory use is bounded by the longest line, never by partition size.

use super::WorkUnit;
use crate::error::{LoadError, Result};
use crate::model::{EntityKind, Record};
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Tolerance for malformed lines.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub max_error_rate: f64,
    pub error_rate_min_lines: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_error_rate: 0.25,
            error_rate_min_lines: 1_000,
        }
    }
}

/// Line counters for one pass over a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    /// Non-blank lines seen.
    pub lines: u64,
    /// Lines decoded into records.
    pub records: u64,
    /// Lines that were not valid UTF-8 JSON of the expected shape.
    pub malformed: u64,
    /// Well-formed documents missing a required field.
    pub rejected: u64,
}

impl ReadStats {
    pub fn error_rate(&self) -> f64 {
        if self.lines == 0 {
            0.0
        } else {
            self.malformed as f64 / self.lines as f64
        }
    }
}

/// Streams decoded records from one partition.
///
/// Malformed and rejected lines are logged with their line number and
/// skipped. Decompression errors, or a malformed ratio above the configured
/// threshold, fail the partition with `CorruptPartition`.
pub struct PartitionReader<R> {
    kind: EntityKind,
    partition: String,
    reader: R,
    options: ReaderOptions,
    line_no: u64,
    stats: ReadStats,
    buf: Vec<u8>,
    done: bool,
}

impl PartitionReader<Box<dyn BufRead + Send>> {
    /// Open a partition file. `.gz` files are decompressed as a stream,
    /// including multi-member archives.
    pub fn open(unit: &WorkUnit, options: ReaderOptions) -> Result<Self> {
        let file = File::open(&unit.path)?;
        let is_gzip = unit
            .path
            .extension()
            .map(|e| e == "gz")
            .unwrap_or(false);
        let reader: Box<dyn BufRead + Send> = if is_gzip {
            Box::new(BufReader::with_capacity(
                READ_BUFFER_BYTES,
                MultiGzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        };
        debug!("Opened partition {}", unit.partition);
        Ok(Self::new(unit.kind, unit.partition.clone(), reader, options))
    }
}

impl<R: BufRead> PartitionReader<R> {
    pub fn new(kind: EntityKind, partition: String, reader: R, options: ReaderOptions) -> Self {
        Self {
            kind,
            partition,
            reader,
            options,
            line_no: 0,
            stats: ReadStats::default(),
            buf: Vec::with_capacity(64 * 1024),
            done: false,
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Next decoded record, or None at end of partition. After an error the
    /// reader is exhausted.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let next = self.read_next();
        if next.is_err() {
            self.done = true;
        }
        next
    }

    fn read_next(&mut self) -> Result<Option<Record>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).map_err(|e| {
                LoadError::corrupt(
                    self.partition.clone(),
                    format!("read failed after line {}: {}", self.line_no, e),
                )
            })?;
            if n == 0 {
                self.done = true;
                self.check_error_rate()?;
                return Ok(None);
            }
            self.line_no += 1;

            let line = trim_line(&self.buf);
            if line.is_empty() {
                continue;
            }
            self.stats.lines += 1;

            match self.kind.decode(line) {
                Ok(record) => {
                    self.stats.records += 1;
                    return Ok(Some(record));
                }
                Err(e) if e.is_rejection() => {
                    self.stats.rejected += 1;
                    warn!(
                        kind = %self.kind,
                        partition = %self.partition,
                        line = self.line_no,
                        "Rejected record: {}",
                        e
                    );
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(
                        kind = %self.kind,
                        partition = %self.partition,
                        line = self.line_no,
                        "Malformed line: {}",
                        e
                    );
                    self.check_error_rate()?;
                }
            }
        }
    }

    /// Partitions shorter than `error_rate_min_lines` never fail on rate,
    /// including at end of stream.
    fn check_error_rate(&self) -> Result<()> {
        if self.stats.lines < self.options.error_rate_min_lines {
            return Ok(());
        }
        let rate = self.stats.error_rate();
        if rate > self.options.max_error_rate {
            return Err(LoadError::corrupt(
                self.partition.clone(),
                format!(
                    "{} of {} lines malformed ({:.1}% > {:.1}% allowed)",
                    self.stats.malformed,
                    self.stats.lines,
                    rate * 100.0,
                    self.options.max_error_rate * 100.0
                ),
            ));
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for PartitionReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let mut start = 0;
    while start < end && line[start].is_ascii_whitespace() {
        start += 1;
    }
    &line[start..end]
}
