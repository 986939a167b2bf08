//! Per-table batching on the decode thread.

use std::collections::HashMap;

use async_channel::Sender;

use crate::error::{LoadError, Result};
use crate::extract::RowSet;
use crate::target::Row;

struct Lane {
    buffer: Vec<Row>,
    sender: Sender<Vec<Row>>,
}

/// Buffers extracted rows per table and hands full batches to that table's
/// writers. Runs on a blocking thread, so sends block when the channel is
/// full; that is the backpressure between decoding and the store.
pub struct BatchRouter {
    lanes: HashMap<String, Lane>,
    batch_rows: usize,
    batches_sent: u64,
}

impl BatchRouter {
    pub fn new(senders: HashMap<String, Sender<Vec<Row>>>, batch_rows: usize) -> Self {
        let lanes = senders
            .into_iter()
            .map(|(table, sender)| {
                (
                    table,
                    Lane {
                        buffer: Vec::with_capacity(batch_rows),
                        sender,
                    },
                )
            })
            .collect();
        Self {
            lanes,
            batch_rows: batch_rows.max(1),
            batches_sent: 0,
        }
    }

    /// Add the rows of one record, sending every batch that fills up.
    pub fn route(&mut self, rows: RowSet) -> Result<()> {
        for (table, rows) in rows {
            let lane = self.lanes.get_mut(table).ok_or_else(|| {
                LoadError::write(table, "no writer for table")
            })?;
            lane.buffer.extend(rows);
            if lane.buffer.len() >= self.batch_rows {
                let batch = std::mem::replace(&mut lane.buffer, Vec::with_capacity(self.batch_rows));
                send(table, &lane.sender, batch)?;
                self.batches_sent += 1;
            }
        }
        Ok(())
    }

    /// Send every partial batch and close the channels.
    pub fn close(mut self) -> Result<u64> {
        for (table, lane) in self.lanes.iter_mut() {
            if !lane.buffer.is_empty() {
                let batch = std::mem::take(&mut lane.buffer);
                send(table, &lane.sender, batch)?;
                self.batches_sent += 1;
            }
            lane.sender.close();
        }
        Ok(self.batches_sent)
    }
}

fn send(table: &str, sender: &Sender<Vec<Row>>, batch: Vec<Row>) -> Result<()> {
    sender
        .send_blocking(batch)
        .map_err(|_| LoadError::write(table, "writers stopped before the batch was accepted"))
}
