//! In-process per-table serialization of constraint work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per table. Two phase runs with overlapping scopes never
/// touch the same table at the same time; PostgreSQL advisory locks extend
/// this across processes.
#[derive(Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, table: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Lock several tables, always in name order.
    pub async fn acquire(&self, tables: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut names: Vec<&str> = tables.to_vec();
        names.sort_unstable();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock_for(name).lock_owned().await);
        }
        guards
    }
}
