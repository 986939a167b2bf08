//! Process-local run state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use super::{RunState, StateBackend, StateChange};
use crate::error::{LoadError, Result};

/// Keeps the signed state document in memory. Nothing survives the process,
/// which is what a dry run wants; tests use it to simulate restarts.
pub struct MemoryStateBackend {
    document: Mutex<Option<String>>,
    warned: AtomicBool,
    /// When set, storage calls fail until `init_schema` has run, the way a
    /// database backend fails on a target that has never been initialized.
    require_schema: bool,
    schema_ready: AtomicBool,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(None),
            warned: AtomicBool::new(false),
            require_schema: false,
            schema_ready: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn requiring_schema() -> Self {
        Self {
            require_schema: true,
            ..Self::new()
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!("Using in-memory state backend: run state will not be persisted");
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        if self.require_schema && !self.schema_ready.load(Ordering::SeqCst) {
            return Err(LoadError::State(
                "run state storage is not initialized".to_string(),
            ));
        }
        self.document
            .lock()
            .map_err(|_| LoadError::State("state lock poisoned".to_string()))
    }
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init_schema(&self) -> Result<()> {
        self.warn_once();
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let content = state.to_signed_json()?;
        *self.lock()? = Some(content);
        Ok(())
    }

    async fn load(&self) -> Result<Option<RunState>> {
        let content = self.lock()?.clone();
        content.as_deref().map(RunState::from_signed_json).transpose()
    }

    async fn update(&self, change: StateChange<'_>) -> Result<RunState> {
        let mut document = self.lock()?;
        let current = document
            .as_deref()
            .map(RunState::from_signed_json)
            .transpose()?;
        let next = change(current)?;
        *document = Some(next.to_signed_json()?);
        Ok(next)
    }

    async fn clear(&self) -> Result<()> {
        *self.lock()? = None;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
