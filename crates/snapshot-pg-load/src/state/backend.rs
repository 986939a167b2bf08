//! State backend trait for run state storage.
//!
//! The orchestrator and the constraint builder hold an
//! `Arc<dyn StateBackend>` and never see where the state lives:
//!
//! - **File**: signed JSON file, `file.rs`
//! - **PostgreSQL**: a row in the target database, `db.rs`
//! - **Memory**: process-local, `memory.rs` (dry runs and tests)

use async_trait::async_trait;

use super::RunState;
use crate::error::Result;

/// A read-modify-write step applied by [`StateBackend::update`]. It receives
/// the stored state, or `None` when nothing is stored yet.
pub type StateChange<'a> = Box<dyn FnOnce(Option<RunState>) -> Result<RunState> + Send + 'a>;

/// Trait for run state persistence backends.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Initialize the storage. Safe to call multiple times.
    async fn init_schema(&self) -> Result<()>;

    /// Persist the complete run state, replacing any previous one.
    async fn save(&self, state: &RunState) -> Result<()>;

    /// Load the stored run state, verifying its signature.
    async fn load(&self) -> Result<Option<RunState>>;

    /// Load, change and save the state with no other writer in between,
    /// returning what was saved. Processes that share a backend must go
    /// through this so their changes merge instead of overwriting.
    async fn update(&self, change: StateChange<'_>) -> Result<RunState>;

    /// Remove the stored run state.
    async fn clear(&self) -> Result<()>;

    /// Get the backend type name for logging.
    fn backend_type(&self) -> &'static str;
}
