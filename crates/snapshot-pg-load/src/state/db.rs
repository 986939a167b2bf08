//! Database-backed run state.
//!
//! Stores the signed state document in the `_snapshot_load` schema of the
//! target database, so a resume from another host sees the same progress.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::error::SqlState;
use tracing::debug;

use super::{RunState, StateBackend, StateChange};
use crate::error::{LoadError, Result};

const STATE_KEY: &str = "current";
/// Advisory lock key serializing read-modify-write updates of the state row.
const UPDATE_LOCK: &str = "_snapshot_load.run_state";

/// Database state backend.
pub struct DbStateBackend {
    pool: Pool,
    schema: String,
}

impl DbStateBackend {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schema: "_snapshot_load".to_string(),
        }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| LoadError::pool(e, "getting state connection"))
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT state::text FROM {}.run_state WHERE state_key = $1",
            self.schema
        )
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {}.run_state (state_key, run_id, phase, state, updated_at)
             VALUES ($1, $2, $3, $4::text::jsonb, NOW())
             ON CONFLICT (state_key) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                phase = EXCLUDED.phase,
                state = EXCLUDED.state,
                updated_at = NOW()",
            self.schema
        )
    }
}

#[async_trait]
impl StateBackend for DbStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.client().await?;

        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.run_state (
                    state_key TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    state JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let content = state.to_signed_json()?;
        let conn = self.client().await?;
        conn.execute(
            &self.upsert_sql(),
            &[&STATE_KEY, &state.run_id, &state.phase.as_str(), &content],
        )
        .await?;
        debug!("Saved run state {} to database", state.run_id);
        Ok(())
    }

    async fn load(&self) -> Result<Option<RunState>> {
        let conn = self.client().await?;
        let row = match conn.query_opt(&self.select_sql(), &[&STATE_KEY]).await {
            Ok(row) => row,
            // Nothing was ever stored on this target.
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => return Ok(None),
            Err(e) => return Err(LoadError::Target(e)),
        };

        match row {
            Some(row) => {
                let content: String = row.get(0);
                RunState::from_signed_json(&content).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn update(&self, change: StateChange<'_>) -> Result<RunState> {
        let mut conn = self.client().await?;
        let tx = conn.transaction().await?;
        // The row may not exist yet, so FOR UPDATE alone cannot serialize writers.
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&UPDATE_LOCK])
            .await?;

        let current = match tx.query_opt(&self.select_sql(), &[&STATE_KEY]).await? {
            Some(row) => {
                let content: String = row.get(0);
                Some(RunState::from_signed_json(&content)?)
            }
            None => None,
        };
        let next = change(current)?;

        let content = next.to_signed_json()?;
        tx.execute(
            &self.upsert_sql(),
            &[&STATE_KEY, &next.run_id, &next.phase.as_str(), &content],
        )
        .await?;
        tx.commit().await?;
        debug!("Updated run state {} in database", next.run_id);
        Ok(next)
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(
            &format!("DELETE FROM {}.run_state WHERE state_key = $1", self.schema),
            &[&STATE_KEY],
        )
        .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
