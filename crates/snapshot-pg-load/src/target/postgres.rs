//! PostgreSQL implementation of [`TargetPool`].

use super::{
    add_foreign_key_sql, add_primary_key_sql, copy_in_sql, create_index_sql, create_table_sql,
    delete_duplicates_sql, delete_orphans_sql, duplicate_groups_sql, insert_row_sql,
    make_connector, null_keys_sql, qualify_table, quote_ident, select_orphans_sql,
    validate_foreign_key_sql, ConstraintStatus, Row, SqlValue, TargetPool, ValidationOutcome,
};
use crate::config::{TargetConfig, TargetMode};
use crate::constraints::OrphanManifest;
use crate::error::{LoadError, Result};
use crate::schema::{ForeignKey, Index, Table};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{SinkExt, TryStreamExt};
use std::time::Duration;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig};
use tracing::{debug, info, warn};

/// Connection timeout for pool connections.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// COPY data is sent in chunks of roughly this size.
const COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// PostgreSQL target pool implementation.
pub struct PgPool {
    pool: Pool,
    statement_timeout: Duration,
}

impl PgPool {
    /// Create a new PostgreSQL target pool and test one connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("snapshot-pg-load");

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match make_connector(&config.ssl_mode)? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                pg_config.ssl_mode(PgSslMode::Disable);
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
            Some(connector) => {
                let mode = match config.ssl_mode.to_lowercase().as_str() {
                    "allow" | "prefer" => PgSslMode::Prefer,
                    _ => PgSslMode::Require,
                };
                pg_config.ssl_mode(mode);
                Manager::from_config(pg_config, connector, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| LoadError::pool(e, "creating PostgreSQL target pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| LoadError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            statement_timeout: Duration::from_secs(3_600),
        })
    }

    /// Timeout applied to every constraint DDL statement.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Underlying connection pool, shared with the database state backend.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| LoadError::pool(e, context.to_string()))
    }

    fn map_ddl_error(&self, e: tokio_postgres::Error, operation: &str) -> LoadError {
        if e.code() == Some(&SqlState::QUERY_CANCELED) {
            return LoadError::timeout(operation, self.statement_timeout.as_secs());
        }
        LoadError::Target(e)
    }

    /// Run one DDL or DML statement in its own transaction, holding the
    /// table's advisory lock and the statement timeout.
    async fn locked_execute(&self, lock_key: &str, sql: &str, operation: &str) -> Result<u64> {
        let mut client = self.client(operation).await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .await?;
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&lock_key])
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?;
        debug!("{}: {}", operation, sql);
        let affected = tx
            .execute(sql, &[])
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?;
        tx.commit().await?;
        Ok(affected)
    }

    /// Same as `locked_execute` for a single-value COUNT query.
    async fn locked_count(&self, lock_key: &str, sql: &str, operation: &str) -> Result<i64> {
        let mut client = self.client(operation).await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .await?;
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&lock_key])
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?;
        let row = tx
            .query_one(sql, &[])
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?;
        tx.commit().await?;
        Ok(row.get(0))
    }

    async fn table_exists(&self, client: &Client, schema: &str, table: &str) -> Result<bool> {
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&schema, &table],
            )
            .await?;
        Ok(row.get(0))
    }
}

/// Stream rows to the server with COPY text format.
async fn copy_text(client: &Client, statement: &str, rows: &[Row]) -> Result<u64> {
    let sink = client.copy_in::<_, Bytes>(statement).await?;
    futures::pin_mut!(sink);

    let mut buf = String::with_capacity(COPY_CHUNK_BYTES);
    for row in rows {
        super::encode_copy_row(row, &mut buf);
        if buf.len() >= COPY_CHUNK_BYTES {
            sink.send(Bytes::from(std::mem::take(&mut buf))).await?;
        }
    }
    if !buf.is_empty() {
        sink.send(Bytes::from(buf)).await?;
    }

    Ok(sink.finish().await?)
}

fn row_params(row: &[SqlValue]) -> Vec<Option<String>> {
    row.iter().map(SqlValue::to_text).collect()
}

#[async_trait]
impl TargetPool for PgPool {
    async fn create_schema(&self, schema: &str) -> Result<()> {
        let client = self.client("creating schema").await?;
        client
            .execute(
                &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn prepare_table(
        &self,
        schema: &str,
        table: &Table,
        mode: TargetMode,
        unlogged: bool,
    ) -> Result<()> {
        let client = self.client("preparing table").await?;
        let qualified = qualify_table(schema, &table.name);

        if mode == TargetMode::DropRecreate {
            client
                .batch_execute(&format!("DROP TABLE IF EXISTS {} CASCADE", qualified))
                .await?;
        }

        if !self.table_exists(&client, schema, &table.name).await? {
            client
                .batch_execute(&create_table_sql(schema, table, unlogged))
                .await?;
            info!("Created table {}", qualified);
            return Ok(());
        }

        match mode {
            TargetMode::Truncate => {
                client
                    .batch_execute(&format!("TRUNCATE TABLE {}", qualified))
                    .await?;
                info!("Truncated table {}", qualified);
            }
            TargetMode::Keep | TargetMode::DropRecreate => {
                // Columns added to the catalog since the table was created.
                for column in &table.columns {
                    client
                        .batch_execute(&format!(
                            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                            qualified,
                            quote_ident(&column.name),
                            column.data_type.sql()
                        ))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn set_table_logged(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.client("setting table logged").await?;
        client
            .batch_execute(&format!("ALTER TABLE {} SET LOGGED", qualify_table(schema, table)))
            .await?;
        debug!("Set table {}.{} to LOGGED", schema, table);
        Ok(())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.client("counting rows").await?;
        let row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", qualify_table(schema, table)),
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn copy_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let client = self.client("bulk copy").await?;
        let statement = copy_in_sql(&qualify_table(schema, &table.name), table);
        copy_text(&client, &statement, rows).await
    }

    async fn merge_rows(&self, schema: &str, table: &Table, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.client("merge").await?;
        let qualified = qualify_table(schema, &table.name);
        let staging = quote_ident(&format!("_stage_{}", table.name));

        // Temp tables are per session; a pooled connection reuses its own.
        client
            .batch_execute(&format!(
                "CREATE TEMP TABLE IF NOT EXISTS {s} (LIKE {t} INCLUDING DEFAULTS); TRUNCATE {s}",
                s = staging,
                t = qualified
            ))
            .await?;
        copy_text(&client, &copy_in_sql(&staging, table), rows).await?;

        let columns = table
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let keys = table
            .primary_key
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>();
        let key_match = keys
            .iter()
            .map(|k| format!("t.{k} = s.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let tx = client.transaction().await?;
        let replaced = tx
            .execute(
                &format!(
                    "DELETE FROM {} t USING {} s WHERE {}",
                    qualified, staging, key_match
                ),
                &[],
            )
            .await?;
        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {t} ({c}) SELECT DISTINCT ON ({k}) {c} FROM {s} ORDER BY {k}",
                    t = qualified,
                    c = columns,
                    k = keys.join(", "),
                    s = staging
                ),
                &[],
            )
            .await?;
        tx.commit().await?;

        debug!(
            "Merged {} rows into {} ({} replaced)",
            inserted, qualified, replaced
        );
        Ok(inserted)
    }

    async fn insert_row(&self, schema: &str, table: &Table, row: &[SqlValue]) -> Result<()> {
        let client = self.client("single-row insert").await?;
        let params = row_params(row);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        client.execute(&insert_row_sql(schema, table), &refs).await?;
        Ok(())
    }

    async fn count_null_keys(&self, schema: &str, table: &Table) -> Result<i64> {
        self.locked_count(&table.name, &null_keys_sql(schema, table), "null key check")
            .await
    }

    async fn count_duplicate_groups(&self, schema: &str, table: &Table) -> Result<i64> {
        self.locked_count(
            &table.name,
            &duplicate_groups_sql(schema, table),
            "duplicate group count",
        )
        .await
    }

    async fn delete_duplicates(&self, schema: &str, table: &Table) -> Result<u64> {
        self.locked_execute(
            &table.name,
            &delete_duplicates_sql(schema, table),
            "duplicate removal",
        )
        .await
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client("checking primary key").await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_constraint c \
                 JOIN pg_class t ON t.oid = c.conrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE n.nspname = $1 AND t.relname = $2 AND c.contype = 'p')",
                &[&schema, &table],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn add_primary_key(&self, schema: &str, table: &Table) -> Result<()> {
        let result = self
            .locked_execute(
                &table.name,
                &add_primary_key_sql(schema, table),
                "primary key creation",
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(LoadError::Target(e)) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                let groups = self.count_duplicate_groups(schema, table).await?;
                Err(LoadError::DuplicateKeys {
                    table: table.name.clone(),
                    groups,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_index(&self, schema: &str, table: &Table, index: &Index) -> Result<()> {
        self.locked_execute(
            &table.name,
            &create_index_sql(schema, table, index),
            "index creation",
        )
        .await?;
        Ok(())
    }

    async fn constraint_status(&self, schema: &str, fk: &ForeignKey) -> Result<ConstraintStatus> {
        let client = self.client("reading constraint status").await?;
        let row = client
            .query_opt(
                "SELECT c.convalidated FROM pg_constraint c \
                 JOIN pg_class t ON t.oid = c.conrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE n.nspname = $1 AND t.relname = $2 AND c.conname = $3",
                &[&schema, &fk.table, &fk.name],
            )
            .await?;
        Ok(match row.map(|r| r.get::<_, bool>(0)) {
            None => ConstraintStatus::Absent,
            Some(true) => ConstraintStatus::Validated,
            Some(false) => ConstraintStatus::CreatedUnvalidated,
        })
    }

    async fn add_foreign_key(&self, schema: &str, fk: &ForeignKey) -> Result<()> {
        self.locked_execute(
            &fk.table,
            &add_foreign_key_sql(schema, fk),
            "foreign key creation",
        )
        .await?;
        Ok(())
    }

    async fn export_orphans(
        &self,
        schema: &str,
        table: &Table,
        fk: &ForeignKey,
        manifest: &mut OrphanManifest,
    ) -> Result<u64> {
        let operation = "orphan analysis";
        let mut client = self.client(operation).await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .await?;

        let sql = select_orphans_sql(schema, table, fk);
        let stream = tx
            .query_raw(&sql, Vec::<String>::new())
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?;
        futures::pin_mut!(stream);

        let mut count = 0u64;
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| self.map_ddl_error(e, operation))?
        {
            let values = (0..row.len())
                .map(|i| row.try_get::<_, Option<String>>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            manifest.write_row(&values)?;
            count += 1;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn delete_orphans(&self, schema: &str, fk: &ForeignKey) -> Result<u64> {
        self.locked_execute(&fk.table, &delete_orphans_sql(schema, fk), "orphan quarantine")
            .await
    }

    async fn validate_foreign_key(
        &self,
        schema: &str,
        fk: &ForeignKey,
    ) -> Result<ValidationOutcome> {
        let result = self
            .locked_execute(
                &fk.table,
                &validate_foreign_key_sql(schema, fk),
                "foreign key validation",
            )
            .await;
        match result {
            Ok(_) => Ok(ValidationOutcome::Validated),
            Err(LoadError::Target(e)) if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                let message = e
                    .as_db_error()
                    .map(|db| match db.detail() {
                        Some(detail) => format!("{} ({})", db.message(), detail),
                        None => db.message().to_string(),
                    })
                    .unwrap_or_else(|| e.to_string());
                Ok(ValidationOutcome::Violated(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<String> {
        let client = self.client("health check").await?;
        let row = client.query_one("SELECT version()", &[]).await?;
        Ok(row.get(0))
    }
}
