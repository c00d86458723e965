//! PostgreSQL table synchronizer.
//!
//! [`PgSynchronizer`] owns the connection pool and composes sessions,
//! staging tables and the conflict merger into the `ensure_table`,
//! `bulk_insert` and `upsert` operations. Each mutating call runs on one
//! pooled connection inside one transaction.
//!
//! Creating a target table is serialized across sessions with a transaction
//! advisory lock keyed on the qualified table name, so concurrent first
//! writes to a new table wait for one another instead of colliding in the
//! catalog.

use std::time::Instant;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::{GenericClient, Transaction};
use tracing::{debug, info};

use crate::config::Config;
use crate::core::{
    ColumnDef, DeclaredColumn, Ident, Queryable, SchemaInferencer, SqlValue, SyncOutcome,
    SyncPhase, Synchronizable, TableRef, TableSchema, TabularDataset,
};
use crate::error::{server_message, Result, SyncError};

use super::copy::{copy_in, TextCopyEncoder};
use super::merge::{
    check_duplicate_keys, check_target_has_conflict_columns, validate_conflict_columns,
    ConflictMerger,
};
use super::query::QueryExecutor;
use super::session::{build_pool, finish, Session};
use super::staging::{coerce_rows, coerce_to_target, StagingEncoding, StagingTable};

/// Keeps PostgreSQL tables in step with in-memory datasets.
pub struct PgSynchronizer {
    pool: Pool,
    config: Config,
    inferencer: SchemaInferencer,
}

impl PgSynchronizer {
    /// Validate `config`, build the pool and check that the server answers.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = build_pool(&config)?;
        let sync = Self {
            pool,
            inferencer: SchemaInferencer::new(config.sync.sample_rows),
            config,
        };

        sync.health_check().await?;
        info!(
            "Connected to PostgreSQL: {} (tls: {})",
            sync.config.connection.display_target(),
            sync.config.connection.ssl_mode.requires_tls()
        );
        Ok(sync)
    }

    /// Schema used for unqualified table names.
    pub fn default_schema(&self) -> &str {
        &self.config.connection.schema
    }

    /// Resolve `schema.table` or a bare `table` against the default schema.
    pub fn table_ref(&self, reference: &str) -> Result<TableRef> {
        TableRef::parse(reference, self.default_schema())
    }

    /// Infer the schema `dataset` would give `table`.
    pub fn infer_schema(&self, table: &TableRef, dataset: &TabularDataset) -> Result<TableSchema> {
        self.inferencer.infer(table, dataset)
    }

    /// Round-trip `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        let session = Session::acquire(&self.pool).await?;
        session.client().simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Run one non-query statement (DDL, GRANT, DML) in its own transaction
    /// and return the affected row count.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut session = Session::acquire(&self.pool).await?;
        let tx = session.begin().await?;
        let outcome = tx.execute(sql, &[]).await.map_err(SyncError::from);
        let affected = finish(tx, "execute", outcome).await?;
        info!("Statement affected {} rows", affected);
        Ok(affected)
    }

    pub async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        let session = Session::acquire(&self.pool).await?;
        let row = session
            .client()
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&table.schema.as_str(), &table.name.as_str()],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Column names of `table` in ordinal order; empty if the table is absent.
    pub async fn table_columns(&self, table: &TableRef) -> Result<Vec<String>> {
        let session = Session::acquire(&self.pool).await?;
        let declared = fetch_columns(session.client(), table).await?;
        Ok(declared.into_iter().map(|c| c.name).collect())
    }

    pub async fn row_count(&self, table: &TableRef) -> Result<i64> {
        let session = Session::acquire(&self.pool).await?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.qualified());
        let row = session.client().query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }

    /// Create the target if absent, otherwise reconcile its columns with
    /// `schema`, and return the target's declared columns afterwards.
    ///
    /// An existing table must have every `conflict` column. Missing dataset
    /// columns are added when `add_missing_columns` is set and rejected with
    /// `ColumnMismatch` otherwise.
    async fn prepare_target(
        &self,
        tx: &Transaction<'_>,
        schema: &TableSchema,
        conflict: &[Ident],
    ) -> Result<Vec<DeclaredColumn>> {
        let table = &schema.table;
        let mut existing = fetch_columns(tx, table)
            .await
            .map_err(|e| prepare_error(table, e))?;

        if existing.is_empty() {
            lock_table_name(tx, table).await?;
            existing = fetch_columns(tx, table).await.map_err(|e| prepare_error(table, e))?;
        }
        if existing.is_empty() {
            let sql = create_table_sql(schema);
            debug!("{}: {}", table, sql);
            tx.batch_execute(&sql).await.map_err(|e| prepare_error(table, e))?;
            info!("{}: table created", table);
            return fetch_columns(tx, table).await.map_err(|e| prepare_error(table, e));
        }

        let names: Vec<String> = existing.iter().map(|c| c.name.clone()).collect();
        check_target_has_conflict_columns(table, &names, conflict)?;

        let missing: Vec<&ColumnDef> = schema
            .columns
            .iter()
            .filter(|c| !names.iter().any(|n| n == c.name.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(existing);
        }

        if !self.config.sync.add_missing_columns {
            return Err(SyncError::ColumnMismatch {
                table: table.to_string(),
                columns: missing.iter().map(|c| c.name.to_string()).collect(),
            });
        }

        for col in missing {
            let sql = add_column_sql(table, col);
            info!("{}: adding column {} {}", table, col.name, col.sql_type);
            tx.batch_execute(&sql).await.map_err(|e| prepare_error(table, e))?;
        }
        fetch_columns(tx, table).await.map_err(|e| prepare_error(table, e))
    }

    async fn insert_in_tx(
        &self,
        tx: &Transaction<'_>,
        schema: &TableSchema,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        self.prepare_target(tx, schema, &[]).await?;

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            schema.table.qualified(),
            schema.quoted_column_list()
        );
        let mut encoder = TextCopyEncoder::with_capacity(rows.len());
        for row in rows {
            encoder.write_row(row);
        }

        let inserted = copy_in(tx, &copy_sql, encoder.finish())
            .await
            .map_err(|e| SyncError::bulk_load(schema.table.to_string(), server_message(&e)))?;
        debug!(phase = %SyncPhase::Loaded, "{}: copied {} rows", schema.table, inserted);
        Ok(inserted)
    }

    /// Stage `dataset` in the target's own column types and merge it.
    async fn upsert_in_tx(
        &self,
        tx: &Transaction<'_>,
        schema: &TableSchema,
        dataset: &TabularDataset,
        conflict: Vec<Ident>,
        key_indices: &[usize],
    ) -> Result<SyncOutcome> {
        let table = &schema.table;
        let declared = self.prepare_target(tx, schema, &conflict).await?;

        let columns: Vec<Ident> = schema.columns.iter().map(|c| c.name.clone()).collect();
        let encoding = StagingEncoding::for_target(table, &columns, &declared)?;
        let staging = StagingTable::create(tx, table, columns.clone()).await?;
        let threshold = self.config.sync.copy_threshold_rows;

        match &encoding {
            StagingEncoding::Typed(types) => {
                let rows = coerce_to_target(table, &columns, types, dataset.rows())?;
                check_duplicate_keys(table, key_indices, &conflict, &rows)?;
                staging.bulk_load(tx, &rows, &encoding, threshold).await?;
            }
            StagingEncoding::Text => {
                debug!("{}: target has types without a binary encoding, staging as text", table);
                staging.bulk_load(tx, dataset.rows(), &encoding, threshold).await?;
                staging.reject_duplicate_keys(tx, &conflict).await?;
            }
        }

        let outcome = ConflictMerger::new(table, columns, conflict)
            .with_lock_timeout(self.config.sync.lock_timeout_secs)
            .merge(tx, &staging)
            .await?;

        staging.drop(tx).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl Queryable for PgSynchronizer {
    async fn query(&self, sql: &str) -> Result<TabularDataset> {
        let session = Session::acquire(&self.pool).await?;
        QueryExecutor::new(session.client()).run(sql).await
    }
}

#[async_trait]
impl Synchronizable for PgSynchronizer {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        let table = &schema.table;
        let sql = create_table_sql(schema);
        debug!("{}: {}", table, sql);

        let mut session = Session::acquire(&self.pool).await?;
        let tx = session.begin().await?;
        let outcome = match lock_table_name(&tx, table).await {
            Ok(()) => tx.batch_execute(&sql).await.map_err(|e| prepare_error(table, e)),
            Err(e) => Err(e),
        };
        finish(tx, table, outcome).await?;

        info!("{}: table ensured", schema.table);
        Ok(())
    }

    async fn bulk_insert(&self, table: &TableRef, dataset: &TabularDataset) -> Result<u64> {
        if dataset.is_empty() {
            debug!("{}: empty dataset, nothing to insert", table);
            return Ok(0);
        }

        let start = Instant::now();
        let schema = self.infer_schema(table, dataset)?;
        let rows = coerce_rows(&schema, dataset.rows())?;

        let mut session = Session::acquire(&self.pool).await?;
        let tx = session.begin().await?;
        let outcome = self.insert_in_tx(&tx, &schema, &rows).await;
        let inserted = finish(tx, table, outcome).await?;

        info!(
            "{}: inserted {} rows in {:.2}s",
            table,
            inserted,
            start.elapsed().as_secs_f64()
        );
        Ok(inserted)
    }

    async fn upsert(
        &self,
        table: &TableRef,
        dataset: &TabularDataset,
        conflict_columns: &[String],
    ) -> Result<SyncOutcome> {
        for name in conflict_columns {
            Ident::new(name.as_str())?;
        }
        if dataset.is_empty() {
            debug!("{}: empty dataset, nothing to upsert", table);
            return Ok(SyncOutcome::default());
        }

        let start = Instant::now();
        debug!(
            phase = %SyncPhase::Idle,
            "{}: upsert of {} rows on ({})",
            table,
            dataset.len(),
            conflict_columns.join(", ")
        );

        let conflict = validate_conflict_columns(table, dataset.columns(), conflict_columns)?;
        let schema = self.infer_schema(table, dataset)?;
        let rows = coerce_rows(&schema, dataset.rows())?;

        let key_indices = conflict
            .iter()
            .map(|c| {
                dataset.column_index(c.as_str()).ok_or_else(|| {
                    SyncError::conflict_columns(
                        table.to_string(),
                        format!("conflict column '{}' is not a dataset column", c),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        check_duplicate_keys(table, &key_indices, &conflict, &rows)?;

        let mut session = Session::acquire(&self.pool).await?;
        let tx = session.begin().await?;
        let outcome = self
            .upsert_in_tx(&tx, &schema, dataset, conflict, &key_indices)
            .await;
        let outcome = finish(tx, table, outcome).await?;

        info!(
            "{}: upserted {} rows ({} updated, {} inserted) in {:.2}s",
            table,
            outcome.total(),
            outcome.rows_updated,
            outcome.rows_inserted,
            start.elapsed().as_secs_f64()
        );
        Ok(outcome)
    }
}

/// Declared columns of `table` in ordinal order; empty if the table is absent.
async fn fetch_columns<C: GenericClient>(
    client: &C,
    table: &TableRef,
) -> std::result::Result<Vec<DeclaredColumn>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT column_name::text, udt_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&table.schema.as_str(), &table.name.as_str()],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|r| DeclaredColumn {
            name: r.get(0),
            udt_name: r.get(1),
        })
        .collect())
}

/// Hold the table's creation lock until the transaction ends.
async fn lock_table_name(tx: &Transaction<'_>, table: &TableRef) -> Result<()> {
    debug!("{}: waiting for creation lock", table);
    tx.execute(CREATION_LOCK_SQL, &[&table.to_string()])
        .await
        .map_err(|e| prepare_error(table, e))?;
    Ok(())
}

const CREATION_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

/// Catalog and DDL failures happen before staging begins.
fn prepare_error(table: &TableRef, source: tokio_postgres::Error) -> SyncError {
    SyncError::merge(table.to_string(), SyncPhase::SessionAcquired, source)
}

fn create_table_sql(schema: &TableSchema) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        schema.table.qualified(),
        schema.column_ddl()
    )
}

/// Added columns are always nullable: existing rows have no value for them.
fn add_column_sql(table: &TableRef, col: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        table.qualified(),
        col.name.quoted(),
        col.sql_type.pg_type()
    )
}
