//! Transient staging relations for merges.
//!
//! The staging table is a session temporary created `ON COMMIT DROP` inside
//! the operation's transaction: it is invisible to other sessions, is
//! dropped explicitly after the merge, and is reclaimed by the server on
//! rollback or disconnect.
//!
//! Its columns are copied from the target (`CREATE TABLE AS SELECT ... WITH
//! NO DATA`), so staging and target always agree on types and the merge
//! compares like with like. Constraints and defaults are not copied.

use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;
use tracing::debug;
use uuid::Uuid;

use crate::core::identifier::MAX_IDENTIFIER_LENGTH;
use crate::core::{
    coerce, ColumnDef, DeclaredColumn, Ident, SqlType, SqlValue, SyncPhase, TableRef, TableSchema,
};
use crate::error::{Result, SyncError};

use super::copy::{copy_in, BinaryCopyEncoder, TextCopyEncoder};

const STAGING_PREFIX: &str = "_stg_";
const SUFFIX_HEX_LEN: usize = 12;

/// How rows are written into a staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingEncoding {
    /// Every target column has a binary form; rows are coerced to these
    /// types before loading.
    Typed(Vec<SqlType>),
    /// Text COPY of the dataset's values; the server parses each field into
    /// the declared type.
    Text,
}

impl StagingEncoding {
    /// Choose the encoding for `columns` from the target's declared columns.
    ///
    /// # Errors
    ///
    /// `ColumnMismatch` when a column is not declared by the target.
    pub fn for_target(
        table: &TableRef,
        columns: &[Ident],
        declared: &[DeclaredColumn],
    ) -> Result<Self> {
        let mut types = Vec::with_capacity(columns.len());
        let mut missing = Vec::new();
        for col in columns {
            match declared.iter().find(|d| d.name == col.as_str()) {
                Some(d) => types.push(d.sql_type()),
                None => missing.push(col.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(SyncError::ColumnMismatch {
                table: table.to_string(),
                columns: missing,
            });
        }

        Ok(types
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .map_or(StagingEncoding::Text, StagingEncoding::Typed))
    }
}

/// A staging table owned by one in-flight operation.
#[derive(Debug)]
pub struct StagingTable {
    name: Ident,
    target: TableRef,
    columns: Vec<Ident>,
}

impl StagingTable {
    /// Generate a unique staging name for `target`.
    ///
    /// `_stg_<table prefix>_<12 hex chars>`, never longer than 63 bytes.
    pub fn unique_name(target: &TableRef) -> Result<Ident> {
        let max_prefix = MAX_IDENTIFIER_LENGTH - STAGING_PREFIX.len() - 1 - SUFFIX_HEX_LEN;
        let table = target.name.as_str();
        let prefix = &table[..table.len().min(max_prefix)];
        let suffix = Uuid::new_v4().simple().to_string();
        Ident::new(format!(
            "{}{}_{}",
            STAGING_PREFIX,
            prefix,
            &suffix[..SUFFIX_HEX_LEN]
        ))
    }

    /// Describe a staging table for `columns` of `target` without creating it.
    pub(crate) fn new(target: &TableRef, columns: Vec<Ident>, name: Ident) -> Self {
        Self {
            name,
            target: target.clone(),
            columns,
        }
    }

    /// Create a uniquely named staging table holding `columns` of `target`
    /// in the current transaction.
    pub async fn create(tx: &Transaction<'_>, target: &TableRef, columns: Vec<Ident>) -> Result<Self> {
        let staging = Self::new(target, columns, Self::unique_name(target)?);

        let sql = staging.create_sql();
        debug!("{}: {}", staging.target, sql);
        tx.batch_execute(&sql)
            .await
            .map_err(|e| staging.merge_error(SyncPhase::StagingCreated, e))?;
        debug!(
            phase = %SyncPhase::StagingCreated,
            "{}: staging table {} created",
            staging.target,
            staging.name
        );

        Ok(staging)
    }

    /// `pg_temp."name"` for SQL text.
    pub fn qualified(&self) -> String {
        format!("pg_temp.{}", self.name.quoted())
    }

    fn create_sql(&self) -> String {
        format!(
            "CREATE TEMP TABLE IF NOT EXISTS {} ON COMMIT DROP AS SELECT {} FROM {} WITH NO DATA",
            self.qualified(),
            self.column_list(),
            self.target.qualified()
        )
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(Ident::quoted)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Load rows into the staging table.
    ///
    /// With [`StagingEncoding::Typed`] the rows must already be coerced to
    /// those types; binary COPY is used at or above `copy_threshold` rows and
    /// a prepared per-row INSERT below it. With [`StagingEncoding::Text`] the
    /// rows go through text COPY as they are. Row order is preserved.
    pub async fn bulk_load(
        &self,
        tx: &Transaction<'_>,
        rows: &[Vec<SqlValue>],
        encoding: &StagingEncoding,
        copy_threshold: usize,
    ) -> Result<u64> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != self.columns.len())
        {
            return Err(SyncError::bulk_load(
                self.target.to_string(),
                format!(
                    "row {} has {} values, staging table has {} columns",
                    i,
                    row.len(),
                    self.columns.len()
                ),
            ));
        }

        let loaded = match encoding {
            StagingEncoding::Typed(_) if rows.len() >= copy_threshold => {
                self.load_binary(tx, rows).await?
            }
            StagingEncoding::Typed(types) => self.load_rows(tx, rows, types).await?,
            StagingEncoding::Text => self.load_text(tx, rows).await?,
        };

        debug!(
            phase = %SyncPhase::Loaded,
            "{}: loaded {} rows into {}",
            self.target,
            loaded,
            self.name
        );
        Ok(loaded)
    }

    async fn load_binary(&self, tx: &Transaction<'_>, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT BINARY)",
            self.qualified(),
            self.column_list()
        );

        let mut encoder = BinaryCopyEncoder::with_capacity(rows.len());
        for row in rows {
            encoder.write_row(row);
        }

        copy_in(tx, &copy_sql, encoder.finish())
            .await
            .map_err(|e| self.merge_error(SyncPhase::Loaded, e))
    }

    async fn load_text(&self, tx: &Transaction<'_>, rows: &[Vec<SqlValue>]) -> Result<u64> {
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            self.qualified(),
            self.column_list()
        );

        let mut encoder = TextCopyEncoder::with_capacity(rows.len());
        for row in rows {
            encoder.write_row(row);
        }

        copy_in(tx, &copy_sql, encoder.finish())
            .await
            .map_err(|e| self.merge_error(SyncPhase::Loaded, e))
    }

    async fn load_rows(
        &self,
        tx: &Transaction<'_>,
        rows: &[Vec<SqlValue>],
        types: &[SqlType],
    ) -> Result<u64> {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified(),
            self.column_list(),
            placeholders
        );

        let stmt = tx
            .prepare(&insert_sql)
            .await
            .map_err(|e| self.merge_error(SyncPhase::Loaded, e))?;

        let mut loaded = 0;
        for row in rows {
            let params: Vec<Box<dyn ToSql + Sync + Send>> = row
                .iter()
                .zip(types)
                .map(|(value, ty)| to_param(value, *ty))
                .collect();
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| &**p as &(dyn ToSql + Sync))
                .collect();
            loaded += tx
                .execute(&stmt, &refs)
                .await
                .map_err(|e| self.merge_error(SyncPhase::Loaded, e))?;
        }
        Ok(loaded)
    }

    /// Reject the load if two staged rows carry equal conflict keys.
    ///
    /// Equality is the target type's, so `"1"` and `"01"` collide in an
    /// integer column. Keys containing a NULL never collide.
    pub async fn reject_duplicate_keys(&self, tx: &Transaction<'_>, conflict: &[Ident]) -> Result<()> {
        let sql = self.duplicate_key_sql(conflict);
        debug!("{}: {}", self.target, sql);
        let rows = tx
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| self.merge_error(SyncPhase::Loaded, e))?;

        let Some(row) = rows.first() else {
            return Ok(());
        };
        let rendered = conflict
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value: Option<String> = row.get(i);
                format!("{}={}", name, value.unwrap_or_default())
            })
            .collect::<Vec<_>>()
            .join(", ");
        let count: i64 = row.get(conflict.len());
        Err(SyncError::DuplicateConflictKey {
            table: self.target.to_string(),
            key: format!("({}) in {} rows", rendered, count),
        })
    }

    fn duplicate_key_sql(&self, conflict: &[Ident]) -> String {
        let keys = conflict
            .iter()
            .map(Ident::quoted)
            .collect::<Vec<_>>()
            .join(", ");
        let as_text = conflict
            .iter()
            .map(|c| format!("{}::text", c.quoted()))
            .collect::<Vec<_>>()
            .join(", ");
        let not_null = conflict
            .iter()
            .map(|c| format!("{} IS NOT NULL", c.quoted()))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "SELECT {}, count(*) FROM {} WHERE {} GROUP BY {} HAVING count(*) > 1 LIMIT 1",
            as_text,
            self.qualified(),
            not_null,
            keys
        )
    }

    /// Drop the staging table. A no-op if it is already gone.
    pub async fn drop(self, tx: &Transaction<'_>) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.qualified());
        tx.batch_execute(&sql)
            .await
            .map_err(|e| self.merge_error(SyncPhase::Merged, e))?;
        debug!("{}: staging table {} dropped", self.target, self.name);
        Ok(())
    }

    fn merge_error(&self, phase: SyncPhase, source: tokio_postgres::Error) -> SyncError {
        SyncError::merge(self.target.to_string(), phase, source)
    }
}

/// Typed statement parameter for a coerced value.
fn to_param(value: &SqlValue, ty: SqlType) -> Box<dyn ToSql + Sync + Send> {
    match (ty, value) {
        (SqlType::Integer, SqlValue::Int(i)) => Box::new(Some(*i)),
        (SqlType::Integer, _) => Box::new(None::<i64>),
        (SqlType::Float, SqlValue::Float(f)) => Box::new(Some(*f)),
        (SqlType::Float, _) => Box::new(None::<f64>),
        (SqlType::Boolean, SqlValue::Bool(b)) => Box::new(Some(*b)),
        (SqlType::Boolean, _) => Box::new(None::<bool>),
        (SqlType::Timestamp, SqlValue::Timestamp(ts)) => Box::new(Some(*ts)),
        (SqlType::Timestamp, _) => Box::new(None::<chrono::NaiveDateTime>),
        (SqlType::Text, SqlValue::Text(s)) => Box::new(Some(s.clone())),
        (SqlType::Text, _) => Box::new(None::<String>),
    }
}

/// Coerce every dataset row to the column types of `schema`.
///
/// Nullability is left to the target table.
///
/// # Errors
///
/// `BulkLoad` naming the row and column when the arity differs or a value
/// cannot be represented in its column's type.
pub fn coerce_rows(schema: &TableSchema, rows: &[Vec<SqlValue>]) -> Result<Vec<Vec<SqlValue>>> {
    let table = schema.table.to_string();
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != schema.columns.len() {
                return Err(SyncError::bulk_load(
                    &table,
                    format!(
                        "row {} has {} values, schema has {} columns",
                        i,
                        row.len(),
                        schema.columns.len()
                    ),
                ));
            }
            row.iter()
                .zip(&schema.columns)
                .map(|(value, col)| {
                    coerce(value, col.sql_type).ok_or_else(|| {
                        SyncError::bulk_load(
                            &table,
                            format!(
                                "row {}: {} value cannot be stored in column {} ({})",
                                i,
                                value.kind(),
                                col.name,
                                col.sql_type
                            ),
                        )
                    })
                })
                .collect()
        })
        .collect()
}

/// Coerce dataset rows to the types `columns` have in the target.
pub fn coerce_to_target(
    table: &TableRef,
    columns: &[Ident],
    types: &[SqlType],
    rows: &[Vec<SqlValue>],
) -> Result<Vec<Vec<SqlValue>>> {
    let schema = TableSchema {
        table: table.clone(),
        columns: columns
            .iter()
            .zip(types)
            .map(|(name, ty)| ColumnDef {
                name: name.clone(),
                sql_type: *ty,
                nullable: true,
            })
            .collect(),
    };
    coerce_rows(&schema, rows)
}
