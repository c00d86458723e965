//! Read-only query execution.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSqlOwned, Type};
use tokio_postgres::{Client, Row, SimpleQueryMessage};
use tracing::debug;

use crate::core::{SqlValue, TabularDataset};
use crate::error::{server_message, Result, SyncError};

/// Runs a SELECT on a plain client and converts the result to a dataset.
pub struct QueryExecutor<'a> {
    client: &'a Client,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Execute `sql` and collect every row.
    ///
    /// The statement is prepared first so that column names are known even
    /// when no rows come back. Results with a column of a type that has no
    /// typed decoding (arrays, intervals, ranges, ...) are fetched in text
    /// form instead, and those columns come back as their PostgreSQL text.
    pub async fn run(&self, sql: &str) -> Result<TabularDataset> {
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| SyncError::query(server_message(&e)))?;

        let types: Vec<Type> = stmt.columns().iter().map(|c| c.type_().clone()).collect();
        let columns = unique_column_names(stmt.columns().iter().map(|c| c.name()));

        if !types.iter().all(is_supported) {
            debug!("query has columns without a typed decoding, fetching as text");
            return self.run_text(sql, columns, &types).await;
        }

        let rows = self
            .client
            .query(&stmt, &[])
            .await
            .map_err(|e| SyncError::query(server_message(&e)))?;

        let data = rows
            .iter()
            .map(|row| {
                types
                    .iter()
                    .enumerate()
                    .map(|(idx, ty)| decode(row, idx, ty))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("query returned {} rows x {} columns", data.len(), columns.len());
        TabularDataset::new(columns, data)
    }
}

impl QueryExecutor<'_> {
    async fn run_text(
        &self,
        sql: &str,
        columns: Vec<String>,
        types: &[Type],
    ) -> Result<TabularDataset> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| SyncError::query(server_message(&e)))?;

        let data: Vec<Vec<SqlValue>> = messages
            .iter()
            .filter_map(|msg| match msg {
                SimpleQueryMessage::Row(row) => Some(
                    types
                        .iter()
                        .enumerate()
                        .map(|(idx, ty)| decode_text(row.get(idx), ty))
                        .collect(),
                ),
                _ => None,
            })
            .collect();

        debug!("query returned {} rows x {} columns", data.len(), columns.len());
        TabularDataset::new(columns, data)
    }
}

/// Result sets may repeat a name (`SELECT 1, 1`); later copies get a suffix.
fn unique_column_names<'n>(names: impl Iterator<Item = &'n str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let mut candidate = name.to_string();
        let mut n = 2;
        while out.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

fn get<T: FromSqlOwned>(row: &Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| SyncError::query(format!("column {}: {}", idx, e)))
}

fn is_supported(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::DATE
            | Type::UUID
            | Type::JSON
            | Type::JSONB
    )
}

/// Decode one cell of a text-format result.
///
/// Types with a [`SqlValue`] counterpart are parsed; anything else, or text
/// that does not parse, is kept as text.
fn decode_text(value: Option<&str>, ty: &Type) -> SqlValue {
    let Some(text) = value else {
        return SqlValue::Null;
    };
    let parsed = match *ty {
        Type::BOOL => match text {
            "t" => Some(SqlValue::Bool(true)),
            "f" => Some(SqlValue::Bool(false)),
            _ => None,
        },
        Type::INT2 | Type::INT4 | Type::INT8 => text.parse::<i64>().ok().map(SqlValue::Int),
        Type::FLOAT4 | Type::FLOAT8 => text.parse::<f64>().ok().map(SqlValue::Float),
        Type::NUMERIC => text
            .parse::<Decimal>()
            .ok()
            .and_then(|d| d.to_f64())
            .map(SqlValue::Float),
        Type::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(|ts| SqlValue::Timestamp(ts.naive_utc())),
        Type::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(SqlValue::Timestamp),
        _ => None,
    };
    parsed.unwrap_or_else(|| SqlValue::Text(text.to_string()))
}

/// Decode one result cell into a [`SqlValue`].
fn decode(row: &Row, idx: usize, ty: &Type) -> Result<SqlValue> {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx)?.map(SqlValue::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|v| SqlValue::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| SqlValue::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx)?.map(SqlValue::Int),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| SqlValue::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(SqlValue::Float),
        // out-of-range decimals keep their exact text
        Type::NUMERIC => get::<Decimal>(row, idx)?.map(|d| match d.to_f64() {
            Some(f) => SqlValue::Float(f),
            None => SqlValue::Text(d.to_string()),
        }),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx)?.map(SqlValue::Text)
        }
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => {
            get::<DateTime<Utc>>(row, idx)?.map(|ts| SqlValue::Timestamp(ts.naive_utc()))
        }
        Type::DATE => get::<NaiveDate>(row, idx)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(SqlValue::Timestamp),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|u| SqlValue::Text(u.to_string())),
        Type::JSON | Type::JSONB => {
            get::<serde_json::Value>(row, idx)?.map(|j| SqlValue::Text(j.to_string()))
        }
        ref other => {
            return Err(SyncError::query(format!(
                "column {} has unsupported type {}",
                idx,
                other.name()
            )))
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
