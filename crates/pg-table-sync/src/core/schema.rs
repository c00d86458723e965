//! Table and column metadata produced by schema inference.

use std::fmt;

use super::identifier::{Ident, TableRef};

/// Column types the engine can infer, in narrowing preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Text,
}

impl SqlType {
    /// PostgreSQL type name used in DDL.
    pub fn pg_type(&self) -> &'static str {
        match self {
            SqlType::Integer => "bigint",
            SqlType::Float => "double precision",
            SqlType::Boolean => "boolean",
            SqlType::Timestamp => "timestamp",
            SqlType::Text => "text",
        }
    }

    /// The engine type stored exactly as the catalog `udt_name`, if any.
    ///
    /// Only these columns take binary COPY and typed parameters; anything
    /// else (`int4`, `numeric`, `varchar`, `jsonb` ...) is loaded as text.
    pub fn from_udt(udt_name: &str) -> Option<SqlType> {
        match udt_name {
            "int8" => Some(SqlType::Integer),
            "float8" => Some(SqlType::Float),
            "bool" => Some(SqlType::Boolean),
            "timestamp" => Some(SqlType::Timestamp),
            "text" => Some(SqlType::Text),
            _ => None,
        }
    }

    /// Narrowest type accommodating values of both `self` and `other`.
    ///
    /// Integer widens to Float; any other disagreement falls back to Text.
    pub fn unify(self, other: SqlType) -> SqlType {
        match (self, other) {
            (a, b) if a == b => a,
            (SqlType::Integer, SqlType::Float) | (SqlType::Float, SqlType::Integer) => {
                SqlType::Float
            }
            _ => SqlType::Text,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pg_type())
    }
}

/// One inferred column.
///
/// `nullable` records whether the sample held a NULL. It is not turned into
/// a constraint: a later batch may legitimately carry NULLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: Ident,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnDef {
    /// `"name" type` fragment for CREATE TABLE and ADD COLUMN.
    pub fn ddl(&self) -> String {
        format!("{} {}", self.name.quoted(), self.sql_type.pg_type())
    }
}

/// A column as an existing table declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredColumn {
    pub name: String,
    /// `information_schema.columns.udt_name`, e.g. `int8`, `varchar`, `_int4`.
    pub udt_name: String,
}

impl DeclaredColumn {
    pub fn sql_type(&self) -> Option<SqlType> {
        SqlType::from_udt(&self.udt_name)
    }
}

/// Schema of one target table. Identity is `(schema, table)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Comma-separated quoted column list.
    pub fn quoted_column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name.quoted())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Column definitions for CREATE TABLE, one per line.
    pub fn column_ddl(&self) -> String {
        self.columns
            .iter()
            .map(ColumnDef::ddl)
            .collect::<Vec<_>>()
            .join(",\n    ")
    }
}
