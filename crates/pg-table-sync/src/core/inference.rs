//! Schema inference from tabular data, and value coercion to inferred types.
//!
//! Each column gets the narrowest type that accommodates every observed
//! value, tried in the order integer, float, boolean, timestamp, text. A text
//! cell only narrows when the typed value prints back as the same text:
//! `"42"` is an integer, `"042"`, `"+42"` and `"yes"` stay text. A column is
//! nullable if any observed value is NULL; a column with no non-NULL values
//! infers as nullable text.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::error::{Result, SyncError};

use super::dataset::TabularDataset;
use super::identifier::{Ident, TableRef};
use super::schema::{ColumnDef, SqlType, TableSchema};
use super::value::SqlValue;

/// Largest magnitude below which every integral `f64` is an exact `i64`.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Layouts inference recognizes; text in any other layout stays text.
const CANONICAL_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Layouts accepted when a column's type is already known.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Derives a [`TableSchema`] from a dataset sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaInferencer {
    sample_rows: Option<usize>,
}

impl SchemaInferencer {
    /// `sample_rows = None` inspects every row.
    pub fn new(sample_rows: Option<usize>) -> Self {
        Self { sample_rows }
    }

    /// Infer the schema of `table` from `dataset`.
    ///
    /// # Errors
    ///
    /// `SchemaInference` if the dataset has zero columns,
    /// `InvalidIdentifier` if a column name is unsafe.
    pub fn infer(&self, table: &TableRef, dataset: &TabularDataset) -> Result<TableSchema> {
        if dataset.num_columns() == 0 {
            return Err(SyncError::SchemaInference(format!(
                "dataset for {} has zero columns",
                table
            )));
        }

        let sample = self.sample_rows.unwrap_or(usize::MAX);
        let mut columns = Vec::with_capacity(dataset.num_columns());

        for (idx, name) in dataset.columns().iter().enumerate() {
            let name = Ident::new(name.as_str())?;
            let mut inferred: Option<SqlType> = None;
            let mut nullable = false;

            for value in dataset.column_values(idx).take(sample) {
                match classify(value) {
                    None => nullable = true,
                    Some(ty) => {
                        inferred = Some(match inferred {
                            None => ty,
                            Some(prev) => prev.unify(ty),
                        });
                    }
                }
            }

            let sql_type = match inferred {
                Some(ty) => ty,
                None => {
                    nullable = true;
                    SqlType::Text
                }
            };

            columns.push(ColumnDef {
                name,
                sql_type,
                nullable,
            });
        }

        debug!(
            "Inferred {} columns for {}: {}",
            columns.len(),
            table,
            columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.sql_type))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(TableSchema {
            table: table.clone(),
            columns,
        })
    }
}

/// Narrowest type of a single value, or `None` for NULL.
pub fn classify(value: &SqlValue) -> Option<SqlType> {
    match value {
        SqlValue::Null => None,
        SqlValue::Bool(_) => Some(SqlType::Boolean),
        SqlValue::Int(_) => Some(SqlType::Integer),
        SqlValue::Float(_) => Some(SqlType::Float),
        SqlValue::Timestamp(_) => Some(SqlType::Timestamp),
        SqlValue::Text(s) => Some(classify_text(s)),
    }
}

/// Narrowest type that stores `s` without changing its text.
fn classify_text(s: &str) -> SqlType {
    if parse_int(s).is_some_and(|i| i.to_string() == s) {
        SqlType::Integer
    } else if parse_float(s).is_some_and(|f| f.to_string() == s) {
        SqlType::Float
    } else if parse_bool(s).is_some_and(|b| b.to_string() == s) {
        SqlType::Boolean
    } else if is_canonical_timestamp(s) {
        SqlType::Timestamp
    } else {
        SqlType::Text
    }
}

fn is_canonical_timestamp(s: &str) -> bool {
    CANONICAL_TIMESTAMP_FORMATS.iter().any(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt)
            .is_ok_and(|ts| ts.format(fmt).to_string() == s)
    })
}

/// Convert `value` to the representation of `ty`.
///
/// Inferred columns only ever receive values that fit them exactly. For a
/// type declared by an existing table, text is parsed the way the server
/// would (`"007"` into `bigint` is 7). Returns `None` when the value cannot
/// be represented (for example the text `"abc"` into an integer column).
pub fn coerce(value: &SqlValue, ty: SqlType) -> Option<SqlValue> {
    match (ty, value) {
        (_, SqlValue::Null) => Some(SqlValue::Null),

        (SqlType::Integer, SqlValue::Int(i)) => Some(SqlValue::Int(*i)),
        (SqlType::Integer, SqlValue::Float(f)) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => {
            Some(SqlValue::Int(*f as i64))
        }
        (SqlType::Integer, SqlValue::Text(s)) => parse_int(s).map(SqlValue::Int),

        (SqlType::Float, SqlValue::Float(f)) => Some(SqlValue::Float(*f)),
        (SqlType::Float, SqlValue::Int(i)) => Some(SqlValue::Float(*i as f64)),
        (SqlType::Float, SqlValue::Text(s)) => parse_float(s).map(SqlValue::Float),

        (SqlType::Boolean, SqlValue::Bool(b)) => Some(SqlValue::Bool(*b)),
        (SqlType::Boolean, SqlValue::Text(s)) => parse_bool(s).map(SqlValue::Bool),

        (SqlType::Timestamp, SqlValue::Timestamp(ts)) => Some(SqlValue::Timestamp(*ts)),
        (SqlType::Timestamp, SqlValue::Text(s)) => parse_timestamp(s).map(SqlValue::Timestamp),

        (SqlType::Text, v) => Some(SqlValue::Text(render_text(v))),

        _ => None,
    }
}

/// Text rendering of any non-NULL value.
pub fn render_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    }
}

fn parse_int(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

fn parse_float(s: &str) -> Option<f64> {
    let t = s.trim();
    // Rust accepts "inf"/"NaN"; product text like "Nan" must stay text
    if !t.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    t.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" => Some(true),
        "false" | "f" | "no" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let t = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.naive_utc());
    }
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("public", "items").unwrap()
    }

    fn dataset(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> TabularDataset {
        TabularDataset::new(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    fn types(schema: &TableSchema) -> Vec<(SqlType, bool)> {
        schema
            .columns
            .iter()
            .map(|c| (c.sql_type, c.nullable))
            .collect()
    }

    #[test]
    fn test_infer_typed_values() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let ds = dataset(
            &["id", "price", "active", "seen", "name"],
            vec![vec![
                SqlValue::Int(1),
                SqlValue::Float(9.5),
                SqlValue::Bool(true),
                SqlValue::Timestamp(ts),
                SqlValue::from("shoe"),
            ]],
        );
        let schema = SchemaInferencer::default().infer(&table(), &ds).unwrap();
        assert_eq!(
            types(&schema),
            vec![
                (SqlType::Integer, false),
                (SqlType::Float, false),
                (SqlType::Boolean, false),
                (SqlType::Timestamp, false),
                (SqlType::Text, false),
            ]
        );
    }

    #[test]
    fn test_infer_parses_text_cells() {
        let ds = dataset(
            &["id", "price", "flag", "when"],
            vec![
                vec!["1".into(), "2".into(), "true".into(), "2024-05-01T00:00:00".into()],
                vec!["-2".into(), "2.5".into(), "false".into(), "2024-05-01 10:00:00".into()],
            ],
        );
        let schema = SchemaInferencer::default().infer(&table(), &ds).unwrap();
        assert_eq!(
            types(&schema),
            vec![
                (SqlType::Integer, false),
                (SqlType::Float, false),
                (SqlType::Boolean, false),
                (SqlType::Timestamp, false),
            ]
        );
    }

    #[test]
    fn test_infer_heterogeneous_falls_back_to_text() {
        let ds = dataset(
            &["mixed"],
            vec![vec![SqlValue::Int(1)], vec![SqlValue::from("abc")]],
        );
        let schema = SchemaInferencer::default().infer(&table(), &ds).unwrap();
        assert_eq!(types(&schema), vec![(SqlType::Text, false)]);
    }

    #[test]
    fn test_infer_nullable_and_all_null() {
        let ds = dataset(
            &["a", "b"],
            vec![
                vec![SqlValue::Int(1), SqlValue::Null],
                vec![SqlValue::Null, SqlValue::Null],
            ],
        );
        let schema = SchemaInferencer::default().infer(&table(), &ds).unwrap();
        assert_eq!(
            types(&schema),
            vec![(SqlType::Integer, true), (SqlType::Text, true)]
        );
    }

    #[test]
    fn test_infer_respects_sample_limit() {
        let ds = dataset(
            &["v"],
            vec![vec![SqlValue::Int(1)], vec![SqlValue::from("not a number")]],
        );
        let schema = SchemaInferencer::new(Some(1)).infer(&table(), &ds).unwrap();
        assert_eq!(types(&schema), vec![(SqlType::Integer, false)]);
    }

    #[test]
    fn test_infer_zero_columns_fails() {
        let ds = TabularDataset::new(vec![], vec![]).unwrap();
        let err = SchemaInferencer::default().infer(&table(), &ds).unwrap_err();
        assert!(matches!(err, SyncError::SchemaInference(_)));
    }

    #[test]
    fn test_infer_rejects_unsafe_column_name() {
        let ds = dataset(&["id\"; DROP TABLE x"], vec![vec![SqlValue::Int(1)]]);
        let err = SchemaInferencer::default().infer(&table(), &ds).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_classify_text_does_not_treat_words_as_floats() {
        assert_eq!(classify_text("Nan"), SqlType::Text);
        assert_eq!(classify_text("inf"), SqlType::Text);
        assert_eq!(classify_text("0.25"), SqlType::Float);
    }

    #[test]
    fn test_classify_text_keeps_leading_zeros_and_signs() {
        assert_eq!(classify_text("00123"), SqlType::Text);
        assert_eq!(classify_text("01000"), SqlType::Text);
        assert_eq!(classify_text("+44"), SqlType::Text);
        assert_eq!(classify_text(" 12"), SqlType::Text);
        assert_eq!(classify_text("-12"), SqlType::Integer);
        assert_eq!(classify_text("123"), SqlType::Integer);
    }

    #[test]
    fn test_classify_text_only_narrows_exact_renderings() {
        assert_eq!(classify_text("1e3"), SqlType::Text);
        assert_eq!(classify_text("1.50"), SqlType::Text);
        assert_eq!(classify_text("yes"), SqlType::Text);
        assert_eq!(classify_text("F"), SqlType::Text);
        assert_eq!(classify_text("true"), SqlType::Boolean);
        assert_eq!(classify_text("2024-05-01"), SqlType::Text);
        assert_eq!(classify_text("2024-05-01T12:00:00+02:00"), SqlType::Text);
        assert_eq!(classify_text("2024-05-01 12:00:00"), SqlType::Timestamp);
        assert_eq!(classify_text("2024-05-01T12:00:00.250"), SqlType::Timestamp);
    }

    #[test]
    fn test_infer_keeps_codes_with_leading_zeros_as_text() {
        let ds = dataset(
            &["sku", "zip"],
            vec![
                vec!["00123".into(), "+44".into()],
                vec!["00456".into(), "01000".into()],
            ],
        );
        let schema = SchemaInferencer::default().infer(&table(), &ds).unwrap();
        assert_eq!(
            types(&schema),
            vec![(SqlType::Text, false), (SqlType::Text, false)]
        );
        let coerced = coerce(&"00123".into(), schema.columns[0].sql_type);
        assert_eq!(coerced, Some(SqlValue::Text("00123".to_string())));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(&"42".into(), SqlType::Integer), Some(SqlValue::Int(42)));
        assert_eq!(coerce(&SqlValue::Int(2), SqlType::Float), Some(SqlValue::Float(2.0)));
        assert_eq!(coerce(&"abc".into(), SqlType::Integer), None);
        assert_eq!(coerce(&SqlValue::Float(1.5), SqlType::Integer), None);
        assert_eq!(coerce(&SqlValue::Float(3.0), SqlType::Integer), Some(SqlValue::Int(3)));
        assert_eq!(coerce(&"007".into(), SqlType::Integer), Some(SqlValue::Int(7)));
        assert_eq!(coerce(&"yes".into(), SqlType::Boolean), Some(SqlValue::Bool(true)));
        assert_eq!(coerce(&SqlValue::Null, SqlType::Boolean), Some(SqlValue::Null));
        assert_eq!(
            coerce(&SqlValue::Int(7), SqlType::Text),
            Some(SqlValue::Text("7".to_string()))
        );
    }

    #[test]
    fn test_parse_timestamp_rfc3339_normalizes_to_utc() {
        let ts = parse_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.to_string(), "2024-05-01 10:00:00");
    }
}
