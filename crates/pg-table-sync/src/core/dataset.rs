//! In-memory tabular data handed to the engine by callers.

use std::collections::HashSet;

use crate::error::{Result, SyncError};

use super::value::SqlValue;

/// Ordered, uniquely named columns plus rows aligned to them.
///
/// The engine only ever reads a dataset. Construction through [`new`](Self::new)
/// guarantees unique column names and uniform row arity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularDataset {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl TabularDataset {
    /// Build a dataset, checking column uniqueness and row arity.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for col in &columns {
            if !seen.insert(col.as_str()) {
                return Err(SyncError::bulk_load(
                    "<dataset>",
                    format!("duplicate column name '{}'", col),
                ));
            }
        }

        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(SyncError::bulk_load(
                    "<dataset>",
                    format!(
                        "row {} has {} values, expected {}",
                        i,
                        row.len(),
                        columns.len()
                    ),
                ));
            }
        }

        Ok(Self { columns, rows })
    }

    /// Build a dataset from flat JSON objects.
    ///
    /// Columns appear in the order their keys are written, earlier records
    /// first; keys missing from a record become NULL.
    pub fn from_json_records(records: &[serde_json::Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (i, record) in records.iter().enumerate() {
            let obj = record.as_object().ok_or_else(|| {
                SyncError::bulk_load("<dataset>", format!("record {} is not a JSON object", i))
            })?;
            for key in obj.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .filter_map(|r| r.as_object())
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| obj.get(c).map(SqlValue::from_json).unwrap_or(SqlValue::Null))
                    .collect()
            })
            .collect();

        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Iterate the values of one column.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &SqlValue> {
        self.rows.iter().map(move |row| &row[idx])
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_valid() {
        let ds = TabularDataset::new(
            cols(&["id", "name"]),
            vec![
                vec![SqlValue::Int(1), SqlValue::from("a")],
                vec![SqlValue::Int(2), SqlValue::from("b")],
            ],
        )
        .unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.num_columns(), 2);
        assert_eq!(ds.column_index("name"), Some(1));
        assert_eq!(ds.column_values(0).count(), 2);
    }

    #[test]
    fn test_new_rejects_duplicate_columns() {
        let err = TabularDataset::new(cols(&["id", "id"]), vec![]).unwrap_err();
        assert!(err.to_string().contains("duplicate column"));
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = TabularDataset::new(
            cols(&["id", "name"]),
            vec![vec![SqlValue::Int(1)]],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::BulkLoad { .. }));
        assert!(err.to_string().contains("row 0 has 1 values, expected 2"));
    }

    #[test]
    fn test_from_json_records_fills_missing_keys() {
        let records = vec![
            json!({"id": 1, "name": "a"}),
            json!({"id": 2, "colour": "red"}),
        ];
        let ds = TabularDataset::from_json_records(&records).unwrap();
        assert_eq!(ds.columns(), &cols(&["id", "name", "colour"])[..]);
        assert_eq!(ds.rows()[1][1], SqlValue::Null);
        assert_eq!(ds.rows()[1][2], SqlValue::from("red"));
    }

    #[test]
    fn test_from_json_records_keeps_key_order() {
        let records: Vec<serde_json::Value> = vec![
            serde_json::from_str(r#"{"zeta": 1, "alpha": 2, "mid": 3}"#).unwrap(),
            serde_json::from_str(r#"{"beta": 4, "zeta": 5}"#).unwrap(),
        ];
        let ds = TabularDataset::from_json_records(&records).unwrap();
        assert_eq!(ds.columns(), &cols(&["zeta", "alpha", "mid", "beta"])[..]);
        assert_eq!(ds.rows()[1][0], SqlValue::from(5i64));
    }

    #[test]
    fn test_from_json_records_rejects_non_objects() {
        let records = vec![json!([1, 2])];
        assert!(TabularDataset::from_json_records(&records).is_err());
    }
}
