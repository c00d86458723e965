//! Lock, update and insert from a staging table into its target.
//!
//! The merge runs inside the caller's transaction:
//!
//! 1. `LOCK TABLE target IN EXCLUSIVE MODE` (optionally bounded by
//!    `SET LOCAL lock_timeout`). Plain readers proceed; other writers wait
//!    until this transaction ends.
//! 2. `UPDATE target ... FROM staging` on equality of every conflict column.
//!    NULL never equals NULL, so rows with a NULL key never match.
//! 3. `INSERT INTO target SELECT ... FROM staging WHERE NOT EXISTS (...)`,
//!    the anti-join on the same equality.

use std::collections::{HashMap, HashSet};

use tokio_postgres::Transaction;
use tracing::debug;

use crate::core::inference::render_text;
use crate::core::{Ident, SqlValue, SyncOutcome, SyncPhase, TableRef};
use crate::error::{Result, SyncError};

use super::staging::StagingTable;

/// Merges one staging table into one target table.
pub struct ConflictMerger<'a> {
    target: &'a TableRef,
    columns: Vec<Ident>,
    conflict: Vec<Ident>,
    lock_timeout_secs: Option<u64>,
}

impl<'a> ConflictMerger<'a> {
    /// `columns` are all dataset columns in load order; `conflict` is a
    /// validated subset of them.
    pub fn new(target: &'a TableRef, columns: Vec<Ident>, conflict: Vec<Ident>) -> Self {
        Self {
            target,
            columns,
            conflict,
            lock_timeout_secs: None,
        }
    }

    /// Bound the wait for the target-table lock.
    pub fn with_lock_timeout(mut self, secs: Option<u64>) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Run lock, update and insert against `staging`.
    ///
    /// # Errors
    ///
    /// `MergeExecution` tagged `Locked` if the lock cannot be taken, `Merged`
    /// if the update or insert is rejected.
    pub async fn merge(&self, tx: &Transaction<'_>, staging: &StagingTable) -> Result<SyncOutcome> {
        if let Some(secs) = self.lock_timeout_secs {
            tx.batch_execute(&lock_timeout_sql(secs))
                .await
                .map_err(|e| self.error(SyncPhase::Locked, e))?;
        }

        let lock = self.lock_sql();
        debug!("{}: {}", self.target, lock);
        tx.batch_execute(&lock)
            .await
            .map_err(|e| self.error(SyncPhase::Locked, e))?;
        debug!(phase = %SyncPhase::Locked, "{}: exclusive lock held", self.target);

        let rows_updated = match self.update_sql(staging) {
            Some(sql) => {
                debug!("{}: {}", self.target, sql);
                tx.execute(sql.as_str(), &[])
                    .await
                    .map_err(|e| self.error(SyncPhase::Merged, e))?
            }
            None => 0,
        };

        let insert = self.insert_sql(staging);
        debug!("{}: {}", self.target, insert);
        let rows_inserted = tx
            .execute(insert.as_str(), &[])
            .await
            .map_err(|e| self.error(SyncPhase::Merged, e))?;

        debug!(
            phase = %SyncPhase::Merged,
            "{}: {} updated, {} inserted",
            self.target,
            rows_updated,
            rows_inserted
        );

        Ok(SyncOutcome {
            rows_updated,
            rows_inserted,
        })
    }

    pub fn lock_sql(&self) -> String {
        format!("LOCK TABLE {} IN EXCLUSIVE MODE", self.target.qualified())
    }

    /// The update statement, or `None` when every column is a conflict
    /// column and there is nothing to overwrite.
    pub fn update_sql(&self, staging: &StagingTable) -> Option<String> {
        let assignments: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.conflict.contains(c))
            .map(|c| format!("{} = stg.{}", c.quoted(), c.quoted()))
            .collect();

        if assignments.is_empty() {
            return None;
        }

        Some(format!(
            "UPDATE {} AS tgt SET {} FROM {} AS stg WHERE {}",
            self.target.qualified(),
            assignments.join(", "),
            staging.qualified(),
            self.key_predicate()
        ))
    }

    pub fn insert_sql(&self, staging: &StagingTable) -> String {
        let col_list = self
            .columns
            .iter()
            .map(Ident::quoted)
            .collect::<Vec<_>>()
            .join(", ");
        let select_list = self
            .columns
            .iter()
            .map(|c| format!("stg.{}", c.quoted()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS stg \
             WHERE NOT EXISTS (SELECT 1 FROM {} AS tgt WHERE {})",
            self.target.qualified(),
            col_list,
            select_list,
            staging.qualified(),
            self.target.qualified(),
            self.key_predicate()
        )
    }

    fn key_predicate(&self) -> String {
        self.conflict
            .iter()
            .map(|c| format!("tgt.{} = stg.{}", c.quoted(), c.quoted()))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn error(&self, phase: SyncPhase, source: tokio_postgres::Error) -> SyncError {
        SyncError::merge(self.target.to_string(), phase, source)
    }
}

fn lock_timeout_sql(secs: u64) -> String {
    format!("SET LOCAL lock_timeout = '{}s'", secs)
}

/// Check that `conflict` is a non-empty, duplicate-free subset of
/// `dataset_columns`, and return the validated identifiers.
pub fn validate_conflict_columns(
    table: &TableRef,
    dataset_columns: &[String],
    conflict: &[String],
) -> Result<Vec<Ident>> {
    if conflict.is_empty() {
        return Err(SyncError::conflict_columns(
            table.to_string(),
            "at least one conflict column is required",
        ));
    }

    let mut seen = HashSet::new();
    let mut idents = Vec::with_capacity(conflict.len());
    for name in conflict {
        let ident = Ident::new(name.as_str())?;
        if !seen.insert(name.as_str()) {
            return Err(SyncError::conflict_columns(
                table.to_string(),
                format!("conflict column '{}' listed twice", name),
            ));
        }
        if !dataset_columns.iter().any(|c| c == name) {
            return Err(SyncError::conflict_columns(
                table.to_string(),
                format!("conflict column '{}' is not a dataset column", name),
            ));
        }
        idents.push(ident);
    }
    Ok(idents)
}

/// Check that every conflict column exists in the target table.
pub fn check_target_has_conflict_columns(
    table: &TableRef,
    target_columns: &[String],
    conflict: &[Ident],
) -> Result<()> {
    let missing: Vec<&str> = conflict
        .iter()
        .map(Ident::as_str)
        .filter(|c| !target_columns.iter().any(|t| t == c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SyncError::conflict_columns(
            table.to_string(),
            format!("table has no column(s) {}", missing.join(", ")),
        ))
    }
}

/// Reject a batch in which two rows share a conflict key.
///
/// `rows` must already be coerced to one type per column so that `"1"` and
/// `1` compare equal. Keys containing a NULL never collide.
pub fn check_duplicate_keys(
    table: &TableRef,
    key_indices: &[usize],
    key_names: &[Ident],
    rows: &[Vec<SqlValue>],
) -> Result<()> {
    let mut seen: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let values: Vec<&SqlValue> = key_indices.iter().map(|&idx| &row[idx]).collect();
        if values.iter().any(|v| v.is_null()) {
            continue;
        }
        let key: Vec<String> = values.iter().map(|v| render_text(v)).collect();
        if let Some(first) = seen.insert(key, i) {
            let rendered = key_names
                .iter()
                .zip(&values)
                .map(|(name, v)| format!("{}={}", name, render_text(v)))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SyncError::DuplicateConflictKey {
                table: table.to_string(),
                key: format!("({}) in rows {} and {}", rendered, first, i),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TableRef {
        TableRef::new("sales", "orders").unwrap()
    }

    fn idents(names: &[&str]) -> Vec<Ident> {
        names.iter().map(|n| Ident::new(*n).unwrap()).collect()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn staging(names: &[&str]) -> StagingTable {
        StagingTable::new(
            &target(),
            idents(names),
            Ident::new("_stg_orders_abc").unwrap(),
        )
    }

    #[test]
    fn test_lock_sql() {
        let t = target();
        let merger = ConflictMerger::new(&t, idents(&["id"]), idents(&["id"]));
        assert_eq!(merger.lock_sql(), "LOCK TABLE \"sales\".\"orders\" IN EXCLUSIVE MODE");
        assert_eq!(lock_timeout_sql(5), "SET LOCAL lock_timeout = '5s'");
    }

    #[test]
    fn test_update_sql_sets_non_key_columns() {
        let t = target();
        let merger = ConflictMerger::new(
            &t,
            idents(&["region", "id", "name", "qty"]),
            idents(&["region", "id"]),
        );
        let sql = merger
            .update_sql(&staging(&["region", "id", "name", "qty"]))
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"sales\".\"orders\" AS tgt SET \"name\" = stg.\"name\", \"qty\" = stg.\"qty\" \
             FROM pg_temp.\"_stg_orders_abc\" AS stg \
             WHERE tgt.\"region\" = stg.\"region\" AND tgt.\"id\" = stg.\"id\""
        );
    }

    #[test]
    fn test_update_skipped_when_all_columns_are_keys() {
        let t = target();
        let merger = ConflictMerger::new(&t, idents(&["id"]), idents(&["id"]));
        assert!(merger.update_sql(&staging(&["id"])).is_none());
    }

    #[test]
    fn test_insert_sql_is_anti_join() {
        let t = target();
        let merger = ConflictMerger::new(&t, idents(&["id", "name"]), idents(&["id"]));
        assert_eq!(
            merger.insert_sql(&staging(&["id", "name"])),
            "INSERT INTO \"sales\".\"orders\" (\"id\", \"name\") \
             SELECT stg.\"id\", stg.\"name\" FROM pg_temp.\"_stg_orders_abc\" AS stg \
             WHERE NOT EXISTS (SELECT 1 FROM \"sales\".\"orders\" AS tgt WHERE tgt.\"id\" = stg.\"id\")"
        );
    }

    #[test]
    fn test_validate_conflict_columns() {
        let t = target();
        let dataset = cols(&["id", "name"]);
        assert_eq!(
            validate_conflict_columns(&t, &dataset, &cols(&["id"])).unwrap(),
            idents(&["id"])
        );

        let err = validate_conflict_columns(&t, &dataset, &[]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConflictColumns { .. }));

        let err = validate_conflict_columns(&t, &dataset, &cols(&["sku"])).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConflictColumns { .. }));

        let err = validate_conflict_columns(&t, &dataset, &cols(&["id", "id"])).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConflictColumns { .. }));

        let err = validate_conflict_columns(&t, &dataset, &cols(&["id;--"])).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_target_must_have_conflict_columns() {
        let t = target();
        assert!(check_target_has_conflict_columns(&t, &cols(&["id", "name"]), &idents(&["id"])).is_ok());
        let err =
            check_target_has_conflict_columns(&t, &cols(&["name"]), &idents(&["id"])).unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let t = target();
        let rows = vec![
            vec![SqlValue::Int(1), SqlValue::from("a")],
            vec![SqlValue::Int(2), SqlValue::from("b")],
            vec![SqlValue::Int(1), SqlValue::from("c")],
        ];
        let err = check_duplicate_keys(&t, &[0], &idents(&["id"]), &rows).unwrap_err();
        match err {
            SyncError::DuplicateConflictKey { key, .. } => {
                assert!(key.contains("id=1"));
                assert!(key.contains("rows 0 and 2"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_null_keys_never_collide() {
        let t = target();
        let rows = vec![
            vec![SqlValue::Null, SqlValue::from("a")],
            vec![SqlValue::Null, SqlValue::from("b")],
        ];
        assert!(check_duplicate_keys(&t, &[0], &idents(&["id"]), &rows).is_ok());
    }

    #[test]
    fn test_composite_keys_compare_all_columns() {
        let t = target();
        let rows = vec![
            vec![SqlValue::from("eu"), SqlValue::Int(1)],
            vec![SqlValue::from("us"), SqlValue::Int(1)],
        ];
        assert!(check_duplicate_keys(&t, &[0, 1], &idents(&["region", "id"]), &rows).is_ok());
    }
}
