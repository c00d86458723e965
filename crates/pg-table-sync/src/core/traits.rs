//! Capability traits implemented by storage backends.
//!
//! - [`Queryable`]: read-only query execution
//! - [`Synchronizable`]: table creation, append and merge
//!
//! A backend may implement either or both; callers depend on the capability
//! they need rather than on a concrete connector.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

use super::dataset::TabularDataset;
use super::identifier::TableRef;
use super::schema::TableSchema;

/// Row counts reported by an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Existing target rows overwritten from the batch.
    pub rows_updated: u64,
    /// New target rows appended from the batch.
    pub rows_inserted: u64,
}

impl SyncOutcome {
    pub fn total(&self) -> u64 {
        self.rows_updated + self.rows_inserted
    }
}

/// Read-only access to a relational store.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Run a SELECT and return its rows as a dataset.
    ///
    /// No transaction is opened beyond the connection default.
    async fn query(&self, sql: &str) -> Result<TabularDataset>;
}

/// Write access that keeps a table in step with in-memory data.
#[async_trait]
pub trait Synchronizable: Send + Sync {
    /// Create the table if it is absent. Never alters an existing table.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()>;

    /// Append rows without conflict resolution, in one transaction.
    ///
    /// An empty dataset is a no-op returning 0.
    async fn bulk_insert(&self, table: &TableRef, dataset: &TabularDataset) -> Result<u64>;

    /// Update rows whose `conflict_columns` match, insert the rest.
    ///
    /// Runs ensure, stage, lock, merge and staging drop as one transaction.
    /// An empty dataset is a no-op.
    async fn upsert(
        &self,
        table: &TableRef,
        dataset: &TabularDataset,
        conflict_columns: &[String],
    ) -> Result<SyncOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_outcome_total() {
        let outcome = SyncOutcome {
            rows_updated: 1,
            rows_inserted: 2,
        };
        assert_eq!(outcome.total(), 3);
        assert_eq!(SyncOutcome::default().total(), 0);
    }
}
