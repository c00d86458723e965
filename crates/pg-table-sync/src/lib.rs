//! # pg-table-sync
//!
//! Synchronizes in-memory tabular datasets into PostgreSQL tables.
//!
//! This library provides:
//!
//! - **Schema inference** from dataset values to PostgreSQL column types
//! - **Idempotent table creation** that never alters existing tables
//! - **Bulk insert** using the PostgreSQL COPY protocol
//! - **Upsert** through a session-private staging table, an exclusive
//!   target-table lock, an update of matching rows and an anti-join insert,
//!   all in one transaction
//! - **Read-only queries** returning datasets
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_table_sync::{Config, PgSynchronizer, Synchronizable, SqlValue, TabularDataset};
//!
//! #[tokio::main]
//! async fn main() -> pg_table_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let sync = PgSynchronizer::connect(config).await?;
//!
//!     let table = sync.table_ref("items")?;
//!     let dataset = TabularDataset::new(
//!         vec!["id".into(), "name".into()],
//!         vec![
//!             vec![SqlValue::Int(1), SqlValue::from("a")],
//!             vec![SqlValue::Int(2), SqlValue::from("b")],
//!         ],
//!     )?;
//!
//!     let outcome = sync.upsert(&table, &dataset, &["id".to_string()]).await?;
//!     println!("{} updated, {} inserted", outcome.rows_updated, outcome.rows_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;

// Re-exports for convenient access
pub use crate::config::{Config, ConnectionConfig, PoolConfig, SyncOptions};
pub use crate::core::{
    ColumnDef, Ident, Queryable, SchemaInferencer, SqlType, SqlValue, SyncOutcome, SyncPhase,
    Synchronizable, TableRef, TableSchema, TabularDataset,
};
pub use crate::drivers::{PgSynchronizer, SslMode};
pub use crate::error::{ConnectionErrorKind, Result, SyncError};
