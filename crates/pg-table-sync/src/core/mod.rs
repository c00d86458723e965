//! Core abstractions for backend-neutral table synchronization.
//!
//! - [`identifier`]: identifier validation, `Ident`, `TableRef`
//! - [`value`]: cell values
//! - [`dataset`]: the caller-owned tabular dataset
//! - [`schema`]: inferred column and table metadata
//! - [`inference`]: schema inference and value coercion
//! - [`phase`]: per-operation state machine
//! - [`traits`]: `Queryable` and `Synchronizable` capabilities

pub mod dataset;
pub mod identifier;
pub mod inference;
pub mod phase;
pub mod schema;
pub mod traits;
pub mod value;

pub use dataset::TabularDataset;
pub use identifier::{validate_identifier, Ident, TableRef};
pub use inference::{coerce, SchemaInferencer};
pub use phase::SyncPhase;
pub use schema::{ColumnDef, DeclaredColumn, SqlType, TableSchema};
pub use traits::{Queryable, SyncOutcome, Synchronizable};
pub use value::SqlValue;
