//! PostgreSQL backend.
//!
//! - [`session`]: pool construction and per-operation sessions
//! - [`copy`]: binary and text COPY encoders
//! - [`staging`]: transient staging tables
//! - [`merge`]: lock, update and anti-join insert
//! - [`query`]: read-only queries into datasets
//! - [`synchronizer`]: [`PgSynchronizer`], the public entry point

pub mod copy;
pub mod merge;
pub mod query;
pub mod session;
pub mod staging;
pub mod synchronizer;

pub use merge::ConflictMerger;
pub use query::QueryExecutor;
pub use session::{build_pool, Session};
pub use staging::StagingTable;
pub use synchronizer::PgSynchronizer;
