//! Database driver implementations.
//!
//! - [`postgres`]: PostgreSQL backend implementing `Queryable` and `Synchronizable`
//! - [`common`]: shared utilities (TLS)

pub mod common;
pub mod postgres;

pub use common::SslMode;
pub use postgres::PgSynchronizer;
