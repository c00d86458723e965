//! Utilities shared across database drivers.
//!
//! - [`tls`]: TLS connectors for PostgreSQL sessions

pub mod tls;

pub use tls::{connector, SslMode};
