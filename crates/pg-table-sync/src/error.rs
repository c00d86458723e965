//! Error types for the table synchronization library.

use std::fmt;

use thiserror::Error;

use crate::core::SyncPhase;

/// Why a connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The server rejected the supplied credentials.
    AuthenticationFailed,
    /// The host could not be reached (DNS, refused, timed out).
    HostUnreachable,
    /// The client and server could not agree on the protocol or TLS setup.
    DriverMismatch,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionErrorKind::AuthenticationFailed => "authentication failed",
            ConnectionErrorKind::HostUnreachable => "host unreachable",
            ConnectionErrorKind::DriverMismatch => "driver mismatch",
        };
        f.write_str(s)
    }
}

/// Main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The dataset cannot produce a schema (no columns).
    #[error("Schema inference failed: {0}")]
    SchemaInference(String),

    /// A schema, table or column name failed validation.
    #[error("Invalid identifier {identifier:?}: {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// Connection acquisition failed.
    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },

    /// Row arity or value type did not fit the inferred schema.
    #[error("Bulk load failed for table {table}: {message}")]
    BulkLoad { table: String, message: String },

    /// Conflict columns are empty or not present in the dataset/table.
    #[error("Invalid conflict columns for table {table}: {message}")]
    InvalidConflictColumns { table: String, message: String },

    /// Two rows of one batch share the same conflict key.
    #[error("Duplicate conflict key in batch for table {table}: {key}")]
    DuplicateConflictKey { table: String, key: String },

    /// Dataset columns that do not exist in an existing target table.
    #[error("Table {table} has no column(s) {columns:?}")]
    ColumnMismatch { table: String, columns: Vec<String> },

    /// The backend rejected a statement while preparing, staging, locking,
    /// merging or committing. `phase` is the step that was in progress.
    #[error("Merge failed for table {table} during {phase}: {}", server_message(.source))]
    MergeExecution {
        table: String,
        phase: SyncPhase,
        #[source]
        source: tokio_postgres::Error,
    },

    /// A read-only query could not be executed or decoded.
    #[error("Query failed: {message}")]
    Query { message: String },

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Database error outside the merge sequence
    #[error("Database error: {}", server_message(.0))]
    Database(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create an InvalidIdentifier error.
    pub fn identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidIdentifier {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Create a Connection error.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        SyncError::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Create a BulkLoad error.
    pub fn bulk_load(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::BulkLoad {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidConflictColumns error.
    pub fn conflict_columns(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::InvalidConflictColumns {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a MergeExecution error tagged with the phase it failed in.
    pub fn merge(table: impl Into<String>, phase: SyncPhase, source: tokio_postgres::Error) -> Self {
        SyncError::MergeExecution {
            table: table.into(),
            phase,
            source,
        }
    }

    /// Create a Query error.
    pub fn query(message: impl Into<String>) -> Self {
        SyncError::Query {
            message: message.into(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl fmt::Display, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 1,
            SyncError::Connection { .. } | SyncError::Pool { .. } => 2,
            SyncError::SchemaInference(_)
            | SyncError::InvalidIdentifier { .. }
            | SyncError::InvalidConflictColumns { .. }
            | SyncError::DuplicateConflictKey { .. }
            | SyncError::ColumnMismatch { .. } => 3,
            SyncError::BulkLoad { .. } | SyncError::MergeExecution { .. } => 4,
            SyncError::Query { .. } | SyncError::Database(_) | SyncError::Json(_) => 5,
            SyncError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// The server's own account of a failure: message, SQLSTATE and detail.
///
/// `tokio_postgres::Error` displays a database error as just "db error".
pub(crate) fn server_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => {
            let mut msg = format!("{} (SQLSTATE {})", db.message(), db.code().code());
            if let Some(detail) = db.detail() {
                msg.push_str(": ");
                msg.push_str(detail);
            }
            msg
        }
        None => err.to_string(),
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
