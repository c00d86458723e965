//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let conn = &config.connection;

    if conn.host.is_empty() {
        return Err(SyncError::Config("connection.host is required".into()));
    }
    if conn.database.is_empty() {
        return Err(SyncError::Config("connection.database is required".into()));
    }
    if conn.user.is_empty() {
        return Err(SyncError::Config("connection.user is required".into()));
    }
    if conn.port == 0 {
        return Err(SyncError::Config("connection.port must be non-zero".into()));
    }

    validate_identifier(&conn.schema)
        .map_err(|e| SyncError::Config(format!("connection.schema: {}", e)))?;

    if config.pool.max_connections == 0 {
        return Err(SyncError::Config(
            "pool.max_connections must be at least 1".into(),
        ));
    }
    if config.pool.connect_timeout_secs == 0 {
        return Err(SyncError::Config(
            "pool.connect_timeout_secs must be at least 1".into(),
        ));
    }

    if let Some(0) = config.sync.sample_rows {
        return Err(SyncError::Config(
            "sync.sample_rows must be at least 1".into(),
        ));
    }
    if let Some(0) = config.sync.lock_timeout_secs {
        return Err(SyncError::Config(
            "sync.lock_timeout_secs must be at least 1 (omit it to wait indefinitely)".into(),
        ));
    }

    Ok(())
}
