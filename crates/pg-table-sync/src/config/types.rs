//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use crate::drivers::common::SslMode;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection parameters.
    pub connection: ConnectionConfig,

    /// Connection pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Synchronization behavior.
    #[serde(default)]
    pub sync: SyncOptions,
}

impl Config {
    /// Build a config from connection parameters with default pool and sync settings.
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            pool: PoolConfig::default(),
            sync: SyncOptions::default(),
        }
    }
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Schema used for unqualified table names (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Reported to the server as `application_name`.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum pooled connections (default: 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds to wait for a TCP connection or a free pool slot (default: 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Synchronization behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Rows inspected by schema inference. All rows if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rows: Option<usize>,

    /// Datasets with at least this many rows are staged with COPY;
    /// smaller ones use prepared row inserts (default: 500).
    #[serde(default = "default_copy_threshold_rows")]
    pub copy_threshold_rows: usize,

    /// Give up waiting for the target-table lock after this many seconds.
    /// Waits indefinitely if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_secs: Option<u64>,

    /// Add dataset columns missing from an existing target during
    /// insert/upsert (default: false).
    #[serde(default)]
    pub add_missing_columns: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sample_rows: None,
            copy_threshold_rows: default_copy_threshold_rows(),
            lock_timeout_secs: None,
            add_missing_columns: false,
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_application_name() -> String {
    "pg-table-sync".to_string()
}

fn default_max_connections() -> usize {
    8
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_copy_threshold_rows() -> usize {
    500
}
