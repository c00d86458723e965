//! Connection pool and per-operation sessions.
//!
//! A [`Session`] owns one pooled connection for the length of one operation.
//! Mutating operations open a transaction on it with [`Session::begin`] and
//! close it with [`finish`], which commits on success and rolls back on
//! error. A transaction that is dropped without reaching `finish` (the future
//! was cancelled) is rolled back by the driver, and its `ON COMMIT DROP`
//! staging table goes with it. Dropping the session returns the connection
//! to the pool.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use deadpool_postgres::{
    Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime, Transaction,
};
use tokio_postgres::error::SqlState;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::SyncPhase;
use crate::drivers::common::connector;
use crate::error::{ConnectionErrorKind, Result, SyncError};

/// Build the connection pool described by `config`.
///
/// No connection is opened here; the first [`Session::acquire`] does that.
pub fn build_pool(config: &Config) -> Result<Pool> {
    let conn = &config.connection;
    let timeout = Duration::from_secs(config.pool.connect_timeout_secs);

    let mut pg_config = PgConfig::new();
    pg_config.host(&conn.host);
    pg_config.port(conn.port);
    pg_config.dbname(&conn.database);
    pg_config.user(&conn.user);
    pg_config.password(&conn.password);
    pg_config.application_name(&conn.application_name);

    // Connection options for reliability
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(timeout);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = match connector(conn.ssl_mode)? {
        Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        None => {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
    };

    Pool::builder(mgr)
        .max_size(config.pool.max_connections)
        .wait_timeout(Some(timeout))
        .create_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| SyncError::pool(e, "creating PostgreSQL pool"))
}

/// One pooled connection held for the duration of an operation.
pub struct Session {
    client: Object,
}

impl Session {
    /// Take a connection from the pool, opening one if needed.
    ///
    /// # Errors
    ///
    /// `Connection` with the failure classified as authentication,
    /// reachability or protocol/TLS mismatch.
    pub async fn acquire(pool: &Pool) -> Result<Self> {
        let client = pool.get().await.map_err(classify_pool_error)?;
        debug!(phase = %SyncPhase::SessionAcquired, "session acquired");
        Ok(Self { client })
    }

    /// The underlying client, for statements run outside a transaction.
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    /// Open a transaction on this session's connection.
    ///
    /// A failure here means the connection itself is unusable, so it is
    /// reported as `Connection`.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        self.client
            .transaction()
            .await
            .map_err(|e| classify_backend_error(&e))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(phase = %SyncPhase::SessionReleased, "session released");
    }
}

/// Close `tx` according to `outcome`: commit on `Ok`, roll back on `Err`.
///
/// The original error is returned unchanged after a rollback; a failure of
/// the rollback itself is only logged.
pub async fn finish<T>(
    tx: Transaction<'_>,
    target: impl fmt::Display,
    outcome: Result<T>,
) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| SyncError::merge(target.to_string(), SyncPhase::Committed, e))?;
            debug!(phase = %SyncPhase::Committed, "{}: transaction committed", target);
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("{}: rollback failed: {}", target, rollback_err);
            }
            warn!(phase = %SyncPhase::RolledBack, "{}: rolled back: {}", target, err);
            Err(err)
        }
    }
}

/// Map a pool checkout failure to a connection error kind.
fn classify_pool_error(err: PoolError) -> SyncError {
    match err {
        PoolError::Backend(e) => classify_backend_error(&e),
        PoolError::Timeout(t) => SyncError::connection(
            ConnectionErrorKind::HostUnreachable,
            format!("timed out waiting for connection ({:?})", t),
        ),
        other => SyncError::pool(other, "acquiring PostgreSQL session"),
    }
}

fn classify_backend_error(err: &tokio_postgres::Error) -> SyncError {
    let kind = if let Some(code) = err.code() {
        if *code == SqlState::INVALID_PASSWORD
            || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        {
            ConnectionErrorKind::AuthenticationFailed
        } else {
            ConnectionErrorKind::DriverMismatch
        }
    } else if is_io_failure(err) {
        ConnectionErrorKind::HostUnreachable
    } else {
        ConnectionErrorKind::DriverMismatch
    };

    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    SyncError::connection(kind, message)
}

fn is_io_failure(err: &tokio_postgres::Error) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if e.is::<std::io::Error>() {
            return true;
        }
        source = e.source();
    }
    // connect timeouts surface as io::ErrorKind::TimedOut
    false
}
