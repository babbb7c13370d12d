//! SQLite storage bootstrap, migrations and connection pooling.
//!
//! # Responsibility
//! - Open and configure SQLite connections for either backend.
//! - Apply the backend's schema migrations in deterministic order.
//! - Hand out pooled connections to transaction managers and repositories.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Core code must not read/write application data before migrations succeed.
//! - A connection returned to the pool is never inside a transaction.

use crate::context::ContextError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;
mod pool;

pub use open::open_pool;
pub use pool::{ConnectionPool, PooledConnection};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// No connection could be checked out before the checkout timeout.
    Pool(r2d2::Error),
    /// The pool was closed before or while waiting for a connection.
    PoolClosed,
    /// The caller's context ended while waiting for a connection.
    Context(ContextError),
    /// Connections were still checked out when the close timeout elapsed.
    ConnectionsLeaked { in_use: usize },
}

impl DbError {
    /// Whether SQLite reported the statement as interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::OperationInterrupted
        )
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Pool(err) => write!(f, "connection pool: {err}"),
            Self::PoolClosed => write!(f, "connection pool is closed"),
            Self::Context(err) => write!(f, "waiting for connection: {err}"),
            Self::ConnectionsLeaked { in_use } => {
                write!(f, "{in_use} connection(s) still checked out at close")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Context(err) => Some(err),
            Self::Pool(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::PoolClosed => None,
            Self::ConnectionsLeaked { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<r2d2::Error> for DbError {
    fn from(value: r2d2::Error) -> Self {
        Self::Pool(value)
    }
}

impl From<ContextError> for DbError {
    fn from(value: ContextError) -> Self {
        Self::Context(value)
    }
}
