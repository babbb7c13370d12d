//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open database files for the configured backend.
//! - Configure connection pragmas required by core behavior.
//! - Trigger schema migrations before returning a usable pool.
//!
//! # Invariants
//! - Every pooled connection runs in WAL mode with the configured busy timeout.
//! - Relational connections have `foreign_keys=ON`.
//! - The returned pool has migrations (and document indexes) fully applied.

use super::migrations::{apply_migrations, ensure_document_indexes};
use super::pool::ConnectionPool;
use super::DbResult;
use crate::config::{Backend, StoreConfig};
use log::{error, info};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Opens the configured database and returns a ready connection pool.
///
/// # Side effects
/// - Creates the database file when missing.
/// - Applies pending migrations and, for the document backend, indexes.
/// - Emits `db_open` logging events with duration and status.
pub fn open_pool(config: &StoreConfig) -> DbResult<ConnectionPool> {
    let started_at = Instant::now();
    let backend = config.backend;
    info!(
        "event=db_open module=db status=start backend={} pool_size={}",
        backend, config.pool_size
    );

    match bootstrap(config).and_then(|()| build_pool(config)) {
        Ok(pool) => {
            info!(
                "event=db_open module=db status=ok backend={} pool_id={} duration_ms={}",
                backend,
                pool.id(),
                started_at.elapsed().as_millis()
            );
            Ok(pool)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error backend={} duration_ms={} error_code=db_bootstrap_failed error={}",
                backend,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap(config: &StoreConfig) -> DbResult<()> {
    let mut conn = Connection::open_with_flags(PathBuf::from(&config.database_path), open_flags())?;
    configure(&conn, config.backend, config.connect_timeout())?;

    conn.busy_timeout(config.ping_timeout())?;
    conn.query_row("SELECT 1;", [], |row| row.get::<_, i64>(0))?;

    conn.busy_timeout(config.connect_timeout())?;
    apply_migrations(&mut conn, config.backend)?;

    if config.backend == Backend::Document {
        conn.busy_timeout(config.index_timeout())?;
        ensure_document_indexes(&conn)?;
    }

    Ok(())
}

/// Pool whose every new connection gets the backend's pragmas.
fn build_pool(config: &StoreConfig) -> DbResult<ConnectionPool> {
    let backend = config.backend;
    let busy_timeout = config.busy_timeout();
    let manager = SqliteConnectionManager::file(PathBuf::from(&config.database_path))
        .with_flags(open_flags())
        .with_init(move |conn| configure(conn, backend, busy_timeout));
    ConnectionPool::new(manager, config.pool_size, config.connect_timeout())
}

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI
}

fn configure(conn: &Connection, backend: Backend, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    if backend == Backend::Relational {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::open_pool;
    use crate::config::{Backend, StoreConfig};
    use crate::db::migrations::{current_user_version, latest_version};
    use crate::db::DbError;
    use rusqlite::Connection;

    #[test]
    fn open_pool_applies_backend_migrations() {
        let dir = tempfile::tempdir().unwrap();
        for backend in [Backend::Relational, Backend::Document] {
            let path = dir.path().join(format!("{backend}.db"));
            let pool = open_pool(&StoreConfig::new(backend, &path)).unwrap();
            let conn = pool.get(&crate::context::Context::background()).unwrap();
            assert_eq!(current_user_version(&conn).unwrap(), latest_version(backend));
        }
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA user_version = 999;").unwrap();
        drop(conn);

        let err = open_pool(&StoreConfig::new(Backend::Relational, &path))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DbError::UnsupportedSchemaVersion {
                db_version: 999,
                ..
            }
        ));
    }
}
