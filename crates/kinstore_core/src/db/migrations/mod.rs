//! SQLite migration registry and executor.
//!
//! # Responsibility
//! - Register schema migrations per backend in strictly increasing order.
//! - Apply pending migrations atomically.
//! - Create the document backend's JSON-path indexes.
//!
//! # Invariants
//! - `version` values must remain monotonic within one backend.
//! - Applied migration version is mirrored to `PRAGMA user_version`.

use crate::config::Backend;
use crate::db::{DbError, DbResult};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const RELATIONAL_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_relational_init.sql"),
}];

const DOCUMENT_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_document_init.sql"),
}];

/// Expression indexes backing the document backend's filters.
const DOCUMENT_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_doc_parents_active_created
        ON collection_parents (json_extract(body, '$.deleted_at'), json_extract(body, '$.created_at'));",
    "CREATE INDEX IF NOT EXISTS idx_doc_parents_email
        ON collection_parents (json_extract(body, '$.email'));",
    "CREATE INDEX IF NOT EXISTS idx_doc_children_parent
        ON collection_children (json_extract(body, '$.parent_id'), json_extract(body, '$.deleted_at'));",
    "CREATE INDEX IF NOT EXISTS idx_doc_children_active_created
        ON collection_children (json_extract(body, '$.deleted_at'), json_extract(body, '$.created_at'));",
];

fn migrations_for(backend: Backend) -> &'static [Migration] {
    match backend {
        Backend::Relational => RELATIONAL_MIGRATIONS,
        Backend::Document => DOCUMENT_MIGRATIONS,
    }
}

/// Returns the latest migration version known for `backend`.
pub fn latest_version(backend: Backend) -> u32 {
    migrations_for(backend)
        .last()
        .map_or(0, |migration| migration.version)
}

/// Applies all pending migrations for `backend` on the provided connection.
pub fn apply_migrations(conn: &mut Connection, backend: Backend) -> DbResult<()> {
    let current_version = current_user_version(conn)?;
    let latest = latest_version(backend);

    if current_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    if current_version == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in migrations_for(backend) {
        if migration.version <= current_version {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;

    Ok(())
}

/// Creates the document collections' indexes if missing.
pub fn ensure_document_indexes(conn: &Connection) -> DbResult<()> {
    for sql in DOCUMENT_INDEXES {
        conn.execute_batch(sql)?;
    }
    Ok(())
}

pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
