//! Store bootstrap: wires one backend into repositories and a service.
//!
//! # Responsibility
//! - Validate configuration and open the configured database.
//! - Build the transaction manager and repositories for that backend.
//! - Close the pool within the disconnect timeout.

use crate::config::{Backend, ConfigError, StoreConfig};
use crate::context::Context;
use crate::db::{open_pool, ConnectionPool, DbError};
use crate::repo::{
    ChildRepository, DocChildRepository, DocParentRepository, ParentRepository,
    SqlChildRepository, SqlParentRepository,
};
use crate::service::FamilyService;
use crate::trace::{LogTracer, Tracer};
use crate::tx::{DocumentClient, DocumentTxManager, SqlTxManager, TransactionManager};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum StoreError {
    Config(ConfigError),
    Db(DbError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid store configuration: {err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Db(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StoreError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// One opened backend with its transaction manager and repositories.
pub struct Store {
    backend: Backend,
    pool: ConnectionPool,
    client: Option<DocumentClient>,
    tx: Arc<dyn TransactionManager>,
    parents: Arc<dyn ParentRepository>,
    children: Arc<dyn ChildRepository>,
    ping_timeout: Duration,
    disconnect_timeout: Duration,
}

impl Store {
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let pool = open_pool(config)?;

        let (client, tx, parents, children): (
            Option<DocumentClient>,
            Arc<dyn TransactionManager>,
            Arc<dyn ParentRepository>,
            Arc<dyn ChildRepository>,
        ) = match config.backend {
            Backend::Document => {
                let client = DocumentClient::new(pool.clone());
                (
                    Some(client.clone()),
                    Arc::new(DocumentTxManager::new(client.clone())),
                    Arc::new(DocParentRepository::new(&client)),
                    Arc::new(DocChildRepository::new(&client)),
                )
            }
            Backend::Relational => (
                None,
                Arc::new(SqlTxManager::new(pool.clone())),
                Arc::new(SqlParentRepository::new(pool.clone())),
                Arc::new(SqlChildRepository::new(pool.clone())),
            ),
        };

        Ok(Self {
            backend: config.backend,
            pool,
            client,
            tx,
            parents,
            children,
            ping_timeout: config.ping_timeout(),
            disconnect_timeout: config.disconnect_timeout(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn transaction_manager(&self) -> Arc<dyn TransactionManager> {
        Arc::clone(&self.tx)
    }

    pub fn parents(&self) -> Arc<dyn ParentRepository> {
        Arc::clone(&self.parents)
    }

    pub fn children(&self) -> Arc<dyn ChildRepository> {
        Arc::clone(&self.children)
    }

    /// Service over this store, tracing spans to the log.
    pub fn service(&self) -> FamilyService {
        self.service_with_tracer(Arc::new(LogTracer))
    }

    pub fn service_with_tracer(&self, tracer: Arc<dyn Tracer>) -> FamilyService {
        FamilyService::new(self.transaction_manager(), self.parents(), self.children())
            .with_tracer(tracer)
    }

    /// Connections currently checked out of the pool.
    pub fn connections_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Open document sessions; always zero on the relational backend.
    pub fn active_sessions(&self) -> usize {
        self.client
            .as_ref()
            .map_or(0, DocumentClient::active_sessions)
    }

    /// Round-trips `SELECT 1` within the ping timeout.
    pub fn ping(&self, ctx: &Context) -> Result<(), StoreError> {
        let ctx = ctx.with_timeout(self.ping_timeout);
        let conn = self.pool.get(&ctx)?;
        let _watch = ctx.watch(&conn);
        conn.query_row("SELECT 1;", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Closes the pool; fails when connections are still checked out after
    /// the disconnect timeout.
    pub fn close(self) -> Result<(), StoreError> {
        let sessions = self.active_sessions();
        if sessions > 0 {
            warn!(
                "event=store_close module=store status=warn backend={} active_sessions={}",
                self.backend, sessions
            );
        }
        self.pool.close(self.disconnect_timeout)?;
        info!(
            "event=store_close module=store status=ok backend={} pool_id={}",
            self.backend,
            self.pool.id()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreError};
    use crate::config::{Backend, ConfigError, StoreConfig};
    use crate::context::Context;
    use tempfile::TempDir;

    #[test]
    fn opens_both_backends_and_pings() {
        for backend in [Backend::Document, Backend::Relational] {
            let dir = TempDir::new().unwrap();
            let store = Store::open(&StoreConfig::new(backend, dir.path().join("kin.db"))).unwrap();
            assert_eq!(store.backend(), backend);
            store.ping(&Context::background()).unwrap();
            assert_eq!(store.connections_in_use(), 0);
            assert_eq!(store.active_sessions(), 0);
            store.close().unwrap();
        }
    }

    #[test]
    fn rejects_invalid_config_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(Backend::Relational, dir.path().join("kin.db"));
        config.pool_size = 1;
        let err = Store::open(&config).err().unwrap();
        assert!(matches!(
            err,
            StoreError::Config(ConfigError::PoolTooSmall { .. })
        ));
        assert!(!dir.path().join("kin.db").exists());
    }
}
