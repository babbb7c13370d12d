//! Relational transaction manager: native connection-bound transactions.
//!
//! # Responsibility
//! - Open an immediate transaction on a pooled connection per unit of work.
//! - Commit/rollback directly on that transaction handle.
//!
//! # Invariants
//! - The connection goes back to the pool exactly once, after the handle
//!   reaches a terminal state.
//! - Dropping an active handle rolls it back.

use super::{TransactionError, TransactionManager, TxErrorCause, TxHandle, TxOp, TxState};
use crate::config::Backend;
use crate::context::Context;
use crate::db::{ConnectionPool, PooledConnection};
use log::{debug, error, info};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const HANDLE_NOUN: &str = "transaction";

/// One native SQL transaction bound to a pooled connection.
pub struct SqlTransaction {
    inner: Mutex<SqlTxInner>,
}

struct SqlTxInner {
    conn: Option<PooledConnection>,
    state: TxState,
}

impl SqlTransaction {
    fn begin(pool: &ConnectionPool, ctx: &Context) -> Result<Self, TxErrorCause> {
        ctx.check()?;
        let conn = pool.get(ctx)?;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(Self {
            inner: Mutex::new(SqlTxInner {
                conn: Some(conn),
                state: TxState::Active,
            }),
        })
    }

    pub fn state(&self) -> TxState {
        self.lock().state
    }

    /// Commits and releases the connection.
    ///
    /// A failed `COMMIT` is followed by a best-effort `ROLLBACK`; either way
    /// the handle ends released.
    pub fn commit(&self, ctx: &Context) -> Result<(), TxErrorCause> {
        let mut inner = self.lock();
        if inner.state != TxState::Active {
            return Err(TxErrorCause::NotActive(inner.state));
        }

        let outcome = match ctx.check() {
            Ok(()) => inner
                .conn
                .as_ref()
                .map_or(Ok(()), |conn| conn.execute_batch("COMMIT;"))
                .map_err(TxErrorCause::from),
            Err(err) => Err(TxErrorCause::Context(err)),
        };

        match outcome {
            Ok(()) => {
                inner.state = TxState::Committed;
                inner.conn = None;
                Ok(())
            }
            Err(err) => {
                if let Some(conn) = inner.conn.as_ref() {
                    if !conn.is_autocommit() {
                        if let Err(rollback_err) = conn.execute_batch("ROLLBACK;") {
                            error!(
                                "event=tx_commit module=tx status=error backend=relational error_code=rollback_after_commit_failed error={}",
                                rollback_err
                            );
                        }
                    }
                }
                inner.state = TxState::RolledBack;
                inner.conn = None;
                Err(err)
            }
        }
    }

    /// Rolls back and releases the connection.
    pub fn rollback(&self, ctx: &Context) -> Result<(), TxErrorCause> {
        let mut inner = self.lock();
        if inner.state != TxState::Active {
            return Err(TxErrorCause::NotActive(inner.state));
        }
        inner.state = TxState::RolledBack;
        // The connection is released even if ROLLBACK fails; the pool
        // retries the rollback or discards the connection.
        let conn = inner.conn.take();
        ctx.check()?;
        match conn {
            Some(conn) if !conn.is_autocommit() => {
                conn.execute_batch("ROLLBACK;")?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SqlTxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TxHandle for SqlTransaction {
    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> T) -> Result<T, TransactionError> {
        let inner = self.lock();
        match (&inner.state, inner.conn.as_ref()) {
            (TxState::Active, Some(conn)) => {
                let _watch = ctx.watch(conn);
                Ok(f(conn))
            }
            (state, _) => Err(TransactionError::new(
                TxOp::Execute,
                TxErrorCause::NotActive(*state),
            )),
        }
    }
}

impl Drop for SqlTransaction {
    fn drop(&mut self) {
        if self.state() == TxState::Active {
            debug!("event=tx_drop module=tx status=rollback backend=relational");
            if let Err(err) = self.rollback(&Context::background()) {
                error!(
                    "event=tx_drop module=tx status=error backend=relational error={}",
                    err
                );
            }
        }
    }
}

/// Transaction manager for the relational backend.
#[derive(Clone)]
pub struct SqlTxManager {
    pool: ConnectionPool,
}

impl SqlTxManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn handle(&self, ctx: &Context) -> Option<Arc<SqlTransaction>> {
        ctx.tx_handle::<SqlTransaction>(self.pool.id())
    }
}

impl TransactionManager for SqlTxManager {
    fn begin_tx(&self, ctx: &Context) -> Result<Context, TransactionError> {
        if self.has_active_tx(ctx) {
            debug!("event=tx_begin module=tx status=joined backend=relational");
            return Ok(ctx.clone());
        }
        let tx = SqlTransaction::begin(&self.pool, ctx)
            .map_err(|cause| TransactionError::new(TxOp::Begin, cause))?;
        debug!("event=tx_begin module=tx status=ok backend=relational");
        Ok(ctx.with_tx_handle(self.pool.id(), Arc::new(tx)))
    }

    fn commit_tx(&self, ctx: &Context) -> Result<(), TransactionError> {
        let tx = self
            .handle(ctx)
            .ok_or_else(|| TransactionError::no_handle(TxOp::Commit, HANDLE_NOUN))?;
        tx.commit(ctx)
            .map_err(|cause| TransactionError::new(TxOp::Commit, cause))?;
        debug!("event=tx_commit module=tx status=ok backend=relational");
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<(), TransactionError> {
        let tx = self
            .handle(ctx)
            .ok_or_else(|| TransactionError::no_handle(TxOp::Rollback, HANDLE_NOUN))?;
        let result = tx
            .rollback(&Context::background())
            .map_err(|cause| TransactionError::new(TxOp::Rollback, cause));
        if ctx.is_done() {
            info!("event=tx_rollback module=tx status=detached backend=relational reason=context_done");
        }
        result
    }

    fn has_active_tx(&self, ctx: &Context) -> bool {
        self.handle(ctx)
            .is_some_and(|tx| tx.state() == TxState::Active)
    }

    fn backend(&self) -> Backend {
        Backend::Relational
    }
}
