//! Document-store transaction manager built on client sessions.
//!
//! # Responsibility
//! - Open a session (dedicated connection + registry entry) per unit of work.
//! - Start, commit and abort multi-document transactions on that session.
//! - Always end the session so no server-side session state is leaked.
//!
//! # Invariants
//! - A session runs at most one transaction at a time.
//! - `end_session` is idempotent and aborts a still-running transaction.
//! - `DocumentClient::active_sessions()` drops back to zero once every
//!   started session has ended.

use super::{TransactionError, TransactionManager, TxErrorCause, TxHandle, TxOp, TxState};
use crate::config::Backend;
use crate::context::Context;
use crate::db::{ConnectionPool, DbResult, PooledConnection};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

const HANDLE_NOUN: &str = "session";

type SessionRegistry = Arc<Mutex<HashSet<Uuid>>>;

/// Entry point to the document store: owns the pool and session registry.
#[derive(Clone)]
pub struct DocumentClient {
    pool: ConnectionPool,
    sessions: SessionRegistry,
}

impl DocumentClient {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Starts a session bound to one pooled connection.
    pub fn start_session(&self, ctx: &Context) -> DbResult<DocumentSession> {
        ctx.check()?;
        let conn = self.pool.get(ctx)?;
        let id = Uuid::new_v4();
        lock_registry(&self.sessions).insert(id);
        debug!("event=session_start module=tx status=ok session_id={id}");
        Ok(DocumentSession {
            id,
            registry: Arc::clone(&self.sessions),
            inner: Mutex::new(SessionInner {
                conn: Some(conn),
                phase: SessionPhase::Idle,
            }),
        })
    }

    /// Sessions started but not yet ended.
    pub fn active_sessions(&self) -> usize {
        lock_registry(&self.sessions).len()
    }
}

fn lock_registry(registry: &SessionRegistry) -> MutexGuard<'_, HashSet<Uuid>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    InTransaction,
    Committed,
    Aborted,
    Ended,
}

struct SessionInner {
    conn: Option<PooledConnection>,
    phase: SessionPhase,
}

/// Client session carrying at most one running transaction.
pub struct DocumentSession {
    id: Uuid,
    registry: SessionRegistry,
    inner: Mutex<SessionInner>,
}

impl DocumentSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// State of the session's current (or last) transaction.
    pub fn transaction_state(&self) -> TxState {
        phase_state(self.lock().phase)
    }

    pub fn is_ended(&self) -> bool {
        self.lock().phase == SessionPhase::Ended
    }

    pub fn start_transaction(&self, ctx: &Context) -> Result<(), TxErrorCause> {
        ctx.check()?;
        let mut inner = self.lock();
        match inner.phase {
            SessionPhase::InTransaction => return Err(TxErrorCause::NotActive(TxState::Active)),
            SessionPhase::Ended => return Err(TxErrorCause::NotActive(TxState::RolledBack)),
            SessionPhase::Idle | SessionPhase::Committed | SessionPhase::Aborted => {}
        }
        if let Some(conn) = inner.conn.as_ref() {
            conn.execute_batch("BEGIN IMMEDIATE;")?;
        }
        inner.phase = SessionPhase::InTransaction;
        Ok(())
    }

    pub fn commit_transaction(&self, ctx: &Context) -> Result<(), TxErrorCause> {
        let mut inner = self.lock();
        if inner.phase != SessionPhase::InTransaction {
            return Err(TxErrorCause::NotActive(phase_state(inner.phase)));
        }
        ctx.check()?;
        if let Some(conn) = inner.conn.as_ref() {
            conn.execute_batch("COMMIT;")?;
        }
        inner.phase = SessionPhase::Committed;
        Ok(())
    }

    pub fn abort_transaction(&self, ctx: &Context) -> Result<(), TxErrorCause> {
        let mut inner = self.lock();
        if inner.phase != SessionPhase::InTransaction {
            return Err(TxErrorCause::NotActive(phase_state(inner.phase)));
        }
        ctx.check()?;
        inner.phase = SessionPhase::Aborted;
        match inner.conn.as_ref() {
            Some(conn) if !conn.is_autocommit() => {
                conn.execute_batch("ROLLBACK;")?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Ends the session: aborts a running transaction, returns the
    /// connection and unregisters the session. Safe to call repeatedly.
    pub fn end_session(&self, ctx: &Context) {
        let mut inner = self.lock();
        if inner.phase == SessionPhase::Ended {
            return;
        }
        if inner.phase == SessionPhase::InTransaction {
            warn!(
                "event=session_end module=tx status=warn session_id={} reason=transaction_still_running",
                self.id
            );
            if let Some(conn) = inner.conn.as_ref() {
                if let Err(err) = conn.execute_batch("ROLLBACK;") {
                    error!(
                        "event=session_end module=tx status=error session_id={} error_code=abort_failed error={}",
                        self.id, err
                    );
                }
            }
        }
        if ctx.is_done() {
            debug!(
                "event=session_end module=tx status=detached session_id={}",
                self.id
            );
        }
        inner.phase = SessionPhase::Ended;
        inner.conn = None;
        lock_registry(&self.registry).remove(&self.id);
        debug!("event=session_end module=tx status=ok session_id={}", self.id);
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn phase_state(phase: SessionPhase) -> TxState {
    match phase {
        SessionPhase::InTransaction => TxState::Active,
        SessionPhase::Committed => TxState::Committed,
        SessionPhase::Idle | SessionPhase::Aborted | SessionPhase::Ended => TxState::RolledBack,
    }
}

impl TxHandle for DocumentSession {
    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> T) -> Result<T, TransactionError> {
        let inner = self.lock();
        match (inner.phase, inner.conn.as_ref()) {
            (SessionPhase::InTransaction, Some(conn)) => {
                let _watch = ctx.watch(conn);
                Ok(f(conn))
            }
            (phase, _) => Err(TransactionError::new(
                TxOp::Execute,
                TxErrorCause::NotActive(phase_state(phase)),
            )),
        }
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.end_session(&Context::background());
    }
}

/// Transaction manager for the document backend.
#[derive(Clone)]
pub struct DocumentTxManager {
    client: DocumentClient,
}

impl DocumentTxManager {
    pub fn new(client: DocumentClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &DocumentClient {
        &self.client
    }

    fn session(&self, ctx: &Context) -> Option<Arc<DocumentSession>> {
        ctx.tx_handle::<DocumentSession>(self.client.pool.id())
    }
}

impl TransactionManager for DocumentTxManager {
    fn begin_tx(&self, ctx: &Context) -> Result<Context, TransactionError> {
        if self.has_active_tx(ctx) {
            debug!("event=tx_begin module=tx status=joined backend=document");
            return Ok(ctx.clone());
        }
        ctx.check()
            .map_err(|err| TransactionError::new(TxOp::Begin, err))?;

        let session = self
            .client
            .start_session(ctx)
            .map_err(|err| TransactionError::new(TxOp::Begin, err))?;
        if let Err(cause) = session.start_transaction(ctx) {
            session.end_session(&Context::background());
            return Err(TransactionError::new(TxOp::Begin, cause));
        }
        debug!(
            "event=tx_begin module=tx status=ok backend=document session_id={}",
            session.id()
        );
        Ok(ctx.with_tx_handle(self.client.pool.id(), Arc::new(session)))
    }

    fn commit_tx(&self, ctx: &Context) -> Result<(), TransactionError> {
        let session = self
            .session(ctx)
            .ok_or_else(|| TransactionError::no_handle(TxOp::Commit, HANDLE_NOUN))?;
        let background = Context::background();
        let result = session.commit_transaction(ctx);
        if result.is_err() && session.transaction_state() == TxState::Active {
            if let Err(abort_err) = session.abort_transaction(&background) {
                error!(
                    "event=tx_commit module=tx status=error backend=document session_id={} error_code=abort_after_commit_failed error={}",
                    session.id(),
                    abort_err
                );
            }
        }
        session.end_session(&background);
        result.map_err(|cause| TransactionError::new(TxOp::Commit, cause))?;
        debug!(
            "event=tx_commit module=tx status=ok backend=document session_id={}",
            session.id()
        );
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<(), TransactionError> {
        let session = self
            .session(ctx)
            .ok_or_else(|| TransactionError::no_handle(TxOp::Rollback, HANDLE_NOUN))?;
        // Abort and end on a fresh context: the caller's may be cancelled.
        let background = Context::background();
        let result = session.abort_transaction(&background);
        session.end_session(&background);
        if ctx.is_done() {
            info!(
                "event=tx_rollback module=tx status=detached backend=document session_id={} reason=context_done",
                session.id()
            );
        }
        result.map_err(|cause| TransactionError::new(TxOp::Rollback, cause))
    }

    fn has_active_tx(&self, ctx: &Context) -> bool {
        self.session(ctx)
            .is_some_and(|session| session.transaction_state() == TxState::Active)
    }

    fn backend(&self) -> Backend {
        Backend::Document
    }
}
