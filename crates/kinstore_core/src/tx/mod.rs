//! Storage-agnostic transaction port.
//!
//! # Responsibility
//! - Define begin/commit/rollback over a call-scoped [`Context`].
//! - Provide `with_tx`, the scoped unit-of-work wrapper used by services.
//!
//! # Invariants
//! - `begin_tx` joins an active transaction already bound to the context
//!   for the same store instead of nesting.
//! - Handles are one-shot: `Active -> Committed | RolledBack`.
//! - Rollback never depends on the caller's context still being live.
//! - A rollback failure never replaces the error that triggered it.

pub mod document;
pub mod relational;

pub use document::{DocumentClient, DocumentSession, DocumentTxManager};
pub use relational::{SqlTransaction, SqlTxManager};

use crate::config::Backend;
use crate::context::{Context, ContextError};
use crate::db::DbError;
use log::{error, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};

/// Lifecycle state of one native transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl Display for TxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Transaction phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Begin,
    Commit,
    Rollback,
    /// A statement issued through a bound handle.
    Execute,
}

impl TxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Execute => "execute",
        }
    }
}

#[derive(Debug)]
pub enum TxErrorCause {
    /// No handle bound to the context; carries the backend's handle noun
    /// (`transaction` or `session`).
    NoHandle(&'static str),
    /// Handle exists but already reached a terminal state.
    NotActive(TxState),
    Context(ContextError),
    Db(DbError),
}

impl Display for TxErrorCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHandle(noun) => write!(f, "no active transaction: no {noun} found in context"),
            Self::NotActive(state) => write!(f, "transaction is already {state}"),
            Self::Context(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl From<DbError> for TxErrorCause {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Context(err) => Self::Context(err),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for TxErrorCause {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ContextError> for TxErrorCause {
    fn from(value: ContextError) -> Self {
        Self::Context(value)
    }
}

/// Begin/commit/rollback failure tagged with the phase.
#[derive(Debug)]
pub struct TransactionError {
    pub op: TxOp,
    pub cause: TxErrorCause,
}

impl TransactionError {
    pub fn new(op: TxOp, cause: impl Into<TxErrorCause>) -> Self {
        Self {
            op,
            cause: cause.into(),
        }
    }

    pub fn no_handle(op: TxOp, noun: &'static str) -> Self {
        Self::new(op, TxErrorCause::NoHandle(noun))
    }

    pub fn is_no_handle(&self) -> bool {
        matches!(self.cause, TxErrorCause::NoHandle(_))
    }
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "transaction {} failed: {}", self.op.as_str(), self.cause)
    }
}

impl Error for TransactionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            TxErrorCause::Context(err) => Some(err),
            TxErrorCause::Db(err) => Some(err),
            TxErrorCause::NoHandle(_) | TxErrorCause::NotActive(_) => None,
        }
    }
}

/// Transaction port implemented once per backend.
pub trait TransactionManager: Send + Sync {
    /// Opens a transaction, or returns `ctx` unchanged when it already
    /// carries an active one for this manager.
    fn begin_tx(&self, ctx: &Context) -> Result<Context, TransactionError>;

    /// Commits the bound transaction and releases its resources.
    fn commit_tx(&self, ctx: &Context) -> Result<(), TransactionError>;

    /// Aborts the bound transaction and releases its resources, even when
    /// `ctx` is already cancelled.
    fn rollback_tx(&self, ctx: &Context) -> Result<(), TransactionError>;

    /// Whether `ctx` carries an active handle owned by this manager.
    fn has_active_tx(&self, ctx: &Context) -> bool;

    fn backend(&self) -> Backend;
}

/// Scoped unit-of-work helpers available on every manager.
pub trait TransactionManagerExt: TransactionManager {
    /// Runs `f` inside a transaction.
    ///
    /// - `Ok` commits; a commit failure is returned as the error.
    /// - `Err` rolls back and returns the original error.
    /// - A panic rolls back, then resumes unwinding.
    /// - When `ctx` already carries an active transaction, `f` joins it
    ///   and the owner of that transaction resolves it.
    fn with_tx<T, E, F>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(&Context) -> Result<T, E>,
        E: From<TransactionError> + Display,
    {
        if self.has_active_tx(ctx) {
            return f(ctx);
        }

        let tx_ctx = self.begin_tx(ctx)?;
        match panic::catch_unwind(AssertUnwindSafe(|| f(&tx_ctx))) {
            Ok(Ok(value)) => {
                self.commit_tx(&tx_ctx)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = self.rollback_tx(&tx_ctx) {
                    warn!(
                        "event=tx_rollback module=tx status=error backend={} trigger=error primary_error={} error={}",
                        self.backend(),
                        err,
                        rollback_err
                    );
                }
                Err(err)
            }
            Err(payload) => {
                if let Err(rollback_err) = self.rollback_tx(&tx_ctx) {
                    error!(
                        "event=tx_rollback module=tx status=error backend={} trigger=panic error={}",
                        self.backend(),
                        rollback_err
                    );
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<M: TransactionManager + ?Sized> TransactionManagerExt for M {}

/// Native handle types that repositories can execute statements through.
pub(crate) trait TxHandle: Send + Sync + 'static {
    /// Runs `f` on the handle's connection while it is active.
    fn run<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&rusqlite::Connection) -> T,
    ) -> Result<T, TransactionError>;
}
