//! Repository layer contracts and persistence implementations.
//!
//! # Responsibility
//! - Define per-entity data access contracts shared by both backends.
//! - Isolate SQL / JSON-path details from service orchestration.
//! - Join the caller's transaction when the context carries one.
//!
//! # Invariants
//! - Reads never return soft-deleted records unless explicitly asked to.
//! - Repository APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors; zero matched rows on update/delete is `NotFound`.
//! - Write paths validate records before touching storage.

pub mod document;
pub mod page;
pub mod query;
pub mod relational;

pub use document::{DocChildRepository, DocParentRepository};
pub use page::fetch_page;
pub use query::{
    ListFilter, PagedResult, Pagination, QueryOptions, Sort, SortDirection, SortField,
};
pub use relational::{SqlChildRepository, SqlParentRepository};

use crate::context::{Context, ContextError};
use crate::db::{ConnectionPool, DbError};
use crate::model::child::Child;
use crate::model::parent::Parent;
use crate::model::{now_ms, EntityId, EntityKind, ValidationError};
use crate::tx::{TransactionError, TxHandle};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for parent/child persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    /// No non-deleted record matched.
    NotFound { entity: EntityKind, id: EntityId },
    Validation(ValidationError),
    Db(DbError),
    /// The context was cancelled or expired before or during the call.
    Cancelled(ContextError),
    /// The bound transaction handle can no longer execute statements.
    Transaction(TransactionError),
    InvalidData(String),
}

impl RepoError {
    pub fn not_found(entity: EntityKind, id: EntityId) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Cancelled(err) => write!(f, "{err}"),
            Self::Transaction(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Cancelled(err) => Some(err),
            Self::Transaction(err) => Some(err),
            Self::NotFound { .. } => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Context(err) => Self::Cancelled(err),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ContextError> for RepoError {
    fn from(value: ContextError) -> Self {
        Self::Cancelled(value)
    }
}

impl From<TransactionError> for RepoError {
    fn from(value: TransactionError) -> Self {
        Self::Transaction(value)
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidData(value.to_string())
    }
}

/// Repository interface for the Parent aggregate.
pub trait ParentRepository: Send + Sync {
    fn create(&self, ctx: &Context, parent: &Parent) -> RepoResult<()>;

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Parent>>;

    /// Returns the non-deleted parent or `RepoError::NotFound`.
    fn get_by_id(&self, ctx: &Context, id: EntityId) -> RepoResult<Parent> {
        self.find_by_id(ctx, id, false)?
            .ok_or(RepoError::not_found(EntityKind::Parent, id))
    }

    /// Persists all fields (including the embedded projection) and
    /// refreshes `parent.updated_at`.
    fn update(&self, ctx: &Context, parent: &mut Parent) -> RepoResult<()>;

    fn delete(&self, ctx: &Context, id: EntityId) -> RepoResult<()> {
        self.mark_deleted(ctx, id, now_ms())
    }

    /// Soft-deletes with a caller-chosen timestamp.
    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()>;

    fn list(&self, ctx: &Context, options: &QueryOptions)
        -> RepoResult<(Vec<Parent>, PagedResult)>;

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64>;
}

/// Repository interface for standalone Child records.
pub trait ChildRepository: Send + Sync {
    /// Inserts the child after checking its parent exists and is not
    /// deleted (`NotFound { entity: Parent }` otherwise).
    fn create(&self, ctx: &Context, child: &Child) -> RepoResult<()>;

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Child>>;

    fn get_by_id(&self, ctx: &Context, id: EntityId) -> RepoResult<Child> {
        self.find_by_id(ctx, id, false)?
            .ok_or(RepoError::not_found(EntityKind::Child, id))
    }

    fn update(&self, ctx: &Context, child: &mut Child) -> RepoResult<()>;

    fn delete(&self, ctx: &Context, id: EntityId) -> RepoResult<()> {
        self.mark_deleted(ctx, id, now_ms())
    }

    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()>;

    /// Soft-deletes every non-deleted child of `parent_id`; returns the
    /// number of children affected.
    fn mark_deleted_by_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        deleted_at: i64,
    ) -> RepoResult<u64>;

    /// Non-deleted children of `parent_id`, oldest first.
    fn list_by_parent(&self, ctx: &Context, parent_id: EntityId) -> RepoResult<Vec<Child>>;

    fn list(&self, ctx: &Context, options: &QueryOptions) -> RepoResult<(Vec<Child>, PagedResult)>;

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64>;
}

/// Runs `f` on the context's transaction connection when one is bound for
/// this pool, otherwise on a freshly checked-out connection.
///
/// Statements interrupted because the context ended surface as
/// `RepoError::Cancelled`.
pub(crate) fn run_on<H, T>(
    pool: &ConnectionPool,
    ctx: &Context,
    f: impl FnOnce(&Connection) -> RepoResult<T>,
) -> RepoResult<T>
where
    H: TxHandle,
{
    ctx.check()?;
    let result = match ctx.tx_handle::<H>(pool.id()) {
        Some(handle) => handle.run(ctx, f)?,
        None => {
            let conn = pool.get(ctx)?;
            let _watch = ctx.watch(&conn);
            f(&conn)
        }
    };

    match result {
        Err(RepoError::Db(err)) if err.is_interrupted() => match ctx.err() {
            Some(reason) => Err(RepoError::Cancelled(reason)),
            None => Err(RepoError::Db(err)),
        },
        other => other,
    }
}
