//! Parent/child use-case service.
//!
//! # Responsibility
//! - Run multi-step parent/child protocols inside one transaction.
//! - Keep each Parent's embedded projection in sync with Child records.
//! - Map repository failures into the service error taxonomy once.
//!
//! # Invariants
//! - After any successful call, a Parent's `embedded_children` equals the
//!   set of its non-deleted Child records.
//! - Deleting a Parent soft-deletes its children with the same timestamp.
//! - Validation failures are reported before any storage call.

use crate::context::Context;
use crate::model::child::{Child, NewChild};
use crate::model::parent::{NewParent, Parent};
use crate::model::{now_ms, EntityId, EntityKind, ValidationError};
use crate::repo::{
    ChildRepository, PagedResult, ParentRepository, QueryOptions, RepoError,
};
use crate::trace::{NoopTracer, Span, Tracer};
use crate::tx::{TransactionError, TransactionManager, TransactionManagerExt};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by [`FamilyService`].
#[derive(Debug)]
pub enum ServiceError {
    /// Entity absent or already soft-deleted.
    NotFound { entity: EntityKind, id: EntityId },
    /// Caller-supplied data rejected before any storage call.
    Validation(ValidationError),
    /// Begin/commit/rollback itself failed.
    Transaction(TransactionError),
    /// Any other storage failure, tagged with what was being done.
    Database {
        operation: &'static str,
        entity: EntityKind,
        source: RepoError,
    },
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn from_repo(operation: &'static str, entity: EntityKind, err: RepoError) -> Self {
        match err {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::Validation(err) => Self::Validation(err),
            RepoError::Transaction(err) => Self::Transaction(err),
            source => Self::Database {
                operation,
                entity,
                source,
            },
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Validation(err) => write!(f, "validation failed: {err}"),
            Self::Transaction(err) => write!(f, "{err}"),
            Self::Database {
                operation,
                entity,
                source,
            } => write!(f, "database error during {operation} on {entity}: {source}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound { .. } => None,
            Self::Validation(err) => Some(err),
            Self::Transaction(err) => Some(err),
            Self::Database { source, .. } => Some(source),
        }
    }
}

impl From<TransactionError> for ServiceError {
    fn from(value: TransactionError) -> Self {
        Self::Transaction(value)
    }
}

impl From<ValidationError> for ServiceError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

fn wrap(operation: &'static str, entity: EntityKind) -> impl FnOnce(RepoError) -> ServiceError {
    move |err| ServiceError::from_repo(operation, entity, err)
}

/// Orchestrates parent/child use cases over one backend.
#[derive(Clone)]
pub struct FamilyService {
    tx: Arc<dyn TransactionManager>,
    parents: Arc<dyn ParentRepository>,
    children: Arc<dyn ChildRepository>,
    tracer: Arc<dyn Tracer>,
}

impl FamilyService {
    pub fn new(
        tx: Arc<dyn TransactionManager>,
        parents: Arc<dyn ParentRepository>,
        children: Arc<dyn ChildRepository>,
    ) -> Self {
        Self {
            tx,
            parents,
            children,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.tx
    }

    fn traced<T>(&self, name: &'static str, f: impl FnOnce() -> ServiceResult<T>) -> ServiceResult<T> {
        let mut span = Span::start(self.tracer.as_ref(), name);
        let result = f();
        span.record_result(&result);
        result
    }

    pub fn create_parent(&self, ctx: &Context, input: NewParent) -> ServiceResult<Parent> {
        self.traced("create_parent", || {
            let parent = Parent::from_input(input);
            parent.validate()?;
            self.parents
                .create(ctx, &parent)
                .map_err(wrap("create_parent", EntityKind::Parent))?;
            Ok(parent)
        })
    }

    pub fn get_parent(&self, ctx: &Context, id: EntityId) -> ServiceResult<Parent> {
        self.traced("get_parent", || {
            self.parents
                .get_by_id(ctx, id)
                .map_err(wrap("get_parent", EntityKind::Parent))
        })
    }

    /// Persists the caller's scalar fields; the embedded projection is
    /// owned by the child protocols and is taken from storage.
    pub fn update_parent(&self, ctx: &Context, parent: &mut Parent) -> ServiceResult<()> {
        parent.validate()?;
        self.traced("update_parent", || {
            self.tx.with_tx(ctx, |tx| {
                let stored = self
                    .parents
                    .get_by_id(tx, parent.id)
                    .map_err(wrap("update_parent", EntityKind::Parent))?;
                parent.embedded_children = stored.embedded_children;
                parent.created_at = stored.created_at;
                self.parents
                    .update(tx, parent)
                    .map_err(wrap("update_parent", EntityKind::Parent))
            })
        })
    }

    /// Soft-deletes the parent and all of its children atomically.
    pub fn delete_parent(&self, ctx: &Context, id: EntityId) -> ServiceResult<()> {
        self.traced("delete_parent", || {
            let deleted_children = self.tx.with_tx(ctx, |tx| {
                let deleted_at = now_ms();
                self.parents
                    .mark_deleted(tx, id, deleted_at)
                    .map_err(wrap("delete_parent", EntityKind::Parent))?;
                self.children
                    .mark_deleted_by_parent(tx, id, deleted_at)
                    .map_err(wrap("delete_parent", EntityKind::Child))
            })?;
            info!(
                "event=parent_delete module=service status=ok children_deleted={}",
                deleted_children
            );
            Ok(())
        })
    }

    pub fn list_parents(
        &self,
        ctx: &Context,
        options: &QueryOptions,
    ) -> ServiceResult<(Vec<Parent>, PagedResult)> {
        self.traced("list_parents", || {
            self.parents
                .list(ctx, options)
                .map_err(wrap("list_parents", EntityKind::Parent))
        })
    }

    /// Inserts a child and appends its snapshot to the parent projection.
    pub fn create_child(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        input: NewChild,
    ) -> ServiceResult<Child> {
        let child = Child::from_input(parent_id, input);
        child.validate()?;
        self.traced("create_child", || {
            self.tx.with_tx(ctx, |tx| {
                self.parents
                    .get_by_id(tx, parent_id)
                    .map_err(wrap("create_child", EntityKind::Parent))?;
                self.children
                    .create(tx, &child)
                    .map_err(wrap("create_child", EntityKind::Child))?;

                let mut parent = self
                    .parents
                    .get_by_id(tx, parent_id)
                    .map_err(wrap("create_child", EntityKind::Parent))?;
                parent.upsert_child(child.clone());
                self.parents
                    .update(tx, &mut parent)
                    .map_err(wrap("create_child", EntityKind::Parent))?;
                Ok(child)
            })
        })
    }

    pub fn get_child(&self, ctx: &Context, id: EntityId) -> ServiceResult<Child> {
        self.traced("get_child", || {
            self.children
                .get_by_id(ctx, id)
                .map_err(wrap("get_child", EntityKind::Child))
        })
    }

    /// Updates the child record and refreshes its snapshot. The parent
    /// reference is kept as stored; use `add_child_to_parent` to move it.
    pub fn update_child(&self, ctx: &Context, child: &mut Child) -> ServiceResult<()> {
        child.validate()?;
        self.traced("update_child", || {
            self.tx.with_tx(ctx, |tx| {
                let stored = self
                    .children
                    .get_by_id(tx, child.id)
                    .map_err(wrap("update_child", EntityKind::Child))?;
                child.parent_id = stored.parent_id;
                child.created_at = stored.created_at;
                self.children
                    .update(tx, child)
                    .map_err(wrap("update_child", EntityKind::Child))?;

                if let Some(mut parent) = self.visible_parent(tx, child.parent_id, "update_child")? {
                    parent.upsert_child(child.clone());
                    self.parents
                        .update(tx, &mut parent)
                        .map_err(wrap("update_child", EntityKind::Parent))?;
                }
                Ok(())
            })
        })
    }

    /// Soft-deletes a child and drops its snapshot. A parent that is no
    /// longer visible does not fail the call.
    pub fn delete_child(&self, ctx: &Context, id: EntityId) -> ServiceResult<()> {
        self.traced("delete_child", || {
            self.tx.with_tx(ctx, |tx| {
                let child = self
                    .children
                    .get_by_id(tx, id)
                    .map_err(wrap("delete_child", EntityKind::Child))?;
                let parent = self.visible_parent(tx, child.parent_id, "delete_child")?;

                self.children
                    .mark_deleted(tx, id, now_ms())
                    .map_err(wrap("delete_child", EntityKind::Child))?;

                if let Some(mut parent) = parent {
                    if parent.remove_child(id) {
                        self.parents
                            .update(tx, &mut parent)
                            .map_err(wrap("delete_child", EntityKind::Parent))?;
                    }
                }
                Ok(())
            })
        })
    }

    pub fn list_children(
        &self,
        ctx: &Context,
        options: &QueryOptions,
    ) -> ServiceResult<(Vec<Child>, PagedResult)> {
        self.traced("list_children", || {
            self.children
                .list(ctx, options)
                .map_err(wrap("list_children", EntityKind::Child))
        })
    }

    /// Moves (or confirms) `child_id` under `parent_id` and returns the
    /// target parent with its refreshed projection.
    pub fn add_child_to_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        child_id: EntityId,
    ) -> ServiceResult<Parent> {
        self.traced("add_child_to_parent", || {
            self.tx.with_tx(ctx, |tx| {
                let mut target = self
                    .parents
                    .get_by_id(tx, parent_id)
                    .map_err(wrap("add_child_to_parent", EntityKind::Parent))?;
                let mut child = self
                    .children
                    .get_by_id(tx, child_id)
                    .map_err(wrap("add_child_to_parent", EntityKind::Child))?;

                if child.parent_id != parent_id {
                    let previous =
                        self.visible_parent(tx, child.parent_id, "add_child_to_parent")?;
                    if let Some(mut previous) = previous {
                        if previous.remove_child(child_id) {
                            self.parents
                                .update(tx, &mut previous)
                                .map_err(wrap("add_child_to_parent", EntityKind::Parent))?;
                        }
                    }
                    child.parent_id = parent_id;
                    self.children
                        .update(tx, &mut child)
                        .map_err(wrap("add_child_to_parent", EntityKind::Child))?;
                }

                target.upsert_child(child);
                self.parents
                    .update(tx, &mut target)
                    .map_err(wrap("add_child_to_parent", EntityKind::Parent))?;
                Ok(target)
            })
        })
    }

    /// Drops `child_id` from the projection and soft-deletes the child.
    /// Fails with `NotFound` when the projection does not contain it.
    pub fn remove_child_from_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        child_id: EntityId,
    ) -> ServiceResult<Parent> {
        self.traced("remove_child_from_parent", || {
            self.tx.with_tx(ctx, |tx| {
                let mut parent = self
                    .parents
                    .get_by_id(tx, parent_id)
                    .map_err(wrap("remove_child_from_parent", EntityKind::Parent))?;
                if !parent.remove_child(child_id) {
                    return Err(ServiceError::NotFound {
                        entity: EntityKind::Child,
                        id: child_id,
                    });
                }

                match self.children.mark_deleted(tx, child_id, now_ms()) {
                    Ok(()) => {}
                    Err(RepoError::NotFound { .. }) => {
                        warn!(
                            "event=child_remove module=service status=warn reason=stale_projection_entry"
                        );
                    }
                    Err(err) => {
                        return Err(ServiceError::from_repo(
                            "remove_child_from_parent",
                            EntityKind::Child,
                            err,
                        ))
                    }
                }

                self.parents
                    .update(tx, &mut parent)
                    .map_err(wrap("remove_child_from_parent", EntityKind::Parent))?;
                Ok(parent)
            })
        })
    }

    /// Recomputes the projection from the authoritative child records.
    pub fn rebuild_children_projection(
        &self,
        ctx: &Context,
        parent_id: EntityId,
    ) -> ServiceResult<Parent> {
        self.traced("rebuild_children_projection", || {
            self.tx.with_tx(ctx, |tx| {
                let mut parent = self
                    .parents
                    .get_by_id(tx, parent_id)
                    .map_err(wrap("rebuild_children_projection", EntityKind::Parent))?;
                parent.embedded_children = self
                    .children
                    .list_by_parent(tx, parent_id)
                    .map_err(wrap("rebuild_children_projection", EntityKind::Child))?;
                self.parents
                    .update(tx, &mut parent)
                    .map_err(wrap("rebuild_children_projection", EntityKind::Parent))?;
                Ok(parent)
            })
        })
    }

    /// Non-deleted parent or `None` when it is no longer visible.
    fn visible_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        operation: &'static str,
    ) -> ServiceResult<Option<Parent>> {
        self.parents
            .find_by_id(ctx, parent_id, false)
            .map_err(wrap(operation, EntityKind::Parent))
    }
}
