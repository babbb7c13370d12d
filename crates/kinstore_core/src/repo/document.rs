//! Document repositories over JSON collections.
//!
//! # Responsibility
//! - Store each Parent/Child as one JSON document keyed by id.
//! - Translate list filters into JSON-path expressions.
//!
//! # Invariants
//! - A parent document carries its embedded children inline.
//! - Updates replace the whole document; soft delete patches only the
//!   `deleted_at` and `updated_at` paths.

use super::page::fetch_page;
use super::query::{render_filter, render_order, ListFilter, PagedResult, QueryOptions};
use super::{run_on, ChildRepository, ParentRepository, RepoError, RepoResult};
use crate::context::Context;
use crate::db::ConnectionPool;
use crate::model::child::Child;
use crate::model::parent::Parent;
use crate::model::{now_ms, EntityId, EntityKind};
use crate::tx::{DocumentClient, DocumentSession};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;

const PARENTS: &str = "collection_parents";
const CHILDREN: &str = "collection_children";

fn path(name: &str) -> String {
    if name == "id" {
        return name.to_string();
    }
    format!("json_extract(body, '$.{name}')")
}

/// Shared document plumbing for one collection.
#[derive(Clone)]
struct Collection {
    pool: ConnectionPool,
    name: &'static str,
    kind: EntityKind,
}

impl Collection {
    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> RepoResult<T>) -> RepoResult<T> {
        run_on::<DocumentSession, T>(&self.pool, ctx, f)
    }

    fn insert<D: Serialize>(&self, ctx: &Context, id: EntityId, doc: &D) -> RepoResult<()> {
        let body = serde_json::to_string(doc)?;
        let sql = format!("INSERT INTO {} (id, body) VALUES (?1, ?2);", self.name);
        self.run(ctx, |conn| {
            conn.execute(&sql, params![id.to_string(), body])?;
            Ok(())
        })
    }

    fn find<D: DeserializeOwned>(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<D>> {
        let sql = format!(
            "SELECT body FROM {}
             WHERE id = ?1
               AND (?2 = 1 OR {} IS NULL);",
            self.name,
            path("deleted_at")
        );
        self.run(ctx, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![id.to_string(), i64::from(include_deleted)])?;
            match rows.next()? {
                Some(row) => {
                    let body: String = row.get(0)?;
                    Ok(Some(self.decode(&body)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Replaces a live document; zero matches is `NotFound`.
    fn replace<D: Serialize>(&self, ctx: &Context, id: EntityId, doc: &D) -> RepoResult<()> {
        let body = serde_json::to_string(doc)?;
        let sql = format!(
            "UPDATE {} SET body = ?2 WHERE id = ?1 AND {} IS NULL;",
            self.name,
            path("deleted_at")
        );
        let changed = self.run(ctx, |conn| {
            Ok(conn.execute(&sql, params![id.to_string(), body])?)
        })?;
        if changed == 0 {
            return Err(RepoError::not_found(self.kind, id));
        }
        Ok(())
    }

    /// Patches the deletion stamp on every live document matching
    /// `field = value`; returns the number of documents patched.
    fn stamp_deleted(
        &self,
        ctx: &Context,
        field: &str,
        value: String,
        deleted_at: i64,
    ) -> RepoResult<u64> {
        let sql = format!(
            "UPDATE {}
             SET body = json_set(body, '$.deleted_at', ?2, '$.updated_at', ?2)
             WHERE {} = ?1
               AND {} IS NULL;",
            self.name,
            path(field),
            path("deleted_at")
        );
        self.run(ctx, |conn| {
            Ok(conn.execute(&sql, params![value, deleted_at])? as u64)
        })
    }

    fn list<D>(&self, ctx: &Context, options: &QueryOptions) -> RepoResult<(Vec<D>, PagedResult)>
    where
        D: DeserializeOwned + Send,
    {
        fetch_page(
            ctx,
            options.pagination,
            |ctx| {
                let filter = render_filter(&options.filter, self.kind, path);
                let sql = format!(
                    "SELECT body FROM {} WHERE {} {} LIMIT ? OFFSET ?;",
                    self.name,
                    filter.clause,
                    render_order(options.sort, self.kind, path)
                );
                let mut binds = filter.binds;
                binds.push(Value::Integer(options.pagination.limit()));
                binds.push(Value::Integer(options.pagination.offset()));
                self.query(ctx, &sql, binds)
            },
            |ctx| self.count(ctx, &options.filter),
        )
    }

    fn query<D: DeserializeOwned>(
        &self,
        ctx: &Context,
        sql: &str,
        binds: Vec<Value>,
    ) -> RepoResult<Vec<D>> {
        self.run(ctx, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params_from_iter(binds))?;
            let mut docs = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                docs.push(self.decode(&body)?);
            }
            Ok(docs)
        })
    }

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64> {
        let filter = render_filter(filter, self.kind, path);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {};", self.name, filter.clause);
        self.run(ctx, |conn| {
            Ok(conn.query_row(&sql, params_from_iter(filter.binds), |row| row.get(0))?)
        })
    }

    fn decode<D: DeserializeOwned>(&self, body: &str) -> RepoResult<D> {
        serde_json::from_str(body)
            .map_err(|err| RepoError::InvalidData(format!("invalid document in {}: {err}", self.name)))
    }
}

/// Parent repository over the `parents` collection.
#[derive(Clone)]
pub struct DocParentRepository {
    parents: Collection,
}

impl DocParentRepository {
    pub fn new(client: &DocumentClient) -> Self {
        Self {
            parents: Collection {
                pool: client.pool().clone(),
                name: PARENTS,
                kind: EntityKind::Parent,
            },
        }
    }
}

impl ParentRepository for DocParentRepository {
    fn create(&self, ctx: &Context, parent: &Parent) -> RepoResult<()> {
        parent.validate()?;
        self.parents.insert(ctx, parent.id, parent)
    }

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Parent>> {
        self.parents.find(ctx, id, include_deleted)
    }

    fn update(&self, ctx: &Context, parent: &mut Parent) -> RepoResult<()> {
        parent.validate()?;
        let mut next = parent.clone();
        next.updated_at = now_ms();
        self.parents.replace(ctx, next.id, &next)?;
        parent.updated_at = next.updated_at;
        Ok(())
    }

    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()> {
        match self
            .parents
            .stamp_deleted(ctx, "id", id.to_string(), deleted_at)?
        {
            0 => Err(RepoError::not_found(EntityKind::Parent, id)),
            _ => Ok(()),
        }
    }

    fn list(
        &self,
        ctx: &Context,
        options: &QueryOptions,
    ) -> RepoResult<(Vec<Parent>, PagedResult)> {
        self.parents.list(ctx, options)
    }

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64> {
        self.parents.count(ctx, filter)
    }
}

/// Child repository over the `children` collection.
#[derive(Clone)]
pub struct DocChildRepository {
    children: Collection,
}

impl DocChildRepository {
    pub fn new(client: &DocumentClient) -> Self {
        Self {
            children: Collection {
                pool: client.pool().clone(),
                name: CHILDREN,
                kind: EntityKind::Child,
            },
        }
    }
}

impl ChildRepository for DocChildRepository {
    fn create(&self, ctx: &Context, child: &Child) -> RepoResult<()> {
        child.validate()?;
        let body = serde_json::to_string(child)?;
        let check_sql = format!(
            "SELECT EXISTS(
                SELECT 1 FROM {PARENTS}
                WHERE id = ?1
                  AND {} IS NULL
            );",
            path("deleted_at")
        );
        let insert_sql = format!("INSERT INTO {CHILDREN} (id, body) VALUES (?1, ?2);");

        // Parent check and insert share one connection so a bound session
        // is only locked once.
        self.children.run(ctx, |conn| {
            let parent_active: i64 =
                conn.query_row(&check_sql, [child.parent_id.to_string()], |row| row.get(0))?;
            if parent_active == 0 {
                return Err(RepoError::not_found(EntityKind::Parent, child.parent_id));
            }
            conn.execute(&insert_sql, params![child.id.to_string(), body])?;
            Ok(())
        })
    }

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Child>> {
        self.children.find(ctx, id, include_deleted)
    }

    fn update(&self, ctx: &Context, child: &mut Child) -> RepoResult<()> {
        child.validate()?;
        let mut next = child.clone();
        next.updated_at = now_ms();
        self.children.replace(ctx, next.id, &next)?;
        child.updated_at = next.updated_at;
        Ok(())
    }

    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()> {
        match self
            .children
            .stamp_deleted(ctx, "id", id.to_string(), deleted_at)?
        {
            0 => Err(RepoError::not_found(EntityKind::Child, id)),
            _ => Ok(()),
        }
    }

    fn mark_deleted_by_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        deleted_at: i64,
    ) -> RepoResult<u64> {
        self.children
            .stamp_deleted(ctx, "parent_id", parent_id.to_string(), deleted_at)
    }

    fn list_by_parent(&self, ctx: &Context, parent_id: EntityId) -> RepoResult<Vec<Child>> {
        let sql = format!(
            "SELECT body FROM {CHILDREN}
             WHERE {} = ?
               AND {} IS NULL
             ORDER BY {} ASC, id ASC;",
            path("parent_id"),
            path("deleted_at"),
            path("created_at")
        );
        self.children
            .query(ctx, &sql, vec![Value::Text(parent_id.to_string())])
    }

    fn list(&self, ctx: &Context, options: &QueryOptions) -> RepoResult<(Vec<Child>, PagedResult)> {
        self.children.list(ctx, options)
    }

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64> {
        self.children.count(ctx, filter)
    }
}
