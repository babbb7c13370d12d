//! Relational repositories over normalized `parents` / `children` tables.
//!
//! # Responsibility
//! - Map Parent/Child records to rows and back.
//! - Keep SQL details inside the repository boundary.
//!
//! # Invariants
//! - Write paths call `validate()` before SQL mutations.
//! - Read paths reject invalid persisted state instead of masking it.
//! - The embedded projection is stored as a JSON array column.

use super::page::fetch_page;
use super::query::{render_filter, render_order, ListFilter, PagedResult, QueryOptions};
use super::{run_on, ChildRepository, ParentRepository, RepoError, RepoResult};
use crate::context::Context;
use crate::db::ConnectionPool;
use crate::model::child::Child;
use crate::model::parent::Parent;
use crate::model::{now_ms, EntityId, EntityKind};
use crate::tx::SqlTransaction;
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

const PARENT_SELECT_SQL: &str = "SELECT
    id,
    first_name,
    last_name,
    email,
    birth_date,
    embedded_children,
    created_at,
    updated_at,
    deleted_at
FROM parents";

const CHILD_SELECT_SQL: &str = "SELECT
    id,
    parent_id,
    first_name,
    last_name,
    birth_date,
    created_at,
    updated_at,
    deleted_at
FROM children";

fn column(name: &str) -> String {
    name.to_string()
}

/// SQL-backed parent repository.
#[derive(Clone)]
pub struct SqlParentRepository {
    pool: ConnectionPool,
}

impl SqlParentRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> RepoResult<T>) -> RepoResult<T> {
        run_on::<SqlTransaction, T>(&self.pool, ctx, f)
    }
}

impl ParentRepository for SqlParentRepository {
    fn create(&self, ctx: &Context, parent: &Parent) -> RepoResult<()> {
        parent.validate()?;
        let embedded = serde_json::to_string(&parent.embedded_children)?;

        self.run(ctx, |conn| {
            conn.execute(
                "INSERT INTO parents (
                    id,
                    first_name,
                    last_name,
                    email,
                    birth_date,
                    embedded_children,
                    created_at,
                    updated_at,
                    deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
                params![
                    parent.id.to_string(),
                    parent.first_name.as_str(),
                    parent.last_name.as_str(),
                    parent.email.as_str(),
                    parent.birth_date.to_string(),
                    embedded,
                    parent.created_at,
                    parent.updated_at,
                    parent.deleted_at,
                ],
            )?;
            Ok(())
        })
    }

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Parent>> {
        self.run(ctx, |conn| {
            let mut stmt = conn.prepare(&format!(
                "{PARENT_SELECT_SQL}
                 WHERE id = ?1
                   AND (?2 = 1 OR deleted_at IS NULL);"
            ))?;
            let mut rows = stmt.query(params![id.to_string(), i64::from(include_deleted)])?;
            match rows.next()? {
                Some(row) => Ok(Some(parse_parent_row(row)?)),
                None => Ok(None),
            }
        })
    }

    fn update(&self, ctx: &Context, parent: &mut Parent) -> RepoResult<()> {
        parent.validate()?;
        let embedded = serde_json::to_string(&parent.embedded_children)?;
        let updated_at = now_ms();

        let changed = self.run(ctx, |conn| {
            Ok(conn.execute(
                "UPDATE parents
                 SET
                    first_name = ?2,
                    last_name = ?3,
                    email = ?4,
                    birth_date = ?5,
                    embedded_children = ?6,
                    updated_at = ?7
                 WHERE id = ?1
                   AND deleted_at IS NULL;",
                params![
                    parent.id.to_string(),
                    parent.first_name.as_str(),
                    parent.last_name.as_str(),
                    parent.email.as_str(),
                    parent.birth_date.to_string(),
                    embedded,
                    updated_at,
                ],
            )?)
        })?;

        if changed == 0 {
            return Err(RepoError::not_found(EntityKind::Parent, parent.id));
        }
        parent.updated_at = updated_at;
        Ok(())
    }

    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()> {
        let changed = self.run(ctx, |conn| {
            Ok(conn.execute(
                "UPDATE parents
                 SET deleted_at = ?2,
                     updated_at = ?2
                 WHERE id = ?1
                   AND deleted_at IS NULL;",
                params![id.to_string(), deleted_at],
            )?)
        })?;

        if changed == 0 {
            return Err(RepoError::not_found(EntityKind::Parent, id));
        }
        Ok(())
    }

    fn list(
        &self,
        ctx: &Context,
        options: &QueryOptions,
    ) -> RepoResult<(Vec<Parent>, PagedResult)> {
        fetch_page(
            ctx,
            options.pagination,
            |ctx| {
                let filter = render_filter(&options.filter, EntityKind::Parent, column);
                let sql = format!(
                    "{PARENT_SELECT_SQL} WHERE {} {} LIMIT ? OFFSET ?;",
                    filter.clause,
                    render_order(options.sort, EntityKind::Parent, column)
                );
                let mut binds = filter.binds;
                binds.push(Value::Integer(options.pagination.limit()));
                binds.push(Value::Integer(options.pagination.offset()));
                self.run(ctx, |conn| query_rows(conn, &sql, binds, parse_parent_row))
            },
            |ctx| self.count(ctx, &options.filter),
        )
    }

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64> {
        let filter = render_filter(filter, EntityKind::Parent, column);
        let sql = format!("SELECT COUNT(*) FROM parents WHERE {};", filter.clause);
        self.run(ctx, |conn| {
            Ok(conn.query_row(&sql, params_from_iter(filter.binds), |row| row.get(0))?)
        })
    }
}

/// SQL-backed child repository.
#[derive(Clone)]
pub struct SqlChildRepository {
    pool: ConnectionPool,
}

impl SqlChildRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> RepoResult<T>) -> RepoResult<T> {
        run_on::<SqlTransaction, T>(&self.pool, ctx, f)
    }
}

impl ChildRepository for SqlChildRepository {
    fn create(&self, ctx: &Context, child: &Child) -> RepoResult<()> {
        child.validate()?;

        self.run(ctx, |conn| {
            let parent_active: i64 = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1
                    FROM parents
                    WHERE id = ?1
                      AND deleted_at IS NULL
                );",
                [child.parent_id.to_string()],
                |row| row.get(0),
            )?;
            if parent_active == 0 {
                return Err(RepoError::not_found(EntityKind::Parent, child.parent_id));
            }

            conn.execute(
                "INSERT INTO children (
                    id,
                    parent_id,
                    first_name,
                    last_name,
                    birth_date,
                    created_at,
                    updated_at,
                    deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    child.id.to_string(),
                    child.parent_id.to_string(),
                    child.first_name.as_str(),
                    child.last_name.as_str(),
                    child.birth_date.to_string(),
                    child.created_at,
                    child.updated_at,
                    child.deleted_at,
                ],
            )?;
            Ok(())
        })
    }

    fn find_by_id(
        &self,
        ctx: &Context,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<Child>> {
        self.run(ctx, |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "{CHILD_SELECT_SQL}
                         WHERE id = ?1
                           AND (?2 = 1 OR deleted_at IS NULL);"
                    ),
                    params![id.to_string(), i64::from(include_deleted)],
                    |row| Ok(parse_child_row(row)),
                )
                .optional()?;
            row.transpose()
        })
    }

    fn update(&self, ctx: &Context, child: &mut Child) -> RepoResult<()> {
        child.validate()?;
        let updated_at = now_ms();

        let changed = self.run(ctx, |conn| {
            Ok(conn.execute(
                "UPDATE children
                 SET
                    parent_id = ?2,
                    first_name = ?3,
                    last_name = ?4,
                    birth_date = ?5,
                    updated_at = ?6
                 WHERE id = ?1
                   AND deleted_at IS NULL;",
                params![
                    child.id.to_string(),
                    child.parent_id.to_string(),
                    child.first_name.as_str(),
                    child.last_name.as_str(),
                    child.birth_date.to_string(),
                    updated_at,
                ],
            )?)
        })?;

        if changed == 0 {
            return Err(RepoError::not_found(EntityKind::Child, child.id));
        }
        child.updated_at = updated_at;
        Ok(())
    }

    fn mark_deleted(&self, ctx: &Context, id: EntityId, deleted_at: i64) -> RepoResult<()> {
        let changed = self.run(ctx, |conn| {
            Ok(conn.execute(
                "UPDATE children
                 SET deleted_at = ?2,
                     updated_at = ?2
                 WHERE id = ?1
                   AND deleted_at IS NULL;",
                params![id.to_string(), deleted_at],
            )?)
        })?;

        if changed == 0 {
            return Err(RepoError::not_found(EntityKind::Child, id));
        }
        Ok(())
    }

    fn mark_deleted_by_parent(
        &self,
        ctx: &Context,
        parent_id: EntityId,
        deleted_at: i64,
    ) -> RepoResult<u64> {
        self.run(ctx, |conn| {
            let changed = conn.execute(
                "UPDATE children
                 SET deleted_at = ?2,
                     updated_at = ?2
                 WHERE parent_id = ?1
                   AND deleted_at IS NULL;",
                params![parent_id.to_string(), deleted_at],
            )?;
            Ok(changed as u64)
        })
    }

    fn list_by_parent(&self, ctx: &Context, parent_id: EntityId) -> RepoResult<Vec<Child>> {
        let sql = format!(
            "{CHILD_SELECT_SQL}
             WHERE parent_id = ?
               AND deleted_at IS NULL
             ORDER BY created_at ASC, id ASC;"
        );
        self.run(ctx, |conn| {
            query_rows(
                conn,
                &sql,
                vec![Value::Text(parent_id.to_string())],
                parse_child_row,
            )
        })
    }

    fn list(&self, ctx: &Context, options: &QueryOptions) -> RepoResult<(Vec<Child>, PagedResult)> {
        fetch_page(
            ctx,
            options.pagination,
            |ctx| {
                let filter = render_filter(&options.filter, EntityKind::Child, column);
                let sql = format!(
                    "{CHILD_SELECT_SQL} WHERE {} {} LIMIT ? OFFSET ?;",
                    filter.clause,
                    render_order(options.sort, EntityKind::Child, column)
                );
                let mut binds = filter.binds;
                binds.push(Value::Integer(options.pagination.limit()));
                binds.push(Value::Integer(options.pagination.offset()));
                self.run(ctx, |conn| query_rows(conn, &sql, binds, parse_child_row))
            },
            |ctx| self.count(ctx, &options.filter),
        )
    }

    fn count(&self, ctx: &Context, filter: &ListFilter) -> RepoResult<i64> {
        let filter = render_filter(filter, EntityKind::Child, column);
        let sql = format!("SELECT COUNT(*) FROM children WHERE {};", filter.clause);
        self.run(ctx, |conn| {
            Ok(conn.query_row(&sql, params_from_iter(filter.binds), |row| row.get(0))?)
        })
    }
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    binds: Vec<Value>,
    parse: fn(&Row<'_>) -> RepoResult<T>,
) -> RepoResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(binds))?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse(row)?);
    }
    Ok(items)
}

fn parse_parent_row(row: &Row<'_>) -> RepoResult<Parent> {
    let embedded_text: String = row.get("embedded_children")?;
    let embedded_children: Vec<Child> = serde_json::from_str(&embedded_text).map_err(|err| {
        RepoError::InvalidData(format!(
            "invalid embedded_children value in parents.embedded_children: {err}"
        ))
    })?;

    Ok(Parent {
        id: parse_uuid(row, "id", "parents")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        email: row.get("email")?,
        birth_date: parse_date(row, "parents")?,
        embedded_children,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

fn parse_child_row(row: &Row<'_>) -> RepoResult<Child> {
    Ok(Child {
        id: parse_uuid(row, "id", "children")?,
        parent_id: parse_uuid(row, "parent_id", "children")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        birth_date: parse_date(row, "children")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

fn parse_uuid(row: &Row<'_>, column: &str, table: &str) -> RepoResult<Uuid> {
    let text: String = row.get(column)?;
    Uuid::parse_str(&text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid value `{text}` in {table}.{column}"))
    })
}

fn parse_date(row: &Row<'_>, table: &str) -> RepoResult<NaiveDate> {
    let text: String = row.get("birth_date")?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|_| {
        RepoError::InvalidData(format!("invalid date value `{text}` in {table}.birth_date"))
    })
}
