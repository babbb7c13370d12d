//! List query options and their SQL rendering.
//!
//! # Responsibility
//! - Model caller-supplied filter, pagination and sort options.
//! - Render them into one WHERE clause and one ORDER BY clause shared by
//!   both backends (only the field expression differs).
//!
//! # Invariants
//! - The non-deleted filter is always part of the rendered clause.
//! - Substring filters escape `%`, `_` and `\` before building LIKE patterns.
//! - Ordering is deterministic: the sort key, then `id ASC`.

use crate::model::{today, EntityId, EntityKind};
use chrono::{Months, NaiveDate};
use rusqlite::types::Value;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Caller-supplied filter criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Case-insensitive substring of the first name.
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Parents only; ignored for children.
    pub email: Option<String>,
    /// Inclusive lower age bound in whole years.
    pub min_age: Option<u32>,
    /// Inclusive upper age bound in whole years.
    pub max_age: Option<u32>,
    /// Children only; ignored for parents.
    pub parent_id: Option<EntityId>,
}

impl ListFilter {
    pub fn first_name(value: impl Into<String>) -> Self {
        Self {
            first_name: Some(value.into()),
            ..Self::default()
        }
    }
}

/// 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    /// Page 0 becomes 1; size 0 becomes the default; size is capped.
    pub fn normalized(self) -> Self {
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        };
        Self {
            page: self.page.max(1),
            page_size,
        }
    }

    pub fn offset(self) -> i64 {
        let normalized = self.normalized();
        i64::from(normalized.page - 1) * i64::from(normalized.page_size)
    }

    pub fn limit(self) -> i64 {
        i64::from(self.normalized().page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    FirstName,
    LastName,
    Email,
    BirthDate,
}

impl SortField {
    /// Accepts snake_case and camelCase field names.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "created_at" | "createdAt" => Some(Self::CreatedAt),
            "updated_at" | "updatedAt" => Some(Self::UpdatedAt),
            "first_name" | "firstName" => Some(Self::FirstName),
            "last_name" | "lastName" => Some(Self::LastName),
            "email" => Some(Self::Email),
            "birth_date" | "birthDate" => Some(Self::BirthDate),
            _ => None,
        }
    }

    pub fn field_name(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Email => "email",
            Self::BirthDate => "birth_date",
        }
    }

    /// Whether records of `kind` carry this field.
    pub fn applies_to(self, kind: EntityKind) -> bool {
        !(self == Self::Email && kind == EntityKind::Child)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Desc,
        }
    }
}

/// Everything a `list` call needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub filter: ListFilter,
    pub pagination: Pagination,
    pub sort: Sort,
}

impl QueryOptions {
    pub fn with_filter(filter: ListFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Page metadata returned next to the fetched records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedResult {
    pub total_count: i64,
    pub page: u32,
    pub page_size: u32,
    pub has_next: bool,
}

impl PagedResult {
    pub fn new(pagination: Pagination, returned: usize, total_count: i64) -> Self {
        let normalized = pagination.normalized();
        let seen = pagination.offset() + returned as i64;
        Self {
            total_count,
            page: normalized.page,
            page_size: normalized.page_size,
            has_next: seen < total_count,
        }
    }
}

/// Rendered WHERE clause plus positional bind values.
#[derive(Debug, Clone)]
pub(crate) struct SqlFilter {
    pub clause: String,
    pub binds: Vec<Value>,
}

/// Renders `filter` for `kind`; `field` maps a logical field name to the
/// backend's SQL expression.
pub(crate) fn render_filter(
    filter: &ListFilter,
    kind: EntityKind,
    field: impl Fn(&str) -> String,
) -> SqlFilter {
    let mut clause = format!("{} IS NULL", field("deleted_at"));
    let mut binds = Vec::new();

    let substrings = [
        ("first_name", filter.first_name.as_deref()),
        ("last_name", filter.last_name.as_deref()),
        (
            "email",
            match kind {
                EntityKind::Parent => filter.email.as_deref(),
                EntityKind::Child => None,
            },
        ),
    ];
    for (name, value) in substrings {
        if let Some(value) = value.filter(|value| !value.is_empty()) {
            clause.push_str(&format!(" AND {} LIKE ? ESCAPE '\\'", field(name)));
            binds.push(Value::Text(like_pattern(value)));
        }
    }

    match birth_date_bounds(filter.min_age, filter.max_age, today()) {
        Some((born_on_or_before, born_after)) => {
            if let Some(date) = born_on_or_before {
                clause.push_str(&format!(" AND {} <= ?", field("birth_date")));
                binds.push(Value::Text(date.to_string()));
            }
            if let Some(date) = born_after {
                clause.push_str(&format!(" AND {} > ?", field("birth_date")));
                binds.push(Value::Text(date.to_string()));
            }
        }
        None => clause.push_str(" AND 1 = 0"),
    }

    if kind == EntityKind::Child {
        if let Some(parent_id) = filter.parent_id {
            clause.push_str(&format!(" AND {} = ?", field("parent_id")));
            binds.push(Value::Text(parent_id.to_string()));
        }
    }

    SqlFilter { clause, binds }
}

/// Renders the ORDER BY clause for `kind`.
///
/// A sort field the entity does not store falls back to `created_at`,
/// keeping the requested direction.
pub(crate) fn render_order(
    sort: Sort,
    kind: EntityKind,
    field: impl Fn(&str) -> String,
) -> String {
    let direction = match sort.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    let sort_field = if sort.field.applies_to(kind) {
        sort.field
    } else {
        SortField::CreatedAt
    };
    format!(
        "ORDER BY {} {direction}, id ASC",
        field(sort_field.field_name())
    )
}

/// Converts age bounds into birth date bounds relative to `today`.
///
/// Returns `(born_on_or_before, born_after)`, or `None` when no
/// representable birth date satisfies `min_age`.
pub(crate) fn birth_date_bounds(
    min_age: Option<u32>,
    max_age: Option<u32>,
    today: NaiveDate,
) -> Option<(Option<NaiveDate>, Option<NaiveDate>)> {
    let years_ago = |years: u32| today.checked_sub_months(Months::new(years.saturating_mul(12)));
    let upper = match min_age {
        Some(age) => Some(years_ago(age)?),
        None => None,
    };
    // Past the calendar range everyone is younger than `max_age`.
    let lower = max_age.and_then(|age| years_ago(age.saturating_add(1)));
    Some((upper, lower))
}

fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
