//! Parent aggregate model.
//!
//! # Responsibility
//! - Hold parent identity and profile fields.
//! - Maintain the embedded children projection in memory.
//!
//! # Invariants
//! - `embedded_children` is a derived copy of the non-deleted Child records
//!   whose `parent_id` equals `id`; it is never the source of truth.
//! - Every projection change refreshes `updated_at`.

use super::child::Child;
use super::{
    now_ms, validate_birth_date, validate_email, validate_name, EntityId, ValidationError,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub id: EntityId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub birth_date: NaiveDate,
    /// Denormalized child snapshots.
    #[serde(default)]
    pub embedded_children: Vec<Child>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Caller input for creating a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewParent {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub birth_date: NaiveDate,
}

impl Parent {
    /// Creates a parent with a generated id and an empty projection.
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        birth_date: NaiveDate,
    ) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            birth_date,
            embedded_children: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn from_input(input: NewParent) -> Self {
        Self::new(
            input.first_name,
            input.last_name,
            input.email,
            input.birth_date,
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("first_name", &self.first_name)?;
        validate_name("last_name", &self.last_name)?;
        validate_email(&self.email)?;
        validate_birth_date(self.birth_date)
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn has_child(&self, child_id: EntityId) -> bool {
        self.embedded_children.iter().any(|child| child.id == child_id)
    }

    /// Appends a snapshot, or replaces the existing one with the same id.
    pub fn upsert_child(&mut self, child: Child) {
        match self
            .embedded_children
            .iter_mut()
            .find(|existing| existing.id == child.id)
        {
            Some(existing) => *existing = child,
            None => self.embedded_children.push(child),
        }
        self.updated_at = now_ms();
    }

    /// Removes the snapshot for `child_id`.
    ///
    /// Returns `false` (and leaves `updated_at` untouched) when absent.
    pub fn remove_child(&mut self, child_id: EntityId) -> bool {
        let before = self.embedded_children.len();
        self.embedded_children.retain(|child| child.id != child_id);
        if self.embedded_children.len() == before {
            return false;
        }
        self.updated_at = now_ms();
        true
    }

    pub fn embedded_child_ids(&self) -> Vec<EntityId> {
        self.embedded_children.iter().map(|child| child.id).collect()
    }
}
