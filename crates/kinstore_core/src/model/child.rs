//! Child record model.
//!
//! # Invariants
//! - `parent_id` names exactly one Parent.
//! - `deleted_at` is set at most once and never cleared.

use super::{now_ms, validate_birth_date, validate_name, EntityId, ValidationError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standalone child record; the authoritative source for child existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: EntityId,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub parent_id: EntityId,
    /// Epoch ms.
    pub created_at: i64,
    /// Epoch ms, refreshed on every mutation.
    pub updated_at: i64,
    /// Soft delete tombstone (epoch ms).
    pub deleted_at: Option<i64>,
}

/// Caller input for creating a child under a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChild {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
}

impl Child {
    /// Creates a new child with a generated id under `parent_id`.
    pub fn new(
        parent_id: EntityId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        birth_date: NaiveDate,
    ) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            birth_date,
            parent_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn from_input(parent_id: EntityId, input: NewChild) -> Self {
        Self::new(parent_id, input.first_name, input.last_name, input.birth_date)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("first_name", &self.first_name)?;
        validate_name("last_name", &self.last_name)?;
        validate_birth_date(self.birth_date)
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::Child;
    use crate::model::ValidationError;
    use chrono::NaiveDate;
    use uuid::Uuid;

    #[test]
    fn new_child_is_active_with_matching_timestamps() {
        let date = NaiveDate::from_ymd_opt(2015, 6, 1).unwrap();
        let child = Child::new(Uuid::new_v4(), "Jane", "Doe", date);
        assert!(child.is_active());
        assert_eq!(child.created_at, child.updated_at);
        assert!(child.validate().is_ok());
    }

    #[test]
    fn future_birth_date_is_rejected() {
        let date = NaiveDate::from_ymd_opt(2999, 1, 1).unwrap();
        let child = Child::new(Uuid::new_v4(), "Jane", "Doe", date);
        assert_eq!(
            child.validate(),
            Err(ValidationError::BirthDateInFuture(date))
        );
    }
}
