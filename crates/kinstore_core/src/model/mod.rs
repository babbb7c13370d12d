//! Domain model module.
//!
//! # Responsibility
//! - Define the Parent aggregate and standalone Child records.
//! - Provide validation shared by both record types.
//!
//! # Invariants
//! - Validation runs before any storage call.
//! - Timestamps are Unix epoch milliseconds.

pub mod child;
pub mod parent;

use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier shared by parents and children.
pub type EntityId = Uuid;

const MAX_NAME_CHARS: usize = 100;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid email regex")
});

/// Record type tag used in errors and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Parent,
    Child,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied data rejected before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name field is blank after trim.
    BlankField(&'static str),
    /// Name field is longer than the accepted maximum.
    FieldTooLong {
        field: &'static str,
        max_chars: usize,
    },
    /// Email does not look like `local@domain.tld`.
    InvalidEmail(String),
    /// Birth date lies after today (UTC).
    BirthDateInFuture(NaiveDate),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField(field) => write!(f, "{field} must not be blank"),
            Self::FieldTooLong { field, max_chars } => {
                write!(f, "{field} must be at most {max_chars} characters")
            }
            Self::InvalidEmail(value) => write!(f, "invalid email address `{value}`"),
            Self::BirthDateInFuture(date) => write!(f, "birth date {date} is in the future"),
        }
    }
}

impl Error for ValidationError {}

/// Current time as Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Today's date in UTC, used for birth date and age checks.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(crate) fn validate_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::BlankField(field));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::FieldTooLong {
            field,
            max_chars: MAX_NAME_CHARS,
        });
    }
    Ok(())
}

pub(crate) fn validate_email(value: &str) -> Result<(), ValidationError> {
    if EMAIL_RE.is_match(value.trim()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmail(value.to_string()))
    }
}

pub(crate) fn validate_birth_date(date: NaiveDate) -> Result<(), ValidationError> {
    if date > today() {
        return Err(ValidationError::BirthDateInFuture(date));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_email, validate_name, ValidationError};

    #[test]
    fn email_pattern_accepts_common_addresses() {
        assert!(validate_email("john.doe@example.com").is_ok());
        assert!(validate_email("a+tag@sub.example.org").is_ok());
    }

    #[test]
    fn email_pattern_rejects_missing_domain() {
        assert_eq!(
            validate_email("john.doe@"),
            Err(ValidationError::InvalidEmail("john.doe@".to_string()))
        );
        assert!(validate_email("no-at-sign.example.com").is_err());
    }

    #[test]
    fn name_must_not_be_blank_or_too_long() {
        assert_eq!(
            validate_name("first_name", "   "),
            Err(ValidationError::BlankField("first_name"))
        );
        let long = "x".repeat(101);
        assert!(matches!(
            validate_name("last_name", &long),
            Err(ValidationError::FieldTooLong { field: "last_name", .. })
        ));
    }
}
