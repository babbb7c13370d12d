//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into transactional use cases.
//! - Keep callers decoupled from backend and transaction details.

pub mod family_service;

pub use family_service::{FamilyService, ServiceError, ServiceResult};
