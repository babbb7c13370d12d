//! Core of kinstore: parent/child records over a document or a relational
//! backend, with a storage-agnostic transaction layer on top.

pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;
pub mod trace;
pub mod tx;

pub use config::{Backend, ConfigError, StoreConfig};
pub use context::{CancelToken, Context, ContextError};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::child::{Child, NewChild};
pub use model::parent::{NewParent, Parent};
pub use model::{EntityId, EntityKind, ValidationError};
pub use repo::{
    ChildRepository, ListFilter, PagedResult, Pagination, ParentRepository, QueryOptions,
    RepoError, RepoResult, Sort, SortDirection, SortField,
};
pub use service::{FamilyService, ServiceError, ServiceResult};
pub use store::{Store, StoreError};
pub use trace::{LogTracer, NoopTracer, Tracer};
pub use tx::{TransactionError, TransactionManager, TransactionManagerExt, TxOp, TxState};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
