//! Read-only, parameterized SQL execution against per-tenant Postgres
//! databases.
//!
//! A request flows through the guard, the binder (for templates), the guard
//! again, and then the executor, which borrows a session from the target's
//! pool, applies a server-side statement timeout, optionally counts and pages
//! the result, and normalizes rows into JSON values.

mod binder;
mod catalog;
mod config;
mod engine;
mod error;
mod executor;
mod guard;
mod lexer;
mod normalize;
mod paginate;
mod request;

pub use binder::{BoundStatement, Params, bind};
pub use catalog::SemanticType;
pub use config::{
    ConfigError, DEFAULT_LOG_SQL_CHARS, DEFAULT_MAX_ROWS, DEFAULT_TIMEOUT_MS, EngineConfig,
    EnvironmentSettings, MAX_PAGE_SIZE, QueryLimits,
};
pub use engine::Engine;
pub use error::QueryError;
pub use executor::{ExecutionPlan, Page, QueryExecutor};
pub use guard::{GuardError, ValidatedSql, ValidatedTemplate, assert_safe_select, assert_safe_template};
pub use lexer::LexError;
pub use normalize::{TimeRendering, normalize, normalize_cell};
pub use request::{ColumnDescriptor, PageInfo, PageRequest, QueryRequest, QueryResult, SqlSource};

pub use lumen_db::{PoolSettings, ProbeReport, TargetDescriptor};
