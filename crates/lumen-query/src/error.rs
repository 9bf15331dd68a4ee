//! The five kinds of failure a query can end in.

use lumen_db::{ConnectError, DriverError, DriverErrorClass, TargetError};
use thiserror::Error;

use crate::guard::GuardError;

/// Everything [`crate::QueryExecutor::execute`] can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The statement or request was rejected before anything ran.
    #[error("invalid query: {reason}")]
    Validation { reason: String },
    /// No usable target database could be derived.
    #[error("invalid target database: {reason}")]
    Configuration { reason: String },
    #[error(transparent)]
    Connection(#[from] ConnectError),
    /// The server rejected or aborted the statement.
    #[error("{message}")]
    Execution {
        code: Option<String>,
        message: String,
        detail: Option<String>,
        /// 1-based character offset into the statement text.
        position: Option<u32>,
        timed_out: bool,
    },
    #[error("query returned {rows} rows, more than the limit of {max_rows}; paginate or add a smaller LIMIT")]
    LimitExceeded { rows: usize, max_rows: usize },
}

impl QueryError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Stable tag for logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Connection(_) => "connection",
            Self::Execution { .. } => "execution",
            Self::LimitExceeded { .. } => "limit_exceeded",
        }
    }

    /// HTTP status the calling layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Configuration { .. } => 400,
            Self::Connection(_) => 502,
            Self::Execution { timed_out: true, .. } => 504,
            Self::Execution { .. } => 422,
            Self::LimitExceeded { .. } => 413,
        }
    }

    /// SQLSTATE behind the failure, when the server supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection(err) => err.sqlstate(),
            Self::Execution { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn shift_position(self, by: usize) -> Self {
        match self {
            Self::Execution {
                code,
                message,
                detail,
                position,
                timed_out,
            } => Self::Execution {
                code,
                message,
                detail,
                position: position.map(|at| {
                    let by = u32::try_from(by).unwrap_or(u32::MAX);
                    if at > by { at - by } else { at }
                }),
                timed_out,
            },
            other => other,
        }
    }
}

impl From<GuardError> for QueryError {
    fn from(err: GuardError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<TargetError> for QueryError {
    fn from(err: TargetError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<DriverError> for QueryError {
    fn from(err: DriverError) -> Self {
        match err.class {
            DriverErrorClass::Connection | DriverErrorClass::Authentication => {
                Self::Connection(ConnectError::Other {
                    code: err.code,
                    message: err.message,
                })
            }
            class => Self::Execution {
                code: err.code,
                message: err.message,
                detail: err.detail,
                position: err.position,
                timed_out: class == DriverErrorClass::Timeout,
            },
        }
    }
}
