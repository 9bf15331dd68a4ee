//! Error types for target resolution, connection setup and statement failures.

use std::io;

use thiserror::Error;

use crate::target::TargetDescriptor;

/// A tenant connection URL could not be turned into a [`TargetDescriptor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("connection URL is not valid: {0}")]
    InvalidUrl(String),
    #[error("unsupported connection scheme `{0}`, expected postgres:// or postgresql://")]
    UnsupportedScheme(String),
    #[error("connection URL has no host")]
    MissingHost,
    #[error("connection URL has no database name")]
    MissingDatabase,
    #[error("connection URL has no user")]
    MissingUser,
    #[error("unsupported sslmode `{0}`")]
    InvalidSslMode(String),
}

/// A connection to a target could not be established or handed out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("cannot connect to {host}:{port}: connection refused")]
    Refused { host: String, port: u16 },
    #[error("cannot connect to {host}:{port}: connection timed out")]
    Timeout { host: String, port: u16 },
    #[error("cannot connect to {host}:{port}: {detail}")]
    Unreachable {
        host: String,
        port: u16,
        detail: String,
    },
    #[error("authentication failed for user `{user}`")]
    AuthenticationFailed { user: String },
    #[error("database `{database}` does not exist")]
    DatabaseNotFound { database: String },
    #[error("{host}:{port} is not accepting more connections")]
    TooManyConnections { host: String, port: u16 },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("timed out waiting for a free connection to {key}")]
    PoolExhausted { key: String },
    #[error("connection pool for {key} is closed")]
    PoolClosed { key: String },
    #[error("connection failed: {message}")]
    Other {
        code: Option<String>,
        message: String,
    },
}

impl ConnectError {
    /// SQLSTATE of the server response that caused the failure, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::AuthenticationFailed { .. } => Some("28000"),
            Self::DatabaseNotFound { .. } => Some("3D000"),
            Self::TooManyConnections { .. } => Some("53300"),
            Self::Other { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn from_sqlstate(code: &str, message: &str, target: &TargetDescriptor) -> Self {
        match code {
            "3D000" => Self::DatabaseNotFound {
                database: target.database.clone(),
            },
            "53300" => Self::TooManyConnections {
                host: target.hostname.clone(),
                port: target.port,
            },
            _ if code.starts_with("28") => Self::AuthenticationFailed {
                user: target.user.clone(),
            },
            _ => Self::Other {
                code: Some(code.to_string()),
                message: message.to_string(),
            },
        }
    }

    pub(crate) fn from_io(kind: io::ErrorKind, detail: String, target: &TargetDescriptor) -> Self {
        let host = target.hostname.clone();
        let port = target.port;
        match kind {
            io::ErrorKind::ConnectionRefused => Self::Refused { host, port },
            io::ErrorKind::TimedOut => Self::Timeout { host, port },
            _ => Self::Unreachable { host, port, detail },
        }
    }
}

/// Coarse category of a statement failure, derived from its SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorClass {
    /// The server rejected or failed the statement.
    Statement,
    /// `statement_timeout` fired.
    Timeout,
    /// The session went away underneath the statement.
    Connection,
    Authentication,
}

impl DriverErrorClass {
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "57014" => Self::Timeout,
            "57P01" | "57P02" | "57P03" => Self::Connection,
            _ if code.starts_with("08") => Self::Connection,
            _ if code.starts_with("28") => Self::Authentication,
            _ => Self::Statement,
        }
    }
}

/// A statement failed after a connection was obtained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub class: DriverErrorClass,
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    /// 1-based character offset into the statement text.
    pub position: Option<u32>,
}

impl DriverError {
    pub fn new(class: DriverErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            code: None,
            message: message.into(),
            detail: None,
            position: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetDescriptor {
        TargetDescriptor {
            user: "report".to_string(),
            password: "secret".to_string(),
            database: "sales".to_string(),
            hostname: "db.internal".to_string(),
            port: 5433,
            use_tls: false,
        }
    }

    #[test]
    fn sqlstate_maps_to_connect_causes() {
        let target = target();
        assert_eq!(
            ConnectError::from_sqlstate("28P01", "password authentication failed", &target),
            ConnectError::AuthenticationFailed {
                user: "report".to_string()
            }
        );
        assert_eq!(
            ConnectError::from_sqlstate("3D000", "database \"sales\" does not exist", &target),
            ConnectError::DatabaseNotFound {
                database: "sales".to_string()
            }
        );
        let other = ConnectError::from_sqlstate("XX000", "internal error", &target);
        assert_eq!(other.sqlstate(), Some("XX000"));
        assert_eq!(other.to_string(), "connection failed: internal error");
    }

    #[test]
    fn io_kinds_map_to_connect_causes() {
        let target = target();
        let refused = ConnectError::from_io(io::ErrorKind::ConnectionRefused, String::new(), &target);
        assert_eq!(refused.to_string(), "cannot connect to db.internal:5433: connection refused");
        let timeout = ConnectError::from_io(io::ErrorKind::TimedOut, String::new(), &target);
        assert!(matches!(timeout, ConnectError::Timeout { port: 5433, .. }));
        let dns = ConnectError::from_io(
            io::ErrorKind::Other,
            "failed to lookup address information".to_string(),
            &target,
        );
        assert!(dns.to_string().contains("failed to lookup address"));
    }

    #[test]
    fn statement_sqlstates_are_classified() {
        assert_eq!(DriverErrorClass::from_sqlstate("57014"), DriverErrorClass::Timeout);
        assert_eq!(DriverErrorClass::from_sqlstate("08006"), DriverErrorClass::Connection);
        assert_eq!(DriverErrorClass::from_sqlstate("57P01"), DriverErrorClass::Connection);
        assert_eq!(DriverErrorClass::from_sqlstate("28000"), DriverErrorClass::Authentication);
        assert_eq!(DriverErrorClass::from_sqlstate("42P01"), DriverErrorClass::Statement);
        assert_eq!(DriverErrorClass::from_sqlstate("42501"), DriverErrorClass::Statement);
    }
}
