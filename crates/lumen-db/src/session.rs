//! The seam between the pool registry and a concrete database driver.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnectError, DriverError};
use crate::rowset::RowSet;
use crate::target::TargetDescriptor;

/// An open connection to one target.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Sets the server-side statement timeout for the rest of the session.
    async fn set_statement_timeout(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Runs `sql`, binding `params` positionally to `$1..$n`.
    async fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<RowSet, DriverError>;

    /// True once the underlying connection can no longer be used.
    fn is_broken(&self) -> bool;
}

/// Opens sessions against a target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(
        &self,
        target: &TargetDescriptor,
        connect_timeout: Duration,
    ) -> Result<Self::Session, ConnectError>;
}
