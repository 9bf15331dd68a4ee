//! Connection pooling and Postgres plumbing for the Lumen query engine.

mod async_pool;
mod error;
mod param;
mod postgres;
mod registry;
mod rowset;
mod session;
mod settings;
mod target;

pub use async_pool::{AcquireError, AsyncPool, AsyncPooled};
pub use error::{ConnectError, DriverError, DriverErrorClass, TargetError};
pub use postgres::{PgConnector, PgSession};
pub use registry::{PoolRegistry, PoolStats, PooledSession, ProbeReport, TargetPool};
pub use rowset::{Cell, RawColumn, RowSet};
pub use session::{Connector, Session};
pub use settings::{ConnectUrgency, PoolSettings};
pub use target::{CONTAINER_ENV_VAR, DEFAULT_PORT, DOCKER_HOST_ALIAS, HostResolver, PoolKey, TargetDescriptor};
