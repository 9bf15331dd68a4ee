//! Composition root tying the pool registry to the executor.

use std::sync::Arc;
use std::time::Duration;

use lumen_db::{
    Connector, HostResolver, PgConnector, PoolRegistry, PoolStats, ProbeReport, TargetDescriptor,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::error::QueryError;
use crate::executor::QueryExecutor;
use crate::request::{QueryRequest, QueryResult};

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the pool registry and the executor for the life of the process.
pub struct Engine<C: Connector = PgConnector> {
    registry: Arc<PoolRegistry<C>>,
    executor: QueryExecutor<C>,
}

impl Engine<PgConnector> {
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resolver = HostResolver::detect(config.environment.in_container);
        let registry = PoolRegistry::postgres(config.pool, resolver);
        info!(
            in_container = resolver.in_container(),
            max_pool_size = registry.settings().max_size,
            "query engine ready"
        );
        Ok(Self::assemble(registry, config.limits))
    }
}

impl<C: Connector> Engine<C> {
    /// Builds an engine around a caller-supplied connector.
    pub fn with_connector(config: EngineConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let resolver = HostResolver::detect(config.environment.in_container);
        Ok(Self::assemble(
            PoolRegistry::new(connector, config.pool, resolver),
            config.limits,
        ))
    }

    fn assemble(registry: PoolRegistry<C>, limits: crate::config::QueryLimits) -> Self {
        let registry = Arc::new(registry);
        let executor = QueryExecutor::new(Arc::clone(&registry), limits);
        Self { registry, executor }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<C>> {
        &self.registry
    }

    pub fn executor(&self) -> &QueryExecutor<C> {
        &self.executor
    }

    /// Resolves a tenant's stored connection URL. A missing or blank URL
    /// means no target is configured.
    pub fn target(&self, connection_url: Option<&str>) -> Result<TargetDescriptor, QueryError> {
        let url = connection_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| QueryError::configuration("no target database is configured"))?;
        Ok(self.registry.resolve_target(url)?)
    }

    /// Resolves the target and runs `request` against it.
    pub async fn query(
        &self,
        connection_url: Option<&str>,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let target = self.target(connection_url).inspect_err(|err| {
            warn!(kind = err.kind(), error = %err, "cannot resolve query target");
        })?;
        self.executor.execute(request, &target).await
    }

    pub async fn execute(
        &self,
        request: &QueryRequest,
        target: &TargetDescriptor,
    ) -> Result<QueryResult, QueryError> {
        self.executor.execute(request, target).await
    }

    /// Checks that a connection URL works without registering a pool.
    pub async fn test_connection(&self, connection_url: &str) -> Result<ProbeReport, QueryError> {
        let target = self.target(Some(connection_url))?;
        self.registry.probe(&target).await.map_err(|err| {
            warn!(
                pool = %target.pool_key(),
                user = %target.user,
                code = err.sqlstate().unwrap_or("-"),
                error = %err,
                "connection test failed"
            );
            QueryError::from(err)
        })
    }

    /// Periodically drops connections idle past the configured timeout.
    pub fn start_idle_reaper(&self) -> JoinHandle<()> {
        let every = (self.registry.settings().idle_timeout() / 2).max(MIN_REAP_INTERVAL);
        self.registry.spawn_idle_reaper(every)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.registry.stats()
    }

    /// Closes every pool.
    pub fn shutdown(&self) {
        self.registry.close_all();
        info!(pools_created = self.registry.pools_created(), "query engine shut down");
    }
}
