//! One connection pool per target database, created on first use.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::async_pool::{AcquireError, AsyncPool, AsyncPooled};
use crate::error::{ConnectError, TargetError};
use crate::postgres::PgConnector;
use crate::rowset::Cell;
use crate::session::{Connector, Session};
use crate::settings::{ConnectUrgency, PoolSettings};
use crate::target::{HostResolver, PoolKey, TargetDescriptor};

pub type PooledSession<S> = AsyncPooled<S, ConnectError>;

/// The pool serving one [`PoolKey`]. Sessions authenticate with the
/// credentials of the target that created the pool.
pub struct TargetPool<C: Connector> {
    key: PoolKey,
    pool: Arc<AsyncPool<C::Session, ConnectError>>,
    acquire_timeout: Duration,
}

impl<C: Connector> TargetPool<C> {
    fn new(key: PoolKey, target: TargetDescriptor, connector: Arc<C>, settings: &PoolSettings) -> Self {
        let connect_timeout = settings.connect_timeout(ConnectUrgency::Interactive);
        let pool = AsyncPool::new(settings.max_size, Some(settings.idle_timeout()), move || {
            let connector = Arc::clone(&connector);
            let target = target.clone();
            async move { connector.connect(&target, connect_timeout).await }
        });
        Self {
            key,
            pool,
            acquire_timeout: settings.acquire_timeout(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub async fn acquire(&self) -> Result<PooledSession<C::Session>, ConnectError> {
        self.pool
            .acquire(Some(self.acquire_timeout))
            .await
            .map_err(|err| match err {
                AcquireError::Timeout => ConnectError::PoolExhausted {
                    key: self.key.to_string(),
                },
                AcquireError::Closed => ConnectError::PoolClosed {
                    key: self.key.to_string(),
                },
                AcquireError::Create(err) => err,
            })
    }

    /// Returns a session to the pool, or drops it if the connection died.
    pub fn release(&self, session: PooledSession<C::Session>) {
        if session.is_broken() {
            debug!(pool = %self.key, "discarding broken connection");
            session.discard();
        } else {
            drop(session);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            key: self.key.to_string(),
            live: self.pool.live_count(),
            idle: self.pool.idle_count(),
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub key: String,
    pub live: usize,
    pub idle: usize,
}

/// Result of an administrative connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub server_version: String,
    pub elapsed_ms: u64,
}

/// Owns every per-target pool for the life of the process.
///
/// The key map only grows during normal operation; `close_all` is the one
/// place entries are removed.
pub struct PoolRegistry<C: Connector = PgConnector> {
    connector: Arc<C>,
    settings: PoolSettings,
    resolver: HostResolver,
    pools: RwLock<HashMap<PoolKey, Arc<TargetPool<C>>>>,
    gates: Mutex<HashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>>,
    created: AtomicUsize,
}

impl PoolRegistry<PgConnector> {
    pub fn postgres(settings: PoolSettings, resolver: HostResolver) -> Self {
        let connector = PgConnector::new(
            settings.application_name.clone(),
            settings.ssl_root_cert.clone(),
        );
        Self::new(connector, settings, resolver)
    }
}

impl<C: Connector> PoolRegistry<C> {
    pub fn new(connector: C, settings: PoolSettings, resolver: HostResolver) -> Self {
        Self {
            connector: Arc::new(connector),
            settings,
            resolver,
            pools: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Parses a tenant connection URL with this registry's host resolver.
    pub fn resolve_target(&self, url: &str) -> Result<TargetDescriptor, TargetError> {
        TargetDescriptor::parse(url, &self.resolver)
    }

    /// Returns the pool for `target`, creating it on first use.
    ///
    /// A new pool is published only after its first connection succeeds, so
    /// a failed attempt leaves nothing behind and the next call retries.
    pub async fn get_pool(&self, target: &TargetDescriptor) -> Result<Arc<TargetPool<C>>, ConnectError> {
        let key = target.pool_key();
        if let Some(pool) = self.lookup(&key) {
            return Ok(pool);
        }

        let gate = {
            let mut gates = self.gates.lock();
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let creating = gate.lock().await;
        let outcome = match self.lookup(&key) {
            Some(pool) => Ok(pool),
            None => self.create_pool(&key, target).await,
        };
        self.retire_gate(&key, &gate);
        drop(creating);
        outcome
    }

    async fn create_pool(
        &self,
        key: &PoolKey,
        target: &TargetDescriptor,
    ) -> Result<Arc<TargetPool<C>>, ConnectError> {
        let pool = Arc::new(TargetPool::new(
            key.clone(),
            target.clone(),
            Arc::clone(&self.connector),
            &self.settings,
        ));
        match pool.acquire().await {
            Ok(first) => pool.release(first),
            Err(err) => {
                pool.close();
                warn!(
                    pool = %key,
                    user = %target.user,
                    code = err.sqlstate().unwrap_or("-"),
                    error = %err,
                    "failed to open connection pool"
                );
                return Err(err);
            }
        }

        self.pools.write().insert(key.clone(), Arc::clone(&pool));
        self.created.fetch_add(1, Ordering::SeqCst);
        info!(
            pool = %key,
            user = %target.user,
            max_size = self.settings.max_size,
            tls = target.use_tls,
            "created connection pool"
        );
        Ok(pool)
    }

    /// Opens a throwaway session with the administrative connect timeout and
    /// asks the server for its version. Never registers a pool.
    pub async fn probe(&self, target: &TargetDescriptor) -> Result<ProbeReport, ConnectError> {
        let started = Instant::now();
        let timeout = self.settings.connect_timeout(ConnectUrgency::Administrative);
        let session = self.connector.connect(target, timeout).await?;
        let rows = session
            .query("SELECT version()", &[])
            .await
            .map_err(|err| ConnectError::Other {
                code: err.code.clone(),
                message: err.message.clone(),
            })?;
        let server_version = match rows.rows.first().and_then(|row| row.first()) {
            Some(Cell::Text(version)) => version.clone(),
            _ => String::new(),
        };
        Ok(ProbeReport {
            server_version,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Drops idle connections past the idle timeout across every pool.
    pub fn evict_idle(&self) -> usize {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        pools.iter().map(|pool| pool.pool.evict_idle()).sum()
    }

    /// Runs [`Self::evict_idle`] every `every` until the registry is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.evict_idle();
                if evicted > 0 {
                    debug!(evicted, "evicted idle connections");
                }
            }
        })
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.read().values().map(|pool| pool.stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Number of pools created since startup.
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Closes and forgets every pool. Sessions still checked out are closed
    /// when they are released.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.pools.write().drain().collect();
        self.gates.lock().clear();
        for (key, pool) in drained {
            pool.close();
            info!(pool = %key, "closed connection pool");
        }
    }

    // Callers that already hold a clone of the gate keep it alive, so two
    // creators never run for one key.
    fn retire_gate(&self, key: &PoolKey, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock();
        if Arc::strong_count(gate) == 2 {
            gates.remove(key);
        }
    }

    fn lookup(&self, key: &PoolKey) -> Option<Arc<TargetPool<C>>> {
        self.pools.read().get(key).cloned()
    }
}
