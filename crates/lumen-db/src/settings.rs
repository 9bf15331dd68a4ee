//! Pool sizing and timeouts.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_SIZE: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ADMIN_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_APPLICATION_NAME: &str = "lumen";

/// Who is waiting on a new connection. Interactive queries fail fast;
/// connection probes wait longer to surface a clearer diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectUrgency {
    Interactive,
    Administrative,
}

/// Sizing and timeouts applied to every per-target pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub admin_connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    /// Extra PEM root certificate trusted for TLS targets.
    pub ssl_root_cert: Option<PathBuf>,
    pub application_name: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            admin_connect_timeout_ms: DEFAULT_ADMIN_CONNECT_TIMEOUT_MS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            ssl_root_cert: None,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self, urgency: ConnectUrgency) -> Duration {
        match urgency {
            ConnectUrgency::Interactive => Duration::from_millis(self.connect_timeout_ms),
            ConnectUrgency::Administrative => Duration::from_millis(self.admin_connect_timeout_ms),
        }
    }
}
