//! Runtime configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | ORDER_SYNC_STORE_URL | keyring `store_url` | canonical store base URL |
//! | ORDER_SYNC_STORE_KEY | keyring `store_anon_key` | store API key |
//! | ORDER_SYNC_DATA_DIR | `<data home>/order-sync` | local database directory |
//! | ORDER_SYNC_REQUEST_TIMEOUT_SECS | 30 | REST request timeout |
//! | ORDER_SYNC_POLL_SECS | 5 | connectivity probe interval |
//! | ORDER_SYNC_HEARTBEAT_SECS | 30 | crew heartbeat interval |
//! | ORDER_SYNC_JANITOR_SECS | 300 | stale session cleanup interval |
//! | ORDER_SYNC_RECONNECT_BASE_MS | 1000 | first reconnect delay |
//! | ORDER_SYNC_MAX_RECONNECTS | 5 | consecutive failures before giving up |

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;
use crate::storage::{self, KEY_STORE_ANON_KEY, KEY_STORE_URL};

pub const ENV_STORE_URL: &str = "ORDER_SYNC_STORE_URL";
pub const ENV_STORE_KEY: &str = "ORDER_SYNC_STORE_KEY";
pub const ENV_DATA_DIR: &str = "ORDER_SYNC_DATA_DIR";

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub url: String,
    pub anon_key: String,
    pub timeout: Duration,
}

impl StoreConfig {
    pub fn new(url: impl AsRef<str>, anon_key: impl Into<String>) -> Self {
        Self {
            url: crate::api::normalize_store_url(url.as_ref()),
            anon_key: anon_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How often the connectivity loop probes the store.
    pub connectivity_poll: Duration,
    /// `local_settings` key holding the durable queue.
    pub queue_slot: String,
    pub top_products_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connectivity_poll: Duration::from_secs(5),
            queue_slot: "offline_orders".into(),
            top_products_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub reconnect_base: Duration,
    pub max_reconnect_attempts: u32,
    pub subscribe_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub janitor_interval: Duration,
    /// Rows fetched when refreshing a family snapshot.
    pub snapshot_limit: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            subscribe_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            janitor_interval: Duration::from_secs(5 * 60),
            snapshot_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub realtime: RealtimeConfig,
    pub data_dir: PathBuf,
}

impl Config {
    /// Load from the environment, falling back to the OS credential store for
    /// the store endpoint and key.
    pub fn load() -> Result<Self, StoreError> {
        Self::from_sources(|key| std::env::var(key).ok(), storage::get_credential)
    }

    pub(crate) fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        credential: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StoreError> {
        let lookup = |var: &str, cred: &str| {
            env(var)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| credential(cred))
        };
        let url = lookup(ENV_STORE_URL, KEY_STORE_URL)
            .ok_or_else(|| StoreError::Config(format!("{ENV_STORE_URL} is not set")))?;
        let anon_key = lookup(ENV_STORE_KEY, KEY_STORE_ANON_KEY)
            .ok_or_else(|| StoreError::Config(format!("{ENV_STORE_KEY} is not set")))?;

        let mut store = StoreConfig::new(url, anon_key.trim());
        store.timeout = env_duration(&env, "ORDER_SYNC_REQUEST_TIMEOUT_SECS", Duration::from_secs)
            .unwrap_or(store.timeout);

        let mut engine = EngineConfig::default();
        if let Some(poll) = env_duration(&env, "ORDER_SYNC_POLL_SECS", Duration::from_secs) {
            engine.connectivity_poll = poll;
        }

        let mut realtime = RealtimeConfig::default();
        if let Some(v) = env_duration(&env, "ORDER_SYNC_HEARTBEAT_SECS", Duration::from_secs) {
            realtime.heartbeat_interval = v;
        }
        if let Some(v) = env_duration(&env, "ORDER_SYNC_JANITOR_SECS", Duration::from_secs) {
            realtime.janitor_interval = v;
        }
        if let Some(v) = env_duration(&env, "ORDER_SYNC_RECONNECT_BASE_MS", Duration::from_millis) {
            realtime.reconnect_base = v;
        }
        if let Some(v) = env_number(&env, "ORDER_SYNC_MAX_RECONNECTS") {
            match u32::try_from(v) {
                Ok(v) => realtime.max_reconnect_attempts = v,
                Err(_) => warn!(
                    var = "ORDER_SYNC_MAX_RECONNECTS",
                    value = v,
                    "ignoring out-of-range config value"
                ),
            }
        }

        let data_dir = env(ENV_DATA_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            store,
            engine,
            realtime,
            data_dir,
        })
    }
}

pub fn default_data_dir() -> PathBuf {
    crate::logging::app_data_base()
}

/// Positive integer from `var`. Anything else is ignored with a warning.
fn env_number(env: &impl Fn(&str) -> Option<String>, var: &str) -> Option<u64> {
    let raw = env(var)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(var, value = %raw, "ignoring invalid config value");
            None
        }
    }
}

fn env_duration(
    env: &impl Fn(&str) -> Option<String>,
    var: &str,
    unit: fn(u64) -> Duration,
) -> Option<Duration> {
    env_number(env, var).map(unit)
}
