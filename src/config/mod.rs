use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Which key-value store backs the response cache.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Shared Redis instance; required when more than one proxy runs.
    #[default]
    Redis,
    /// In-process map; single instance only.
    Memory,
}

/// How the proxy reaches the origin API.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OriginConfig {
    /// Base URL requests are forwarded to, e.g. `http://backend:8080`.
    /// Requests fail with 500 while this is unset.
    pub base_url: Option<String>,
    pub connect_timeout_ms: u64,
    /// Upper bound on a single origin exchange (until response headers).
    pub request_timeout_secs: u64,
    /// How long an idle keep-alive connection stays in the pool.
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout_ms: 5_000,
            request_timeout_secs: 60,
            pool_idle_timeout_secs: 10,
            pool_max_idle_per_host: 128,
        }
    }
}

impl OriginConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Response cache behaviour and store connection.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub store: StoreBackend,
    /// Redis connection string. Defaults to database 2 so cache keys stay
    /// apart from other tenants of the same Redis instance.
    pub redis_url: String,
    /// Connect and per-command timeout for Redis.
    pub redis_timeout_ms: u64,
    /// Versioned namespace prepended to every key.
    pub key_prefix: String,
    /// SWR window applied when origin sends no `stale-while-revalidate`.
    pub default_swr_secs: u64,
    /// Lifetime of a revalidation lock.
    pub lock_ttl_secs: u64,
    /// Entries older than this are never served stale, whatever SWR says.
    pub max_stale_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379/2".to_string(),
            redis_timeout_ms: 250,
            key_prefix: "swr:v1:".to_string(),
            default_swr_secs: 30,
            lock_ttl_secs: 20,
            max_stale_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn max_stale_ms(&self) -> u64 {
        self.max_stale_secs.saturating_mul(1000)
    }
}

/// The global application configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub proxy_bind: String,
    pub admin_bind: String,
    pub workers: usize,
    /// Inbound path prefix that is stripped before forwarding (e.g. `/api/`).
    pub route_prefix: String,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
    /// Static bearer token attached to every forwarded request, if set.
    #[serde(skip_serializing)]
    pub session_bearer_token: Option<String>,
    /// Path to write access logs. If None, access logging is disabled.
    pub access_log_path: Option<String>,
    /// Format of access log entries: "json" (default), "combined", or "common".
    pub access_log_format: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_bind: "0.0.0.0:8080".to_string(),
            admin_bind: "127.0.0.1:9090".to_string(),
            workers: 4,
            route_prefix: "/api/".to_string(),
            origin: OriginConfig::default(),
            cache: CacheConfig::default(),
            session_bearer_token: None,
            access_log_path: None,
            access_log_format: None,
        }
    }
}

impl AppConfig {
    /// Builds the configuration from `(name, value)` pairs, falling back to
    /// defaults for anything missing or unparseable.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let mut cfg = AppConfig::default();

        if let Some(v) = vars.get("PROXY_BIND") {
            cfg.proxy_bind = v.clone();
        }
        if let Some(v) = vars.get("ADMIN_BIND") {
            cfg.admin_bind = v.clone();
        }
        cfg.workers = parsed(&vars, "PROXY_WORKERS", cfg.workers).max(1);
        if let Some(v) = vars.get("PROXY_ROUTE_PREFIX") {
            cfg.route_prefix = normalize_prefix(v);
        }

        // Origin
        cfg.origin.base_url = vars.get("BACKEND_URL").cloned();
        cfg.origin.connect_timeout_ms =
            parsed(&vars, "ORIGIN_CONNECT_TIMEOUT_MS", cfg.origin.connect_timeout_ms);
        cfg.origin.request_timeout_secs =
            parsed(&vars, "ORIGIN_REQUEST_TIMEOUT_SECS", cfg.origin.request_timeout_secs);
        cfg.origin.pool_idle_timeout_secs =
            parsed(&vars, "ORIGIN_POOL_IDLE_TIMEOUT_SECS", cfg.origin.pool_idle_timeout_secs);
        cfg.origin.pool_max_idle_per_host =
            parsed(&vars, "ORIGIN_POOL_MAX_IDLE", cfg.origin.pool_max_idle_per_host);

        // Cache
        if let Some(v) = vars.get("CACHE_STORE") {
            cfg.cache.store = match v.to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                other => {
                    tracing::warn!("Unknown CACHE_STORE '{}', using redis", other);
                    StoreBackend::Redis
                }
            };
        }
        if let Some(v) = vars.get("REDIS_URL") {
            cfg.cache.redis_url = v.clone();
        }
        cfg.cache.redis_timeout_ms = parsed(&vars, "REDIS_TIMEOUT_MS", cfg.cache.redis_timeout_ms);
        if let Some(v) = vars.get("CACHE_KEY_PREFIX") {
            cfg.cache.key_prefix = v.clone();
        }
        cfg.cache.default_swr_secs =
            parsed(&vars, "CACHE_DEFAULT_SWR_SECS", cfg.cache.default_swr_secs);
        cfg.cache.lock_ttl_secs = parsed(&vars, "CACHE_LOCK_TTL_SECS", cfg.cache.lock_ttl_secs);
        cfg.cache.max_stale_secs = parsed(&vars, "CACHE_MAX_STALE_SECS", cfg.cache.max_stale_secs);

        cfg.session_bearer_token = vars.get("SESSION_BEARER_TOKEN").cloned();
        cfg.access_log_path = vars.get("ACCESS_LOG_PATH").cloned();
        cfg.access_log_format = vars.get("ACCESS_LOG_FORMAT").cloned();

        cfg
    }
}

/// Reads the configuration from the process environment.
pub fn load_config() -> AppConfig {
    let cfg = AppConfig::from_vars(std::env::vars());
    match cfg.origin.base_url {
        Some(ref url) => tracing::info!("Origin base URL: {}", url),
        None => tracing::warn!("BACKEND_URL not set; proxied requests will fail with 500"),
    }
    cfg
}

fn parsed<T: FromStr + Copy>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    match vars.get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

/// Ensures the prefix starts and ends with `/`.
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}
