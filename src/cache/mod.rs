//! Shared response cache: entry model, directive parsing, validators, the
//! store adapter and the revalidation lock.
//!
//! Every store failure is absorbed here. The proxy treats the cache as an
//! optimisation, so a dead store turns into misses and direct passthrough.

pub mod conditional;
pub mod control;
pub mod entry;
pub mod lock;
pub mod store;

pub use control::CacheControl;
pub use entry::{CacheEntry, is_storable_response, now_millis};
pub use lock::LockManager;
pub use store::{KvStore, MemoryStore, RedisStore};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::admin::ProxyMetrics;

/// Which branch produced a response, reported in the `x-proxy-cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    HitFresh,
    HitStale,
    HitStaleRevalidating,
    HitLocal304,
    MissStored,
    Bypass,
    BypassStale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::HitFresh => "HIT-FRESH",
            CacheStatus::HitStale => "HIT-STALE",
            CacheStatus::HitStaleRevalidating => "HIT-STALE-REVALIDATING",
            CacheStatus::HitLocal304 => "HIT-LOCAL-304",
            CacheStatus::MissStored => "MISS-STORED",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::BypassStale => "BYPASS-STALE",
        }
    }
}

/// Stores [`CacheEntry`] values keyed by a hash of the target URL.
///
/// Keys look like `<prefix><sha256-hex>`; bumping the prefix version
/// abandons old entries instead of misreading them.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    prefix: String,
    metrics: Arc<ProxyMetrics>,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            metrics,
        }
    }

    /// Lowercase hex SHA-256 of the exact URL string.
    pub fn hash_url(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn key_for(&self, url: &str) -> String {
        format!("{}{}", self.prefix, Self::hash_url(url))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Looks up the entry for `url`. Store and decode failures read as a miss.
    pub async fn read(&self, url: &str) -> Option<CacheEntry> {
        let key = self.key_for(url);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read failed for {} ({}): {}", url, self.store.kind(), e);
                self.metrics.store_errors_total.with_label_values(&["read"]).inc();
                return None;
            }
        };

        match CacheEntry::from_slice(&raw) {
            Ok(entry) if entry.url == url => Some(entry),
            Ok(entry) => {
                warn!("Cache key collision: {} holds {}", key, entry.url);
                None
            }
            Err(e) => {
                debug!("Discarding undecodable cache entry {}: {}", key, e);
                self.metrics.store_errors_total.with_label_values(&["decode"]).inc();
                None
            }
        }
    }

    /// Persists `entry` for `url` with a TTL covering its freshness and SWR
    /// windows. Returns whether the store accepted it.
    pub async fn write(&self, url: &str, entry: &CacheEntry) -> bool {
        let raw = match entry.to_bytes() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode cache entry for {}: {}", url, e);
                return false;
            }
        };
        let ttl = entry.ttl_secs();
        match self.store.set_ex(&self.key_for(url), raw, ttl).await {
            Ok(()) => {
                debug!("Cache STORE: {} ({} bytes, ttl {}s)", url, entry.body.len(), ttl);
                true
            }
            Err(e) => {
                warn!("Cache write failed for {} ({}): {}", url, self.store.kind(), e);
                self.metrics.store_errors_total.with_label_values(&["write"]).inc();
                false
            }
        }
    }

    /// Best-effort purge.
    pub async fn delete(&self, url: &str) {
        match self.store.del(&self.key_for(url)).await {
            Ok(()) => debug!("Cache PURGE: {}", url),
            Err(e) => {
                warn!("Cache delete failed for {} ({}): {}", url, self.store.kind(), e);
                self.metrics.store_errors_total.with_label_values(&["delete"]).inc();
            }
        }
    }
}
