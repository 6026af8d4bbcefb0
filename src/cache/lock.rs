use std::sync::Arc;
use tracing::{debug, warn};

use super::ResponseCache;
use super::store::KvStore;

/// Per-URL revalidation lock living in the same store as the cache entries.
///
/// There is no release: the lock simply expires after `ttl_secs`, which also
/// bounds how long a crashed revalidation can block the next one.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl_secs: u64,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl_secs: ttl_secs.max(1),
        }
    }

    /// `<prefix>lock:<sha256-hex>`
    pub fn key_for(&self, url: &str) -> String {
        format!("{}lock:{}", self.prefix, ResponseCache::hash_url(url))
    }

    /// Attempts to take the lock for `url`. Only one caller across all proxy
    /// instances gets `true` until the lock expires; store errors count as a
    /// lost race.
    pub async fn try_acquire(&self, url: &str) -> bool {
        match self.store.set_nx_ex(&self.key_for(url), b"1", self.ttl_secs).await {
            Ok(true) => {
                debug!("Revalidation lock acquired for {}", url);
                true
            }
            Ok(false) => {
                debug!("Revalidation lock for {} held elsewhere", url);
                false
            }
            Err(e) => {
                warn!("Revalidation lock unavailable for {}: {}", url, e);
                false
            }
        }
    }
}
