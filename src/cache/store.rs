use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::now_millis;
use crate::error::StoreError;

/// The key-value operations the cache needs from its backing store.
///
/// `set_nx_ex` must be a single atomic operation in the store itself; the
/// revalidation lock depends on it.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, expiring after `ttl_secs` (at least 1).
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Stores `value` only if `key` is absent. Returns `true` if this call set it.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis
// ─────────────────────────────────────────────────────────────────────────────

/// How long a failed connect keeps later calls from trying again.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Redis-backed store shared by every proxy instance.
///
/// The connection is opened on first use rather than at startup, so the proxy
/// boots (and serves uncached traffic) while Redis is down. Every call,
/// connecting included, is bounded by `timeout`. After a failed connect the
/// store answers `Unavailable` without touching the network until
/// [`RECONNECT_COOLDOWN`] has passed, then the next call tries once more.
pub struct RedisStore {
    client: redis::Client,
    timeout: Duration,
    cooldown: Duration,
    conn: OnceCell<ConnectionManager>,
    /// Epoch ms of the last failed connect, 0 when none.
    failed_at: AtomicU64,
}

impl RedisStore {
    /// Validates the connection string without connecting.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            timeout,
            cooldown: RECONNECT_COOLDOWN,
            conn: OnceCell::new(),
            failed_at: AtomicU64::new(0),
        })
    }

    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn cooling_down(&self) -> bool {
        let failed_at = self.failed_at.load(Ordering::Relaxed);
        failed_at != 0
            && now_millis().saturating_sub(failed_at) < self.cooldown.as_millis() as u64
    }

    fn mark_failed(&self) {
        self.failed_at.store(now_millis().max(1), Ordering::Relaxed);
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(manager) = self.conn.get() {
            return Ok(manager.clone());
        }
        if self.cooling_down() {
            return Err(StoreError::Unavailable("reconnect cooling down".to_string()));
        }

        let manager = self
            .conn
            .get_or_try_init(|| async {
                // Callers queued behind a failed attempt must not repeat it.
                if self.cooling_down() {
                    return Err(StoreError::Unavailable("reconnect cooling down".to_string()));
                }
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(0)
                    .set_connection_timeout(self.timeout)
                    .set_response_timeout(self.timeout);
                match ConnectionManager::new_with_config(self.client.clone(), config).await {
                    Ok(manager) => {
                        self.failed_at.store(0, Ordering::Relaxed);
                        info!(
                            "Redis cache store connected: {}",
                            self.client.get_connection_info().addr
                        );
                        Ok(manager)
                    }
                    Err(e) => {
                        self.mark_failed();
                        Err(StoreError::from(e))
                    }
                }
            })
            .await?;
        Ok(manager.clone())
    }

    /// Runs one store call, connect included, under the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                if self.conn.get().is_none() {
                    self.mark_failed();
                }
                debug!("Redis {} timed out after {:?}", op, self.timeout);
                Err(StoreError::Timeout(op, self.timeout))
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded("GET", async {
            let mut conn = self.connection().await?;
            let raw: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(raw)
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), StoreError> {
        self.bounded("SET", async {
            let mut conn = self.connection().await?;
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs.max(1))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.bounded("DEL", async {
            let mut conn = self.connection().await?;
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError> {
        self.bounded("SET NX", async {
            let mut conn = self.connection().await?;
            // SET NX replies OK when it wrote and nil when the key already existed.
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs.max(1))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process
// ─────────────────────────────────────────────────────────────────────────────

/// Writes between sweeps of expired keys.
const SWEEP_EVERY: usize = 256;

/// Single-process store with per-key expiry.
///
/// Only coordinates requests inside one proxy process, so it suits local
/// development and tests rather than a fleet behind a load balancer.
/// Expired keys are dropped when read and by a sweep every [`SWEEP_EVERY`]
/// writes.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired key and returns how many went.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Must run before any shard guard is taken.
    fn count_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % SWEEP_EVERY == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                debug!("Memory store swept {} expired keys", removed);
            }
        }
    }

    /// Whether a live (unexpired) value exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.value().1 > Instant::now())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > now {
                return Ok(Some(value.clone()));
            }
        }
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), StoreError> {
        self.count_write();
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs.max(1));
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError> {
        self.count_write();
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(ttl_secs.max(1));
        // The entry guard holds the shard lock, so check-and-set is one step.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    debug!("set_nx_ex: {} already held", key);
                    Ok(false)
                } else {
                    occupied.insert((value.to_vec(), expires_at));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_vec(), expires_at));
                Ok(true)
            }
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_set_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set_ex("k", b"v".to_vec(), 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.contains_key("k"));

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_set_nx_only_first_wins() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", b"1", 20).await.unwrap());
        assert!(!store.set_nx_ex("lock", b"1", 20).await.unwrap());
        store.del("lock").await.unwrap();
        assert!(store.set_nx_ex("lock", b"1", 20).await.unwrap());
    }

    #[tokio::test]
    async fn memory_set_nx_is_atomic_under_contention() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.set_nx_ex("race", b"1", 20).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn redis_rejects_malformed_url() {
        assert!(RedisStore::new("not a url", Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn memory_sweeps_keys_nobody_reads() {
        let store = MemoryStore::new();
        store.set_ex("old", b"v".to_vec(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        for i in 0..SWEEP_EVERY {
            store.set_ex(&format!("k{}", i), b"v".to_vec(), 60).await.unwrap();
        }
        assert_eq!(store.entries.len(), SWEEP_EVERY);
        assert!(!store.entries.contains_key("old"));
    }

    #[tokio::test]
    async fn memory_purge_expired_counts_removals() {
        let store = MemoryStore::new();
        store.set_ex("a", b"v".to_vec(), 1).await.unwrap();
        store.set_ex("b", b"v".to_vec(), 60).await.unwrap();
        assert_eq!(store.purge_expired(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.purge_expired(), 1);
        assert!(store.contains_key("b"));
    }

    /// Accepts connections and holds them open without ever replying.
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("redis://{}/2", addr)
    }

    #[tokio::test]
    async fn redis_silent_server_is_bounded_by_timeout() {
        let store = RedisStore::new(&silent_server().await, Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        assert!(store.get("k").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));

        // the failed connect is not retried on the next call
        let started = Instant::now();
        assert!(store.set_ex("k", b"v".to_vec(), 5).await.is_err());
        assert!(store.del("k").await.is_err());
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn redis_silent_server_does_not_queue_callers() {
        let store = std::sync::Arc::new(
            RedisStore::new(&silent_server().await, Duration::from_millis(200)).unwrap(),
        );

        let started = Instant::now();
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let begun = Instant::now();
                let result = store.get(&format!("k{}", i)).await;
                (result.is_err(), begun.elapsed())
            }));
        }
        for h in handles {
            let (failed, took) = h.await.unwrap();
            assert!(failed);
            assert!(took < Duration::from_secs(1), "call took {:?}", took);
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn redis_retries_after_cooldown() {
        let store = RedisStore::new("redis://127.0.0.1:1/2", Duration::from_millis(200))
            .unwrap()
            .with_reconnect_cooldown(Duration::from_millis(50));
        assert!(store.get("k").await.is_err());
        assert!(store.cooling_down());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!store.cooling_down());
    }

    #[tokio::test]
    async fn redis_unreachable_reports_error() {
        // Port 1 is never a Redis server; the connect must fail, not hang.
        let store = RedisStore::new("redis://127.0.0.1:1/2", Duration::from_millis(200)).unwrap();
        assert!(store.get("k").await.is_err());
        assert!(store.set_nx_ex("k", b"1", 5).await.is_err());
    }
}
