// fil-rpc-proxy - Caching JSON-RPC reverse proxy
// Copyright (C) 2024 fil-rpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cache store backends: in-process map and remote Redis

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::rpc::{RpcRequest, RpcResponse};

/// Key prefix for entries kept in a shared Redis instance
const REDIS_KEY_PREFIX: &str = "rpc-proxy:";

/// Typed store failure.
///
/// Callers downgrade `Backend` faults on the read path to a cache miss;
/// anything else aborts the surrounding operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Connection or command failure against the backing store
    #[error("cache backend: {0}")]
    Backend(String),
    /// Entry could not be encoded for storage
    #[error("cache serialization: {0}")]
    Serialization(String),
}

/// A cached (request, response) pair.
///
/// The request is retained so the cache refresher can reissue it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The originating request
    pub request: RpcRequest,
    /// The successful response
    pub response: RpcResponse,
}

/// What a store hands back on read: either the typed pair (in-process
/// backend) or the raw encoded blob (remote backend). Readers handle both.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Typed pair held by value
    Inline(CacheEntry),
    /// JSON encoding of a [`CacheEntry`]
    Encoded(Vec<u8>),
}

/// Opaque key-value store for cached responses.
///
/// Implementations must be safe for concurrent use; eviction policy is the
/// store's own business (time-based if configured, else unbounded).
#[async_trait]
pub trait Cache: Send + Sync {
    /// Stores an entry under the key, replacing any previous value.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Fetches the value for a key; `None` on miss.
    async fn get(&self, key: &str) -> Result<Option<CacheValue>, CacheError>;

    /// Snapshot of every stored request, for the cache refresher.
    async fn requests(&self) -> Result<Vec<RpcRequest>, CacheError>;

    /// Number of stored entries.
    async fn len(&self) -> Result<usize, CacheError>;

    /// Releases backend resources; the store must not be used afterwards.
    async fn close(&self) -> Result<(), CacheError>;
}

struct StoredEntry {
    entry: CacheEntry,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// In-process store with optional expiration and a periodic sweep.
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
    expiration: Option<Duration>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MemoryCache {
    /// Creates a memory store.
    ///
    /// `expiration_secs` of 0 (or less) disables expiry entirely;
    /// `cleanup_interval_secs` of -1 (or 0) disables the background sweep.
    /// Expired entries are dropped lazily on read either way.
    pub fn new(expiration_secs: i64, cleanup_interval_secs: i64) -> Self {
        let entries: Arc<RwLock<HashMap<String, StoredEntry>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let sweeper = if cleanup_interval_secs > 0 {
            let entries = entries.clone();
            let period = Duration::from_secs(cleanup_interval_secs as u64);
            Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let mut entries = entries.write().await;
                    let before = entries.len();
                    entries.retain(|_, stored| !stored.expired());
                    let dropped = before - entries.len();
                    if dropped > 0 {
                        debug!("cache sweep dropped {dropped} expired entries");
                    }
                }
            }))
        } else {
            None
        };

        let expiration =
            (expiration_secs > 0).then(|| Duration::from_secs(expiration_secs as u64));

        Self { entries, expiration, sweeper: Mutex::new(sweeper) }
    }

    /// Creates a memory store from the cache settings block.
    pub fn from_settings(settings: &crate::config::CacheSettings) -> Self {
        Self::new(settings.expiration, settings.cleanup_interval)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let expires_at = self.expiration.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), StoredEntry { entry, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if !stored.expired() => {
                    return Ok(Some(CacheValue::Inline(stored.entry.clone())))
                }
                Some(_) => {}
            }
        }
        // expired: drop it under the write lock
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|stored| stored.expired()) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn requests(&self) -> Result<Vec<RpcRequest>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|stored| !stored.expired())
            .map(|stored| stored.entry.request.clone())
            .collect())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.len())
    }

    async fn close(&self) -> Result<(), CacheError> {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        Ok(())
    }
}

/// Remote store backed by Redis.
///
/// Entries are stored as the JSON encoding of the (request, response) pair
/// under a shared key prefix; expiry is delegated to Redis via `SET ... EX`.
pub struct RedisCache {
    client: redis::Client,
    expiration: Option<u64>,
}

impl RedisCache {
    /// Connects to the Redis instance at `uri`.
    pub fn new(uri: &str, expiration_secs: i64) -> Result<Self, CacheError> {
        let client = redis::Client::open(uri)
            .map_err(|e| CacheError::Backend(format!("invalid redis uri: {e}")))?;
        let expiration = (expiration_secs > 0).then_some(expiration_secs as u64);
        Ok(Self { client, expiration })
    }

    /// Creates a redis store from the cache settings block.
    pub fn from_settings(settings: &crate::config::CacheSettings) -> Result<Self, CacheError> {
        Self::new(&settings.redis.uri, settings.expiration)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend(format!("redis connection failed: {e}")))
    }

    async fn prefixed_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(format!("{REDIS_KEY_PREFIX}*"))
            .await
            .map_err(|e| CacheError::Backend(format!("redis SCAN failed: {e}")))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(&entry)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        let key = format!("{REDIS_KEY_PREFIX}{key}");
        match self.expiration {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, encoded, ttl)
                .await
                .map_err(|e| CacheError::Backend(format!("redis SET failed: {e}")))?,
            None => conn
                .set::<_, _, ()>(key, encoded)
                .await
                .map_err(|e| CacheError::Backend(format!("redis SET failed: {e}")))?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Option<Vec<u8>> = conn
            .get(format!("{REDIS_KEY_PREFIX}{key}"))
            .await
            .map_err(|e| CacheError::Backend(format!("redis GET failed: {e}")))?;
        Ok(raw.map(CacheValue::Encoded))
    }

    async fn requests(&self) -> Result<Vec<RpcRequest>, CacheError> {
        let keys = self.prefixed_keys().await?;
        let mut conn = self.connection().await?;
        let mut requests = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<Vec<u8>> = conn
                .get(&key)
                .await
                .map_err(|e| CacheError::Backend(format!("redis GET failed: {e}")))?;
            let Some(raw) = raw else { continue };
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) => requests.push(entry.request),
                Err(e) => warn!("skipping undecodable cache entry {key}: {e}"),
            }
        }
        Ok(requests)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.prefixed_keys().await?.len())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Builds the store selected by `cache_settings.storage`.
pub fn from_config(config: &crate::config::Config) -> Result<Arc<dyn Cache>, CacheError> {
    match config.cache_settings.storage {
        crate::config::CacheStorage::Memory => {
            Ok(Arc::new(MemoryCache::from_settings(&config.cache_settings)))
        }
        crate::config::CacheStorage::Redis => {
            Ok(Arc::new(RedisCache::from_settings(&config.cache_settings)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn entry(method: &str, result: i64) -> CacheEntry {
        CacheEntry {
            request: RpcRequest::new(json!("1"), method, json!(["a"])),
            response: RpcResponse {
                jsonrpc: "2.0".to_string(),
                id: json!("1"),
                result: json!(result),
                error: None,
            },
        }
    }

    #[tokio::test]
    async fn test_memory_set_get() {
        fil_proxy_common::logging::ensure_test_logging(None);
        let cache = MemoryCache::new(0, -1);

        assert!(cache.get("k").await.unwrap().is_none());

        cache.set("k", entry("m", 15)).await.unwrap();
        match cache.get("k").await.unwrap() {
            Some(CacheValue::Inline(stored)) => assert_eq!(stored.response.result, json!(15)),
            other => panic!("unexpected cache value: {other:?}"),
        }
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_overwrite_is_last_writer_wins() {
        let cache = MemoryCache::new(0, -1);
        cache.set("k", entry("m", 1)).await.unwrap();
        cache.set("k", entry("m", 2)).await.unwrap();

        match cache.get("k").await.unwrap() {
            Some(CacheValue::Inline(stored)) => assert_eq!(stored.response.result, json!(2)),
            other => panic!("unexpected cache value: {other:?}"),
        }
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_expiration() {
        let cache = MemoryCache::new(1, -1);
        cache.set("k", entry("m", 15)).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_sweep_removes_expired() {
        let cache = MemoryCache::new(1, 1);
        cache.set("k", entry("m", 15)).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 1);

        sleep(Duration::from_millis(2200)).await;
        assert_eq!(cache.len().await.unwrap(), 0);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_requests_snapshot() {
        let cache = MemoryCache::new(0, -1);
        cache.set("a", entry("m1", 1)).await.unwrap();
        cache.set("b", entry("m2", 2)).await.unwrap();

        let mut methods: Vec<String> =
            cache.requests().await.unwrap().into_iter().map(|r| r.method).collect();
        methods.sort();
        assert_eq!(methods, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_entry_round_trips_through_json() {
        let original = entry("m", 15);
        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: CacheEntry = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_redis_rejects_bad_uri() {
        assert!(RedisCache::new("not a uri", 0).is_err());
    }
}
