//! Glue between the matcher and the cache store

use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use crate::{
    cache::{Cache, CacheEntry, CacheValue},
    matcher::Matcher,
    metrics,
    rpc::{RpcRequest, RpcResponse},
};

/// Stores and fetches responses keyed by the matcher's projection of each
/// request.
///
/// An empty key means the request does not participate in caching, and both
/// operations are no-ops for it.
pub struct ResponseCache {
    store: Arc<dyn Cache>,
    matcher: Arc<Matcher>,
}

impl ResponseCache {
    /// Binds a store and a compiled policy table together.
    pub fn new(store: Arc<dyn Cache>, matcher: Arc<Matcher>) -> Self {
        Self { store, matcher }
    }

    /// The compiled policy table.
    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    /// Writes a (request, response) pair.
    ///
    /// No-op when the key is empty or the method's policy forbids storing.
    /// Updates the cache-size gauge after a successful write.
    pub async fn set(&self, request: &RpcRequest, response: &RpcResponse) -> Result<()> {
        let key = self.matcher.key(&request.method, &request.params);
        if key.is_empty() {
            return Ok(());
        }
        if self.matcher.policy(&request.method).is_some_and(|policy| policy.no_store_cache) {
            debug!("method {} has no_store_cache, skipping write", request.method);
            return Ok(());
        }

        let mut request = request.clone();
        request.remote_addr = None;
        self.store.set(&key, CacheEntry { request, response: response.clone() }).await?;

        if let Ok(len) = self.store.len().await {
            metrics::set_cache_size(len);
        }
        Ok(())
    }

    /// Fetches the cached response for a request, decoding either a typed
    /// pair or a raw JSON blob depending on the backend.
    ///
    /// Store faults surface as [`crate::cache::CacheError`] inside the
    /// report so callers can downgrade them to a miss; decode failures are
    /// ordinary errors.
    pub async fn get(&self, request: &RpcRequest) -> Result<Option<RpcResponse>> {
        let key = self.matcher.key(&request.method, &request.params);
        if key.is_empty() {
            return Ok(None);
        }
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(CacheValue::Inline(entry)) => Ok(Some(entry.response)),
            Some(CacheValue::Encoded(raw)) => {
                let entry: CacheEntry = serde_json::from_slice(&raw)
                    .map_err(|e| eyre::eyre!("cannot decode cache entry for key {key}: {e}"))?;
                Ok(Some(entry.response))
            }
        }
    }

    /// Snapshot of every stored request, for the cache refresher.
    pub async fn requests(&self) -> Result<Vec<RpcRequest>> {
        Ok(self.store.requests().await?)
    }
}
