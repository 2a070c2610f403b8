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

//! Background loops that keep selected cache entries warm

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use eyre::Result;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    auth::JwtAuth,
    config::Config,
    response_cache::ResponseCache,
    rpc::{self, RpcRequest, RpcResponse},
};

/// Poll period of [`Updater::stop_with_timeout`]
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs the method refresher and the cache refresher.
///
/// Both loops POST straight to the upstream endpoint with a self-issued
/// admin bearer token and record the replies through the shared cache-write
/// path. Going through the proxy route instead would serve refreshes from
/// the very entries they are meant to renew. Each loop bumps the `stopped`
/// counter on exit, which [`Updater::stop_with_timeout`] polls during
/// graceful shutdown.
pub struct Updater {
    cacher: Arc<ResponseCache>,
    client: reqwest::Client,
    url: String,
    token: String,
    batch_size: usize,
    concurrency: usize,
    stopped: AtomicU32,
}

impl Updater {
    /// Creates an updater posting to `url` with the given bearer token.
    pub fn new(
        cacher: Arc<ResponseCache>,
        url: String,
        token: String,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            cacher,
            client: reqwest::Client::new(),
            url,
            token,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            stopped: AtomicU32::new(0),
        }
    }

    /// Creates an updater from configuration, self-issuing an admin token.
    pub fn from_config(config: &Config, cacher: Arc<ResponseCache>, auth: &JwtAuth) -> Result<Self> {
        let token = auth.issue(&["admin".to_string()])?;
        debug!("issued refresher token: {token}");
        Ok(Self::new(
            cacher,
            config.proxy_url.clone(),
            token,
            config.requests_batch_size,
            config.requests_concurrency,
        ))
    }

    /// Method refresher: prewarms the cache with synthetic requests built
    /// from the custom-method policies. Runs one tick immediately, then one
    /// every `period` until shutdown.
    pub async fn start_method_updater(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.update_methods().await {
                        warn!("cannot update method cache: {err}");
                    }
                }
            }
        }
        info!("exiting method updater...");
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    /// Cache refresher: replays every cached request so entries stay fresh.
    /// Runs one tick immediately, then one every `period` until shutdown.
    pub async fn start_cache_updater(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.update_cache().await {
                        warn!("cannot update cached requests: {err}");
                    }
                }
            }
        }
        info!("exiting cache updater...");
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    /// Waits until `expected` loops have marked themselves stopped, polling
    /// every 500 ms. Returns false when the timeout elapses first.
    pub async fn stop_with_timeout(&self, timeout: Duration, expected: u32) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = tokio::time::interval(STOP_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) >= expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// One method-refresher tick.
    async fn update_methods(&self) -> Result<()> {
        let requests: Vec<RpcRequest> = self
            .cacher
            .matcher()
            .methods()
            .into_iter()
            .enumerate()
            .map(|(idx, method)| RpcRequest::new(json!(idx as u64 + 1), method.name, method.params))
            .collect();
        if requests.is_empty() {
            return Ok(());
        }
        debug!("refreshing {} custom methods", requests.len());

        let responses = self.post_rpc(&requests).await?;

        let mut errors = Vec::new();
        for response in responses {
            let Some(request) =
                requests.iter().find(|request| rpc::ids_equal(&request.id, &response.id))
            else {
                continue;
            };
            if response.error.is_some() {
                continue;
            }
            if let Err(err) = self.cacher.set(request, &response).await {
                errors.push(format!("method {}: {err}", request.method));
            }
        }
        join_errors(errors)
    }

    /// One cache-refresher tick.
    async fn update_cache(&self) -> Result<()> {
        let matcher = self.cacher.matcher();
        let requests: Vec<RpcRequest> = self
            .cacher
            .requests()
            .await?
            .into_iter()
            .filter(|request| {
                matcher.policy(&request.method).is_some_and(|policy| !policy.no_update_cache)
            })
            .collect();
        if requests.is_empty() {
            return Ok(());
        }
        debug!("refreshing {} cached requests", requests.len());

        let chunks: Vec<Vec<RpcRequest>> =
            requests.chunks(self.batch_size).map(<[RpcRequest]>::to_vec).collect();

        let errors: Vec<String> = futures::stream::iter(chunks)
            .map(|chunk| async move {
                self.refresh_chunk(&chunk).await.err().map(|err| err.to_string())
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        join_errors(errors)
    }

    /// Reissues one batch of cached requests and overwrites their entries.
    async fn refresh_chunk(&self, chunk: &[RpcRequest]) -> Result<()> {
        let responses = self.post_rpc(chunk).await?;

        let mut errors = Vec::new();
        for (pos, response) in responses.into_iter().enumerate() {
            let request = chunk
                .iter()
                .find(|request| rpc::ids_equal(&request.id, &response.id))
                .or_else(|| chunk.get(pos));
            let Some(request) = request else { continue };
            if response.error.is_some() {
                continue;
            }
            if let Err(err) = self.cacher.set(request, &response).await {
                errors.push(format!("method {}: {err}", request.method));
            }
        }
        join_errors(errors)
    }

    /// POSTs a batch to the upstream endpoint and parses the replies.
    async fn post_rpc(&self, requests: &[RpcRequest]) -> Result<Vec<RpcResponse>> {
        let body = rpc::requests_body(requests)?;
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let raw = response.bytes().await?;
        rpc::parse_responses(&raw)
    }
}

fn join_errors(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(eyre::eyre!(errors.join("; ")))
    }
}
