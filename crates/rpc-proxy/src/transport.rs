//! Core round trip: parse, cache fill, upstream fan-out, merge, cache write

use std::{sync::Arc, time::Instant};

use reqwest::{header::CONTENT_TYPE, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    cache::CacheError,
    config::Config,
    metrics,
    response_cache::ResponseCache,
    rpc::{self, RpcRequest, RpcResponse},
};

const UPSTREAM_TIMEOUT_SECS: u64 = 10;

/// A finished proxy reply: HTTP status plus a JSON body.
#[derive(Debug)]
pub struct ProxyReply {
    /// HTTP status to return to the client
    pub status: StatusCode,
    /// Serialized JSON body
    pub body: Vec<u8>,
}

impl ProxyReply {
    fn json(status: StatusCode, value: &Value) -> Self {
        Self { status, body: serde_json::to_vec(value).unwrap_or_default() }
    }

    fn ok(body: Vec<u8>) -> Self {
        Self { status: StatusCode::OK, body }
    }
}

/// The request-processing pipeline behind the reverse-proxy route.
///
/// Splits batches, satisfies sub-requests from the response cache, forwards
/// the remainder upstream in one call, merges the results back in client
/// order and records fresh responses into the cache. Cache faults never
/// surface to the client.
pub struct Transport {
    client: reqwest::Client,
    upstream: reqwest::Url,
    cacher: Arc<ResponseCache>,
    debug_http_request: bool,
    debug_http_response: bool,
}

impl Transport {
    /// Builds the pipeline from configuration.
    pub fn from_config(config: &Config, cacher: Arc<ResponseCache>) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        let upstream = reqwest::Url::parse(&config.proxy_url)?;
        Ok(Self {
            client,
            upstream,
            cacher,
            debug_http_request: config.debug_http_request,
            debug_http_response: config.debug_http_response,
        })
    }

    /// The response cache this transport reads and writes.
    pub fn cacher(&self) -> &Arc<ResponseCache> {
        &self.cacher
    }

    /// Processes one incoming HTTP request body.
    ///
    /// Never fails: every failure mode is mapped onto an HTTP status and a
    /// JSON-RPC error envelope.
    pub async fn round_trip(
        &self,
        path: &str,
        remote_addr: Option<String>,
        body: &[u8],
    ) -> ProxyReply {
        metrics::inc_requests();
        let start = Instant::now();

        let mut parsed = match rpc::parse_requests(body, path) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("failed to parse requests: {err}");
                metrics::inc_request_errors();
                return ProxyReply::json(
                    StatusCode::BAD_REQUEST,
                    &rpc::invalid_request_envelope(&err.to_string()),
                );
            }
        };
        for request in &mut parsed {
            request.remote_addr.clone_from(&remote_addr);
        }
        debug!(
            methods = ?parsed.iter().map(|r| r.method.as_str()).collect::<Vec<_>>(),
            client = remote_addr.as_deref().unwrap_or(""),
            "handling rpc request"
        );

        let mut prepared = match self.from_cache(&parsed).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!("cannot build prepared responses: {err}");
                vec![RpcResponse::default(); parsed.len()]
            }
        };

        let proxy_idx = rpc::blank_indices(&prepared);
        let proxy_requests: Vec<RpcRequest> =
            proxy_idx.iter().map(|&idx| parsed[idx].clone()).collect();

        if proxy_requests.is_empty() {
            metrics::add_cached_requests(parsed.len() as u64);
            return self.respond(&prepared);
        }

        let upstream_body = match rpc::requests_body(&proxy_requests) {
            Ok(body) => body,
            Err(err) => {
                error!("failed to serialize upstream request: {err}");
                metrics::inc_request_errors();
                return ProxyReply::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &rpc::internal_error_envelope(&err.to_string()),
                );
            }
        };
        if self.debug_http_request {
            debug!("upstream request: {}", String::from_utf8_lossy(&upstream_body));
        }

        let send_result = self
            .client
            .post(self.upstream.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(upstream_body)
            .send()
            .await;
        metrics::observe_request_duration_ms(start.elapsed().as_millis() as f64);

        let (status, raw) = match send_result {
            Ok(response) => {
                let status = response.status();
                match response.bytes().await {
                    Ok(raw) => (status, raw),
                    Err(err) => {
                        warn!("failed to read upstream body: {err}");
                        metrics::inc_request_errors();
                        return ProxyReply::json(
                            StatusCode::BAD_GATEWAY,
                            &rpc::internal_error_envelope(&format!(
                                "upstream request failed: {err}"
                            )),
                        );
                    }
                }
            }
            Err(err) => {
                warn!("upstream request failed: {err}");
                metrics::inc_request_errors();
                return ProxyReply::json(
                    StatusCode::BAD_GATEWAY,
                    &rpc::internal_error_envelope(&format!("upstream request failed: {err}")),
                );
            }
        };
        if self.debug_http_response {
            debug!("upstream response ({status}): {}", String::from_utf8_lossy(&raw));
        }

        let upstream_responses = match rpc::parse_responses(&raw) {
            Ok(responses) => responses,
            Err(err) => {
                warn!("cannot parse upstream response: {err}");
                let status = if status.is_success() { StatusCode::BAD_GATEWAY } else { status };
                return ProxyReply::json(
                    status,
                    &rpc::internal_error_envelope(&String::from_utf8_lossy(&raw)),
                );
            }
        };

        for (pos, mut response) in upstream_responses.into_iter().enumerate() {
            // correlate by id, falling back to the position within the
            // forwarded sub-batch
            let slot = proxy_requests
                .iter()
                .position(|request| rpc::ids_equal(&request.id, &response.id))
                .map(|found| proxy_idx[found])
                .or_else(|| proxy_idx.get(pos).copied());
            let Some(slot) = slot else {
                warn!("upstream response with unmatched id {:?}", response.id);
                continue;
            };

            if response.error.is_none() {
                if let Err(err) = self.cacher.set(&parsed[slot], &response).await {
                    error!("cannot set cached response: {err}");
                }
            }
            response.id = parsed[slot].id.clone();
            prepared[slot] = response;
        }

        metrics::add_cached_requests((parsed.len() - proxy_requests.len()) as u64);
        self.respond(&prepared)
    }

    /// Fills each slot from the cache, forcing the original request id onto
    /// every hit. Typed store faults degrade to a miss; anything else aborts
    /// to an all-blank array at the caller.
    async fn from_cache(&self, requests: &[RpcRequest]) -> eyre::Result<Vec<RpcResponse>> {
        let mut prepared = vec![RpcResponse::default(); requests.len()];
        for (idx, request) in requests.iter().enumerate() {
            match self.cacher.get(request).await {
                Ok(Some(mut response)) => {
                    response.id = request.id.clone();
                    prepared[idx] = response;
                }
                Ok(None) => {}
                Err(err) if err.downcast_ref::<CacheError>().is_some() => {
                    error!("cannot get cache value for method {:?}: {err}", request.method);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(prepared)
    }

    fn respond(&self, prepared: &[RpcResponse]) -> ProxyReply {
        match rpc::responses_body(prepared) {
            Ok(body) => ProxyReply::ok(body),
            Err(err) => {
                error!("cannot serialize prepared responses: {err}");
                ProxyReply::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &rpc::internal_error_envelope(&err.to_string()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemoryCache,
        config::{CacheMethod, Config},
        matcher::Matcher,
    };
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn test_config(upstream: &str, methods: &[&str]) -> Config {
        let mut config = Config::from_yaml(&format!(
            "proxy_url: {upstream}\njwt_secret: secret\n"
        ))
        .unwrap();
        config.cache_methods = methods
            .iter()
            .map(|name| CacheMethod {
                name: name.to_string(),
                enabled: true,
                cache_by_params: true,
                ..Default::default()
            })
            .collect();
        config
    }

    fn build_transport(config: &Config) -> Transport {
        let matcher = Arc::new(Matcher::from_config(config));
        let store = Arc::new(MemoryCache::from_settings(&config.cache_settings));
        let cacher = Arc::new(ResponseCache::new(store, matcher));
        Transport::from_config(config, cacher).unwrap()
    }

    fn body_value(reply: &ProxyReply) -> Value {
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        fil_proxy_common::logging::ensure_test_logging(None);
        let mock_server = MockServer::start().await;

        let response = json!({"jsonrpc": "2.0", "id": "1", "result": 15});
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&response))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["test"]);
        let transport = build_transport(&config);

        let request =
            serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": "1", "method": "test", "params": ["a", "b"]}))
                .unwrap();

        // first call goes upstream
        let reply = transport.round_trip("/", None, &request).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(body_value(&reply), response);

        // second call is served from the cache; the mock expects one call
        let reply = transport.round_trip("/", None, &request).await;
        assert_eq!(reply.status, StatusCode::OK);
        let value = body_value(&reply);
        assert_eq!(value["result"], 15);
        assert_eq!(value["id"], "1");
    }

    #[tokio::test]
    async fn test_batch_partial_hit_forwards_only_misses() {
        fil_proxy_common::logging::ensure_test_logging(None);
        let mock_server = MockServer::start().await;

        // upstream must see a bare object holding only the missed request
        let expected_upstream =
            json!({"jsonrpc": "2.0", "id": "20", "method": "test", "params": ["2", "3"]});
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(&expected_upstream))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": "20", "result": 16}),
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["test"]);
        let transport = build_transport(&config);

        // pre-populate the cache for the first sub-request
        let cached_request = RpcRequest::new(json!("10"), "test", json!(["1", "2"]));
        let cached_response = RpcResponse {
            jsonrpc: "2.0".to_string(),
            id: json!("10"),
            result: json!(15),
            error: None,
        };
        transport.cacher().set(&cached_request, &cached_response).await.unwrap();

        let batch = serde_json::to_vec(&json!([
            {"jsonrpc": "2.0", "id": "10", "method": "test", "params": ["1", "2"]},
            {"jsonrpc": "2.0", "id": "20", "method": "test", "params": ["2", "3"]},
        ]))
        .unwrap();

        let reply = transport.round_trip("/", None, &batch).await;
        assert_eq!(reply.status, StatusCode::OK);
        let value = body_value(&reply);
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], "10");
        assert_eq!(items[0]["result"], 15);
        assert_eq!(items[1]["id"], "20");
        assert_eq!(items[1]["result"], 16);
    }

    #[tokio::test]
    async fn test_out_of_order_upstream_batch() {
        fil_proxy_common::logging::ensure_test_logging(None);
        let mock_server = MockServer::start().await;

        // reply in reverse order; the proxy must reassemble request order
        let reversed: Vec<Value> = (1..=5)
            .rev()
            .map(|i| json!({"jsonrpc": "2.0", "id": i.to_string(), "result": i * 10}))
            .collect();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&reversed))
            .expect(1)
            .mount(&mock_server)
            .await;

        let methods: Vec<String> = (1..=5).map(|i| format!("test{i}")).collect();
        let method_refs: Vec<&str> = methods.iter().map(String::as_str).collect();
        let config = test_config(&mock_server.uri(), &method_refs);
        let transport = build_transport(&config);

        let batch: Vec<Value> = (1..=5)
            .map(|i| json!({"jsonrpc": "2.0", "id": i.to_string(), "method": format!("test{i}"), "params": []}))
            .collect();
        let body = serde_json::to_vec(&batch).unwrap();

        let reply = transport.round_trip("/", None, &body).await;
        let value = body_value(&reply);
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 5);
        for (idx, item) in items.iter().enumerate() {
            let i = idx + 1;
            assert_eq!(item["id"], i.to_string());
            assert_eq!(item["result"], (i * 10) as i64);
        }

        // all five landed in the cache
        for i in 1..=5 {
            let request = RpcRequest::new(json!(i.to_string()), format!("test{i}"), json!([]));
            let hit = transport.cacher().get(&request).await.unwrap().unwrap();
            assert_eq!(hit.result, (i * 10) as i64);
        }
    }

    #[tokio::test]
    async fn test_parse_failure_is_invalid_params() {
        let config = test_config("http://127.0.0.1:9", &[]);
        let transport = build_transport(&config);

        let reply = transport.round_trip("/", None, b"{not json").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        let value = body_value(&reply);
        assert_eq!(value["error"]["code"], -32602);
        assert!(value["id"].is_null());
    }

    #[tokio::test]
    async fn test_upstream_transport_error_is_internal_envelope() {
        // nothing listens on this port
        let config = test_config("http://127.0.0.1:9", &[]);
        let transport = build_transport(&config);

        let request =
            serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": 1, "method": "m"})).unwrap();
        let reply = transport.round_trip("/", None, &request).await;
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        let value = body_value(&reply);
        assert_eq!(value["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_upstream_garbage_body_is_wrapped_with_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &[]);
        let transport = build_transport(&config);

        let request =
            serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": 1, "method": "m"})).unwrap();
        let reply = transport.round_trip("/", None, &request).await;
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        let value = body_value(&reply);
        assert_eq!(value["error"]["code"], -32603);
        assert_eq!(value["error"]["message"], "boom");
    }

    #[tokio::test]
    async fn test_error_response_passes_through_uncached() {
        let mock_server = MockServer::start().await;

        let error_response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "tipset not found"}
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&error_response))
            .expect(2)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &["test"]);
        let transport = build_transport(&config);

        let request = serde_json::to_vec(
            &json!({"jsonrpc": "2.0", "id": 1, "method": "test", "params": ["a"]}),
        )
        .unwrap();

        // both calls hit upstream because error responses are never cached
        for _ in 0..2 {
            let reply = transport.round_trip("/", None, &request).await;
            assert_eq!(reply.status, StatusCode::OK);
            let value = body_value(&reply);
            assert_eq!(value["error"]["code"], -32000);
        }
    }

    #[tokio::test]
    async fn test_empty_body_uses_path_as_method() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": null, "result": "pong"}),
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri(), &[]);
        let transport = build_transport(&config);

        let reply = transport.round_trip("/rpc/v0", None, b"").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(body_value(&reply)["result"], "pong");
    }
}
