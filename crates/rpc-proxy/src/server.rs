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

//! HTTP listener binding the transport pipeline to a reverse-proxy route

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eyre::Result;
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{auth, auth::JwtAuth, metrics, rpc, transport::Transport};

/// Response header marking proxied replies
const PROXY_HEADER: (&str, &str) = ("X-rpc-proxy", "rpc-proxy");

/// Shared state threaded through the router.
#[derive(Clone)]
pub struct AppState {
    /// Request-processing pipeline
    pub transport: Arc<Transport>,
    /// Bearer-token verifier
    pub auth: Arc<JwtAuth>,
}

/// Reverse-proxy façade: health, readiness and metrics endpoints stay open,
/// every other path is authenticated and handed to [`Transport`].
pub struct ProxyServer {
    state: AppState,
}

impl ProxyServer {
    /// Creates a server around a transport and a token verifier.
    pub fn new(transport: Arc<Transport>, auth: Arc<JwtAuth>) -> Self {
        Self { state: AppState { transport, auth } }
    }

    /// Builds the axum router.
    pub fn router(&self) -> Router {
        let open = Router::new()
            .route("/healthz", get(healthz))
            .route("/ready", get(ready))
            .route("/metrics", get(metrics_exposition));

        let proxied = Router::new().fallback(rpc_proxy).layer(middleware::from_fn_with_state(
            self.state.clone(),
            auth::require_bearer,
        ));

        open.merge(proxied).layer(TraceLayer::new_for_http()).with_state(self.state.clone())
    }

    /// Binds `addr` and serves until the shutdown signal flips.
    pub async fn serve(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serves on an already-bound listener until the shutdown signal flips.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("rpc proxy listening on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("shutting down http server");
            })
            .await?;
        Ok(())
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn ready() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_exposition() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], metrics::gather())
}

async fn rpc_proxy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let remote = client_ip(&parts.headers, &addr);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            error!("cannot read request body: {err}");
            return (
                StatusCode::BAD_REQUEST,
                Json(rpc::invalid_request_envelope(&err.to_string())),
            )
                .into_response();
        }
    };

    let reply = state.transport.round_trip(parts.uri.path(), Some(remote), &body).await;

    Response::builder()
        .status(reply.status)
        .header(CONTENT_TYPE, "application/json")
        .header(PROXY_HEADER.0, PROXY_HEADER.1)
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Original client IP: `CF-Connecting-IP`, else the first `X-Forwarded-For`
/// entry, else the transport remote address.
fn client_ip(headers: &HeaderMap, remote_addr: &SocketAddr) -> String {
    if let Some(ip) = headers.get("CF-Connecting-IP").and_then(|value| value.to_str().ok()) {
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|value| value.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    remote_addr.ip().to_string()
}
