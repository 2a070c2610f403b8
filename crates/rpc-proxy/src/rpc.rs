//! JSON-RPC 2.0 envelope types with batch-aware parsing and serialization

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC protocol version emitted on generated envelopes
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid params / parse failure
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
/// Internal error / auth rejection
pub const JSONRPC_INTERNAL: i64 = -32603;

/// A single JSON-RPC 2.0 request.
///
/// `id` and `params` are kept as raw [`Value`]s so that any scalar id and any
/// params shape (array, object, absent) round-trips losslessly. The client
/// address is an out-of-band annotation attached at parse time and never
/// serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Originating client address, derived from proxy headers
    #[serde(skip)]
    pub remote_addr: Option<String>,
    /// Protocol version, normally "2.0"
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id; `Null` when absent
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    /// Method name
    #[serde(default)]
    pub method: String,
    /// Call parameters; `Null` when absent
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    /// Creates a request with the standard protocol version.
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            remote_addr: None,
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A single JSON-RPC 2.0 response.
///
/// The default value (empty `jsonrpc`) doubles as the "not yet filled in"
/// sentinel used while assembling batch replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version; empty marks a blank slot
    #[serde(default)]
    pub jsonrpc: String,
    /// Response id, mirroring the request id
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    /// Call result on success
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    /// Call error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// True for the blank sentinel (no response filled in yet).
    pub fn is_empty(&self) -> bool {
        self.jsonrpc.is_empty()
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional extra payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Detects a batch body: the first byte after leading ASCII whitespace is `[`.
pub fn is_batch(body: &[u8]) -> bool {
    for &c in body {
        if c == 0x20 || c == 0x09 || c == 0x0a || c == 0x0d {
            continue;
        }
        return c == b'[';
    }
    false
}

/// Parses a raw request body into a list of requests.
///
/// A batch decodes as-is; a single object is wrapped into a singleton list.
/// An empty body yields one request whose method is the URL path, so that
/// path-addressed calls still traverse the pipeline.
pub fn parse_requests(body: &[u8], path: &str) -> eyre::Result<Vec<RpcRequest>> {
    let mut requests = if body.is_empty() {
        Vec::new()
    } else if is_batch(body) {
        serde_json::from_slice::<Vec<RpcRequest>>(body)
            .map_err(|e| eyre::eyre!("failed to parse JSON batch request: {e}"))?
    } else {
        let request = serde_json::from_slice::<RpcRequest>(body)
            .map_err(|e| eyre::eyre!("failed to parse JSON request: {e}"))?;
        vec![request]
    };

    if requests.is_empty() {
        requests.push(RpcRequest { method: path.to_string(), ..Default::default() });
    }

    Ok(requests)
}

/// Parses a raw response body into a list of responses.
///
/// An empty body yields an empty list.
pub fn parse_responses(body: &[u8]) -> eyre::Result<Vec<RpcResponse>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if is_batch(body) {
        serde_json::from_slice::<Vec<RpcResponse>>(body)
            .map_err(|e| eyre::eyre!("failed to parse JSON batch response: {e}"))
    } else {
        let response = serde_json::from_slice::<RpcResponse>(body)
            .map_err(|e| eyre::eyre!("failed to parse JSON response: {e}"))?;
        Ok(vec![response])
    }
}

/// Serializes requests preserving wire shape: singleton as a bare object,
/// two or more as an array, none as `null`.
pub fn requests_body(requests: &[RpcRequest]) -> serde_json::Result<Vec<u8>> {
    match requests.len() {
        0 => serde_json::to_vec(&Value::Null),
        1 => serde_json::to_vec(&requests[0]),
        _ => serde_json::to_vec(requests),
    }
}

/// Serializes responses with the same shape rules as [`requests_body`].
pub fn responses_body(responses: &[RpcResponse]) -> serde_json::Result<Vec<u8>> {
    match responses.len() {
        0 => serde_json::to_vec(&Value::Null),
        1 => serde_json::to_vec(&responses[0]),
        _ => serde_json::to_vec(responses),
    }
}

/// Builds a bare JSON-RPC error envelope with an explicit (possibly null) id.
pub fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Envelope returned on parse failures (HTTP 400).
pub fn invalid_request_envelope(message: &str) -> Value {
    error_envelope(Value::Null, JSONRPC_INVALID_PARAMS, message)
}

/// Envelope returned on auth rejection (HTTP 401).
pub fn unauthenticated_envelope() -> Value {
    error_envelope(Value::Null, JSONRPC_INTERNAL, "Unauthorized")
}

/// Envelope wrapping an opaque upstream failure body (HTTP 5xx passthrough).
pub fn internal_error_envelope(message: &str) -> Value {
    error_envelope(Value::Null, JSONRPC_INTERNAL, message)
}

/// Compares two JSON-RPC ids with numeric normalization.
///
/// JSON decoding yields f64 for bare numbers, so `1`, `1.0` and a response
/// echoing the id as an integer must all compare equal. Integral numbers are
/// normalized to i64; everything else falls back to structural equality.
pub fn ids_equal(a: &Value, b: &Value) -> bool {
    match (normalize_id(a), normalize_id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn normalize_id(value: &Value) -> Option<i64> {
    let number = match value {
        Value::Number(n) => n,
        _ => return None,
    };
    if let Some(i) = number.as_i64() {
        return Some(i);
    }
    let f = number.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Returns the indices of blank slots per [`RpcResponse::is_empty`].
pub fn blank_indices(responses: &[RpcResponse]) -> Vec<usize> {
    responses
        .iter()
        .enumerate()
        .filter(|(_, response)| response.is_empty())
        .map(|(idx, _)| idx)
        .collect()
}
