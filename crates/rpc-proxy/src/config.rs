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

//! YAML configuration loading, defaulting and validation

use std::{fs, path::Path};

use base64::Engine;
use eyre::{bail, Result, WrapErr};
use serde::Deserialize;
use serde_json::Value;

const SUPPORTED_JWT_ALGS: &[&str] = &["HS256", "HS384", "HS512"];

/// Per-method caching policy as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheMethod {
    /// RPC method name
    pub name: String,
    /// Policy kind; inferred from `params_for_request` when omitted
    #[serde(default)]
    pub kind: Option<MethodKind>,
    /// Whether the method participates in caching at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Derive the cache key from (a projection of) the params
    #[serde(default)]
    pub cache_by_params: bool,
    /// Positional selector: indices into an array params value
    #[serde(default)]
    pub params_in_cache_by_id: Vec<usize>,
    /// Named selector: field names of an object params value
    #[serde(default)]
    pub params_in_cache_by_name: Vec<String>,
    /// Never write responses of this method to the cache
    #[serde(default)]
    pub no_store_cache: bool,
    /// Skip this method in the cache refresher
    #[serde(default)]
    pub no_update_cache: bool,
    /// Params of the synthetic request issued by the method refresher
    #[serde(default)]
    pub params_for_request: Option<Value>,
}

impl CacheMethod {
    /// Effective policy kind: explicit, else inferred from
    /// `params_for_request` presence.
    pub fn effective_kind(&self) -> MethodKind {
        match self.kind {
            Some(kind) => kind,
            None if self.params_for_request.is_some() => MethodKind::Custom,
            None => MethodKind::Regular,
        }
    }
}

/// Method policy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    /// Cached on the client path only
    Regular,
    /// Additionally prewarmed by the method refresher
    Custom,
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStorage {
    /// In-process map
    #[default]
    Memory,
    /// Remote key-value store
    Redis,
}

/// Remote store settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisSettings {
    /// Connection URI, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default)]
    pub uri: String,
}

/// Cache store settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Entry lifetime in seconds; 0 means entries never expire
    #[serde(default)]
    pub expiration: i64,
    /// Sweep period for expired entries in seconds; -1 disables sweeping
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: i64,
    /// Backend selection
    #[serde(default)]
    pub storage: CacheStorage,
    /// Redis backend settings
    #[serde(default)]
    pub redis: RedisSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expiration: 0,
            cleanup_interval: default_cleanup_interval(),
            storage: CacheStorage::Memory,
            redis: RedisSettings::default(),
        }
    }
}

/// Proxy configuration, loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream JSON-RPC endpoint
    pub proxy_url: String,
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HMAC secret as plain text
    #[serde(default)]
    pub jwt_secret: String,
    /// HMAC secret, base64-encoded
    #[serde(default)]
    pub jwt_secret_base64: String,
    /// HMAC algorithm
    #[serde(default = "default_jwt_alg")]
    pub jwt_alg: String,
    /// Permissions claimed by operator-issued tokens
    #[serde(default = "default_jwt_permissions")]
    pub jwt_permissions: Vec<String>,

    /// Method refresher period in seconds
    #[serde(default = "default_update_custom_cache_period")]
    pub update_custom_cache_period: u64,
    /// Cache refresher period in seconds
    #[serde(default = "default_update_user_cache_period")]
    pub update_user_cache_period: u64,
    /// Requests per batch issued by the cache refresher
    #[serde(default = "default_requests_batch_size")]
    pub requests_batch_size: usize,
    /// Concurrent batches issued by the cache refresher
    #[serde(default = "default_requests_concurrency")]
    pub requests_concurrency: usize,
    /// Seconds to wait for the refresh loops on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Log proxied request bodies
    #[serde(default)]
    pub debug_http_request: bool,
    /// Log proxied response bodies
    #[serde(default)]
    pub debug_http_response: bool,

    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Human-readable multi-line log output
    #[serde(default)]
    pub log_pretty_print: bool,
    /// Force debug verbosity
    #[serde(default)]
    pub debug: bool,

    /// Cache store settings
    #[serde(default)]
    pub cache_settings: CacheSettings,
    /// Per-method caching policies
    #[serde(default)]
    pub cache_methods: Vec<CacheMethod>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read config file: {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).wrap_err("cannot parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.proxy_url.is_empty() {
            bail!("proxy_url is required");
        }
        reqwest::Url::parse(&self.proxy_url)
            .wrap_err_with(|| format!("invalid proxy_url: {}", self.proxy_url))?;

        if self.jwt_secret.is_empty() && self.jwt_secret_base64.is_empty() {
            bail!("one of jwt_secret or jwt_secret_base64 is required");
        }
        self.secret_bytes()?;

        if !SUPPORTED_JWT_ALGS.contains(&self.jwt_alg.as_str()) {
            bail!("unsupported jwt_alg: {} (expected one of {:?})", self.jwt_alg, SUPPORTED_JWT_ALGS);
        }

        if self.cache_settings.storage == CacheStorage::Redis
            && self.cache_settings.redis.uri.is_empty()
        {
            bail!("cache_settings.redis.uri is required for redis storage");
        }

        for method in &self.cache_methods {
            if method.name.is_empty() {
                bail!("cache_methods entries require a name");
            }
            if !method.params_in_cache_by_id.is_empty()
                && !method.params_in_cache_by_name.is_empty()
            {
                bail!(
                    "method {}: params_in_cache_by_id and params_in_cache_by_name are mutually exclusive",
                    method.name
                );
            }
            match method.effective_kind() {
                MethodKind::Custom if method.params_for_request.is_none() => {
                    bail!("method {}: custom kind requires params_for_request", method.name);
                }
                MethodKind::Regular if method.params_for_request.is_some() => {
                    bail!("method {}: params_for_request is only valid for custom kind", method.name);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Decoded HMAC secret, preferring the base64 form when both are set.
    pub fn secret_bytes(&self) -> Result<Vec<u8>> {
        if !self.jwt_secret_base64.is_empty() {
            return base64::engine::general_purpose::STANDARD
                .decode(&self.jwt_secret_base64)
                .wrap_err("jwt_secret_base64 is not valid base64");
        }
        Ok(self.jwt_secret.as_bytes().to_vec())
    }

}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_jwt_alg() -> String {
    "HS256".to_string()
}

fn default_jwt_permissions() -> Vec<String> {
    vec!["read".to_string()]
}

fn default_update_custom_cache_period() -> u64 {
    600
}

fn default_update_user_cache_period() -> u64 {
    3600
}

fn default_requests_batch_size() -> usize {
    5
}

fn default_requests_concurrency() -> usize {
    10
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cleanup_interval() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
proxy_url: http://node.example.com/rpc/v0
jwt_secret: secret
"#
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.jwt_alg, "HS256");
        assert_eq!(config.jwt_permissions, vec!["read".to_string()]);
        assert_eq!(config.update_custom_cache_period, 600);
        assert_eq!(config.update_user_cache_period, 3600);
        assert_eq!(config.requests_batch_size, 5);
        assert_eq!(config.requests_concurrency, 10);
        assert_eq!(config.shutdown_timeout, 15);
        assert_eq!(config.cache_settings.expiration, 0);
        assert_eq!(config.cache_settings.cleanup_interval, -1);
        assert_eq!(config.cache_settings.storage, CacheStorage::Memory);
        assert!(config.cache_methods.is_empty());
    }

    #[test]
    fn test_methods_and_selectors() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_methods:
  - name: Filecoin.ChainGetTipSetByHeight
    cache_by_params: true
    params_in_cache_by_id: [0]
  - name: Filecoin.StateMinerInfo
    cache_by_params: true
    params_in_cache_by_name: [miner, tipset]
  - name: Filecoin.ChainHead
    kind: custom
    cache_by_params: true
    params_for_request: []
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.cache_methods.len(), 3);
        assert_eq!(config.cache_methods[0].effective_kind(), MethodKind::Regular);
        assert_eq!(config.cache_methods[2].effective_kind(), MethodKind::Custom);
        assert!(config.cache_methods[0].enabled);
    }

    #[test]
    fn test_kind_inferred_from_params_for_request() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_methods:
  - name: m
    cache_by_params: true
    params_for_request: ["1", "2"]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.cache_methods[0].effective_kind(), MethodKind::Custom);
    }

    #[test]
    fn test_requires_secret() {
        let yaml = "proxy_url: http://node.example.com\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("jwt_secret"));
    }

    #[test]
    fn test_requires_proxy_url() {
        let yaml = "jwt_secret: secret\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_base64_secret() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret_base64: c2VjcmV0
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.secret_bytes().unwrap(), b"secret");
    }

    #[test]
    fn test_rejects_bad_base64_secret() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret_base64: "%%%"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_both_selectors() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_methods:
  - name: m
    cache_by_params: true
    params_in_cache_by_id: [0]
    params_in_cache_by_name: [a]
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_rejects_custom_without_params() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_methods:
  - name: m
    kind: custom
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_regular_with_params_for_request() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_methods:
  - name: m
    kind: regular
    params_for_request: []
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_redis_storage_requires_uri() {
        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_settings:
  storage: redis
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
proxy_url: http://node.example.com
jwt_secret: secret
cache_settings:
  storage: redis
  redis:
    uri: redis://127.0.0.1:6379/0
"#;
        assert!(Config::from_yaml(yaml).is_ok());
    }

}
