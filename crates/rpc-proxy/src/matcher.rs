//! Compiled per-method caching policy and cache key derivation

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::config::{CacheMethod, Config, MethodKind};

/// A (method, params) pair the method refresher turns into a synthetic
/// request.
#[derive(Debug, Clone)]
pub struct SyntheticMethod {
    /// RPC method name
    pub name: String,
    /// Params taken from the policy's `params_for_request`
    pub params: Value,
}

/// Compiled form of one configured [`CacheMethod`].
#[derive(Debug, Clone)]
pub struct MethodPolicy {
    /// Policy kind
    pub kind: MethodKind,
    /// Derive the key from (a projection of) the params
    pub cache_by_params: bool,
    /// Positional selector
    pub params_in_cache_by_id: Vec<usize>,
    /// Named selector, sorted at construction so key generation is
    /// insensitive to configuration order
    pub params_in_cache_by_name: Vec<String>,
    /// Responses are never written to the cache
    pub no_store_cache: bool,
    /// The cache refresher skips this method
    pub no_update_cache: bool,
    /// Synthetic request params for custom methods
    pub params_for_request: Option<Value>,
}

impl MethodPolicy {
    fn from_config(method: &CacheMethod) -> Self {
        let mut params_in_cache_by_name = method.params_in_cache_by_name.clone();
        params_in_cache_by_name.sort();
        Self {
            kind: method.effective_kind(),
            cache_by_params: method.cache_by_params,
            params_in_cache_by_id: method.params_in_cache_by_id.clone(),
            params_in_cache_by_name,
            no_store_cache: method.no_store_cache,
            no_update_cache: method.no_update_cache,
            params_for_request: method.params_for_request.clone(),
        }
    }

    /// Projects the params through the policy's selector.
    ///
    /// Returns the selected values to hash; an empty list means "key is the
    /// bare method name". A params value whose shape does not match the
    /// selector is an error.
    fn select(&self, params: &Value) -> eyre::Result<Vec<Value>> {
        if !self.cache_by_params {
            return Ok(Vec::new());
        }
        if self.params_in_cache_by_id.is_empty() && self.params_in_cache_by_name.is_empty() {
            // cache by the whole params value
            return Ok(vec![params.clone()]);
        }
        if !self.params_in_cache_by_id.is_empty() {
            let items = params.as_array().ok_or_else(|| {
                eyre::eyre!(
                    "cannot project params {params} with positional selector {:?}",
                    self.params_in_cache_by_id
                )
            })?;
            let mut selected = Vec::with_capacity(self.params_in_cache_by_id.len());
            for &idx in &self.params_in_cache_by_id {
                let value = items.get(idx).ok_or_else(|| {
                    eyre::eyre!("positional selector index {idx} out of range for params {params}")
                })?;
                selected.push(value.clone());
            }
            return Ok(selected);
        }
        let fields = params.as_object().ok_or_else(|| {
            eyre::eyre!(
                "cannot project params {params} with named selector {:?}",
                self.params_in_cache_by_name
            )
        })?;
        let selected = self
            .params_in_cache_by_name
            .iter()
            .map(|name| fields.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        Ok(selected)
    }
}

/// Read-only policy table built once at startup.
///
/// Disabled methods are dropped at construction and behave exactly as if
/// they were never configured.
#[derive(Debug, Default)]
pub struct Matcher {
    policies: HashMap<String, MethodPolicy>,
}

impl Matcher {
    /// Compiles the policy table from configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut policies = HashMap::new();
        for method in &config.cache_methods {
            if !method.enabled {
                continue;
            }
            policies.insert(method.name.clone(), MethodPolicy::from_config(method));
        }
        Self { policies }
    }

    /// Looks up the policy for a method.
    pub fn policy(&self, method: &str) -> Option<&MethodPolicy> {
        self.policies.get(method)
    }

    /// Derives the cache key for a (method, params) pair.
    ///
    /// Empty string means "do not cache": unknown method, or a params shape
    /// that does not match the configured selector. With `cache_by_params`
    /// disabled the key is the bare method name; otherwise the selected
    /// values are hashed into `method + "_" + sha256hex`.
    pub fn key(&self, method: &str, params: &Value) -> String {
        let Some(policy) = self.policies.get(method) else {
            return String::new();
        };
        let selected = match policy.select(params) {
            Ok(selected) => selected,
            Err(err) => {
                error!("cannot build cache key for method {method}: {err}");
                return String::new();
            }
        };
        match hash_selected(&selected) {
            Some(digest) => format!("{method}_{digest}"),
            None => method.to_string(),
        }
    }

    /// Synthetic requests for the method refresher: every custom-kind
    /// policy with its `params_for_request`, in stable (sorted) order.
    pub fn methods(&self) -> Vec<SyntheticMethod> {
        let mut methods: Vec<SyntheticMethod> = self
            .policies
            .iter()
            .filter(|(_, policy)| policy.kind == MethodKind::Custom)
            .map(|(name, policy)| SyntheticMethod {
                name: name.clone(),
                params: policy.params_for_request.clone().unwrap_or(Value::Null),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }
}

/// Hashes the selected params into a hex digest; `None` for an empty
/// selection.
///
/// Each value is serialized with serde_json, whose object keys are ordered,
/// so equal projections hash equally regardless of source field order.
fn hash_selected(selected: &[Value]) -> Option<String> {
    if selected.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    for value in selected {
        let encoded = serde_json::to_vec(value).unwrap_or_default();
        hasher.update(&encoded);
    }
    Some(hex::encode(hasher.finalize()))
}
