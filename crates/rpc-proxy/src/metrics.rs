//! Prometheus counters and gauges for the proxy pipeline

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

static PROXY_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("requests", "The total number of processed proxy requests").namespace("proxy"),
    )
    .expect("valid counter opts")
});

static PROXY_REQUESTS_CACHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("requests_cached", "The total number of cached proxy requests")
            .namespace("proxy"),
    )
    .expect("valid counter opts")
});

static PROXY_REQUESTS_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("requests_error", "The total number of failed proxy requests")
            .namespace("proxy"),
    )
    .expect("valid counter opts")
});

static PROXY_REQUEST_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("request_duration", "The proxy request duration in milliseconds")
            .namespace("proxy")
            .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
    )
    .expect("valid histogram opts")
});

static CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(Opts::new("size", "The number of cached entries").namespace("cache"))
        .expect("valid gauge opts")
});

/// Registers every proxy metric with the default registry.
///
/// Safe to call more than once; duplicate registrations are ignored so tests
/// can set up freely.
pub fn register() {
    let registry: &Registry = prometheus::default_registry();
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(PROXY_REQUESTS.clone()),
        Box::new(PROXY_REQUESTS_CACHED.clone()),
        Box::new(PROXY_REQUESTS_ERROR.clone()),
        Box::new(PROXY_REQUEST_DURATION.clone()),
        Box::new(CACHE_SIZE.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            match e {
                prometheus::Error::AlreadyReg => {}
                other => warn!("cannot register metric: {other}"),
            }
        }
    }
}

/// Counts one incoming proxy request.
pub fn inc_requests() {
    PROXY_REQUESTS.inc();
}

/// Counts one failed proxy request.
pub fn inc_request_errors() {
    PROXY_REQUESTS_ERROR.inc();
}

/// Counts sub-requests served from the cache.
pub fn add_cached_requests(n: u64) {
    PROXY_REQUESTS_CACHED.inc_by(n);
}

/// Records the wall-clock duration of an upstream round trip.
pub fn observe_request_duration_ms(millis: f64) {
    PROXY_REQUEST_DURATION.observe(millis);
}

/// Publishes the current number of cached entries.
pub fn set_cache_size(len: usize) {
    CACHE_SIZE.set(len as i64);
}

/// Renders the default registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register();
        register();
    }

    #[test]
    fn test_counters_and_exposition() {
        register();

        inc_requests();
        inc_request_errors();
        add_cached_requests(3);
        observe_request_duration_ms(12.5);
        set_cache_size(7);

        let exposition = gather();
        assert!(exposition.contains("proxy_requests"));
        assert!(exposition.contains("proxy_requests_cached"));
        assert!(exposition.contains("proxy_requests_error"));
        assert!(exposition.contains("proxy_request_duration"));
        assert!(exposition.contains("cache_size"));
    }
}
