use resilience::{
    CacheConfig, CircuitBreakerConfig, CoalesceConfig, ConcurrencyConfig, RetryConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the executor and client need, with production defaults.
///
/// # Example
/// ```
/// use api::ApiConfig;
/// use std::time::Duration;
///
/// let cfg = ApiConfig::default()
///     .with_base_url("https://patron.example/api")
///     .with_request_timeout(Duration::from_secs(10));
/// assert_eq!(cfg.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend root; request paths are appended to it.
    pub base_url: String,
    /// Endpoint that exchanges a refresh token for a new pair.
    pub refresh_path: String,
    /// Hard deadline for a single network attempt.
    #[serde(with = "resilience::serde_millis")]
    pub request_timeout: Duration,
    /// Quiet period before a search-as-you-type query is sent.
    #[serde(with = "resilience::serde_millis")]
    pub search_debounce: Duration,
    /// TTL for fast-changing reads (messages, notifications).
    #[serde(with = "resilience::serde_millis")]
    pub volatile_ttl: Duration,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub coalesce: CoalesceConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001/api".into(),
            refresh_path: "/auth/refresh".into(),
            request_timeout: Duration::from_secs(30),
            search_debounce: Duration::from_millis(300),
            volatile_ttl: Duration::from_secs(60),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            coalesce: CoalesceConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_search_debounce(mut self, delay: Duration) -> Self {
        self.search_debounce = delay;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_coalesce(mut self, coalesce: CoalesceConfig) -> Self {
        self.coalesce = coalesce;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ApiConfig::default();
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.search_debounce, Duration::from_millis(300));
        assert_eq!(cfg.cache.max_entries, 100);
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.concurrency.max_concurrent, 10);
        assert_eq!(cfg.coalesce.horizon, Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let cfg: ApiConfig = serde_json::from_value(json!({
            "base_url": "https://patron.example/api",
            "request_timeout": 5000
        }))
        .unwrap();
        assert_eq!(cfg.base_url, "https://patron.example/api");
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.refresh_path, "/auth/refresh");
        assert_eq!(cfg.retry, RetryConfig::default());
    }
}
