//! The single path every backend call takes.
//!
//! For one logical call the executor:
//!
//! 1. asks the circuit breaker for a permit (open breaker: [`ApiError::CircuitOpen`]),
//! 2. serves fresh cache entries for cache-eligible reads,
//! 3. joins an identical call already in flight,
//! 4. otherwise takes a concurrency slot and runs the transport under the
//!    retry policy, each attempt bounded by the request timeout,
//! 5. on 401 refreshes the credential once and re-issues the call,
//! 6. releases the slot, updates cache and breaker, and returns.
//!
//! Steps 4-6 run inside the coalesced future, so they happen once per network
//! execution no matter how many callers share it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use resilience::{
    BreakerSnapshot, CacheStats, CircuitBreaker, CircuitState, ConcurrencyLimiter, Debouncer,
    Permit, RequestCoalescer, RetryPolicy, TtlCache,
};

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::request::{ApiRequest, CachePolicy};
use crate::token::{CredentialStore, TokenManager};
use crate::transport::Transport;

/// Snapshot of every moving part, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorStats {
    pub cache: CacheStats,
    pub circuit: BreakerSnapshot,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub in_flight: usize,
    pub coalesced_total: u64,
    pub network_calls: u64,
    pub token_refreshes: u64,
}

struct Inner {
    config: ApiConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
    cache: Arc<TtlCache<Value>>,
    breaker: Arc<CircuitBreaker>,
    limiter: ConcurrencyLimiter,
    retry: RetryPolicy,
    coalescer: Arc<RequestCoalescer<ApiResult<Value>>>,
    debouncer: Debouncer,
    network_calls: AtomicU64,
}

/// Composes cache, coalescer, limiter, retry, breaker and credential refresh
/// around a [`Transport`].
pub struct RequestExecutor {
    inner: Arc<Inner>,
    sweepers: Vec<JoinHandle<()>>,
}

impl RequestExecutor {
    /// Build the executor. When called inside a tokio runtime the breaker,
    /// coalescer and cache sweepers are started; they stop when the executor drops.
    pub fn new(
        config: ApiConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let tokens = Arc::new(
            TokenManager::new(Arc::clone(&transport), store, config.refresh_path.clone())
                .with_request_timeout(config.request_timeout),
        );
        let inner = Arc::new(Inner {
            transport,
            tokens,
            cache: Arc::new(TtlCache::new(config.cache)),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker)),
            limiter: ConcurrencyLimiter::new(config.concurrency),
            retry: RetryPolicy::new(config.retry),
            coalescer: Arc::new(RequestCoalescer::new(config.coalesce)),
            debouncer: Debouncer::new(),
            network_calls: AtomicU64::new(0),
            config,
        });

        let sweepers = if tokio::runtime::Handle::try_current().is_ok() {
            vec![
                inner.breaker.spawn_sweeper(),
                inner.coalescer.spawn_sweeper(),
                inner.cache.spawn_pruner(),
            ]
        } else {
            debug!("executor_built_without_runtime_sweepers_disabled");
            Vec::new()
        };

        Self { inner, sweepers }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.inner.tokens
    }

    /// Run one logical call and return the envelope's `data`.
    pub async fn execute(&self, request: ApiRequest, policy: CachePolicy) -> ApiResult<Value> {
        let inner = &self.inner;
        let Some(permit) = inner.breaker.try_acquire() else {
            debug!(path = %request.path, "request_rejected_circuit_open");
            return Err(ApiError::CircuitOpen);
        };

        if let CachePolicy::Read { .. } = policy {
            if request.method.is_read() {
                if let Some(value) = inner.cache.get(&request.path_and_query()) {
                    inner.breaker.release_trial(permit);
                    debug!(path = %request.path, "request_served_from_cache");
                    return Ok(value);
                }
            }
        }

        let key = request.coalesce_key();
        let operation = Arc::clone(inner).perform(request, policy, permit);
        let (result, joined) = inner.coalescer.run(key, operation).await;
        if joined {
            inner.breaker.release_trial(permit);
        }
        result
    }

    /// [`execute`](Self::execute) and decode the payload.
    pub async fn execute_as<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        policy: CachePolicy,
    ) -> ApiResult<T> {
        let value = self.execute(request, policy).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Wait out `delay` of quiet on `key`, then execute. Callers replaced by a
    /// newer call on the same key get [`ApiError::Superseded`].
    pub async fn execute_debounced(
        &self,
        key: &str,
        delay: Duration,
        request: ApiRequest,
        policy: CachePolicy,
    ) -> ApiResult<Value> {
        self.inner
            .debouncer
            .schedule(key, delay, move || self.execute(request, policy))
            .await?
    }

    /// Drop cached reads whose key contains `pattern`, or everything for `None`.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        self.inner.cache.invalidate(pattern)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn reset_circuit_breaker(&self) {
        self.inner.breaker.reset();
    }

    pub fn cache_size(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn active_requests(&self) -> usize {
        self.inner.limiter.active()
    }

    pub fn queued_requests(&self) -> usize {
        self.inner.limiter.queued()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.current_state()
    }

    pub fn stats(&self) -> ExecutorStats {
        let inner = &self.inner;
        ExecutorStats {
            cache: inner.cache.stats(),
            circuit: inner.breaker.snapshot(),
            active_requests: inner.limiter.active(),
            queued_requests: inner.limiter.queued(),
            in_flight: inner.coalescer.in_flight(),
            coalesced_total: inner.coalescer.total_joined(),
            network_calls: inner.network_calls.load(Ordering::Relaxed),
            token_refreshes: inner.tokens.refresh_count(),
        }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
    }
}

impl Inner {
    /// One network execution: slot, retries, refresh, then bookkeeping. The
    /// outcome reaches the breaker under the permit of the caller that started it.
    async fn perform(
        self: Arc<Self>,
        request: ApiRequest,
        policy: CachePolicy,
        permit: Permit,
    ) -> ApiResult<Value> {
        let result = {
            let _slot = self.limiter.acquire().await;
            self.send_authorized(&request).await
        };

        match &result {
            Ok(_) => self.breaker.record_success(permit),
            Err(err) => {
                warn!(error = %err, kind = err.kind(), method = %request.method, path = %request.path, "request_failed");
                self.breaker.record_failure(permit);
            }
        }

        let cache_key = request.path_and_query();
        match (&result, policy) {
            (Ok(value), CachePolicy::Read { ttl }) if request.method.is_read() => {
                self.cache.set(cache_key, value.clone(), ttl);
            }
            (Ok(_), CachePolicy::Invalidate(namespaces)) => {
                let removed: usize = namespaces
                    .iter()
                    .map(|namespace| self.cache.invalidate(Some(namespace)))
                    .sum();
                debug!(removed, path = %request.path, "cache_invalidated_after_mutation");
            }
            (Err(_), _) => {
                // A failed call never leaves its endpoint addressable in the cache.
                self.cache.remove(&cache_key);
            }
            _ => {}
        }

        result
    }

    /// Send with the current credential; on 401 refresh once and re-issue.
    async fn send_authorized(&self, request: &ApiRequest) -> ApiResult<Value> {
        let token = if request.authenticated {
            self.tokens.current_token()
        } else {
            None
        };

        match self.send_with_retry(request, token.as_deref()).await {
            Err(err) if err.is_unauthorized() && request.authenticated => {
                match self.tokens.refresh_if_stale(token.as_deref()).await {
                    Ok(fresh) => {
                        info!(path = %request.path, "request_reissued_after_refresh");
                        self.send_with_retry(request, Some(&fresh)).await
                    }
                    Err(refresh_err) => {
                        warn!(error = %refresh_err, path = %request.path, "credential_refresh_unavailable");
                        Err(err)
                    }
                }
            }
            other => other,
        }
    }

    async fn send_with_retry(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value> {
        let timeout = self.config.request_timeout;
        self.retry
            .execute(|_attempt| {
                self.network_calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    match tokio::time::timeout(timeout, self.transport.send(request, token)).await {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::Timeout(format!(
                            "no response within {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
            })
            .await
            .into_result()
    }
}
