//! Patron resilience primitives
//!
//! Every outbound call the Patron client makes goes through some combination
//! of the pieces in this crate. None of them know about HTTP; the `api` crate
//! composes them around a transport.
//!
//! - **[`TtlCache`]** - bounded, TTL-based store for successful reads. Evicts
//!   in insertion order, never serves stale entries.
//! - **[`Debouncer`]** - collapses bursts of keyed calls (search-as-you-type)
//!   into one execution of the last one.
//! - **[`CircuitBreaker`]** - closed / open / half-open breaker with a single
//!   trial call and a background sweep.
//! - **[`ConcurrencyLimiter`]** - caps simultaneous calls, queues the rest FIFO.
//!   Slots are RAII guards so release can't be forgotten on error paths.
//! - **[`RetryPolicy`]** - exponential backoff driven by a [`Retryable`]
//!   classifier on the error type.
//! - **[`RequestCoalescer`]** - identical in-flight calls share one outcome.
//!
//! ## Threading notes
//!
//! Everything here is `Send + Sync` and safe on a multi-threaded tokio
//! runtime. Internal state sits behind `std::sync::Mutex` or `DashMap` and no
//! lock is ever held across an `.await`.
//!
//! ## Quick example
//!
//! ```no_run
//! use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryPolicy, Retryable};
//!
//! #[derive(Debug, Clone)]
//! struct Flaky;
//!
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("flaky upstream")
//!     }
//! }
//!
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!     let policy = RetryPolicy::new(RetryConfig::default());
//!
//!     let Some(permit) = breaker.try_acquire() else {
//!         return;
//!     };
//!     let outcome = policy
//!         .execute_guarded(&breaker, permit, |_attempt| async { Ok::<_, Flaky>("pong") })
//!         .await;
//!     assert_eq!(outcome.into_result().unwrap(), "pong");
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod coalesce;
pub mod debounce;
pub mod limiter;
pub mod retry;
pub mod serde_millis;

pub use crate::cache::{CacheConfig, CacheStats, TtlCache};
pub use crate::circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit,
};
pub use crate::coalesce::{CoalesceConfig, RequestCoalescer};
pub use crate::debounce::{Debouncer, Superseded};
pub use crate::limiter::{ConcurrencyConfig, ConcurrencyLimiter, SlotGuard};
pub use crate::retry::{is_retryable_status, RetryConfig, RetryOutcome, RetryPolicy, Retryable};
