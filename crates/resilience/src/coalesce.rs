//! Request coalescing (single-flight).
//!
//! Concurrent calls with the same key share one execution and all observe the
//! same outcome, success or failure. The shared future is driven by its own
//! task, so it finishes and cleans up even if every caller goes away.
//!
//! An entry is removed as soon as its operation settles. Entries older than
//! `horizon` are treated as dead: a lookup replaces them and
//! [`RequestCoalescer::sweep`] drops them, so an operation that never resolves
//! can't pin its key forever.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for request coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Maximum age of an in-flight entry before it is considered leaked.
    #[serde(with = "crate::serde_millis")]
    pub horizon: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(30),
        }
    }
}

impl CoalesceConfig {
    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }
}

struct InFlight<T> {
    id: u64,
    started_at: Instant,
    outcome: Shared<BoxFuture<'static, T>>,
}

/// Deduplicates identical in-flight operations.
pub struct RequestCoalescer<T> {
    config: CoalesceConfig,
    in_flight: Arc<DashMap<String, InFlight<T>>>,
    next_id: AtomicU64,
    joined: AtomicU64,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `operation` under `key`, or join the identical call already in
    /// flight. The flag is `true` when this caller joined someone else's call.
    pub async fn run<F>(&self, key: impl Into<String>, operation: F) -> (T, bool)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let horizon = self.config.horizon;

        let (outcome, joined) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at.elapsed() < horizon {
                    (occupied.get().outcome.clone(), true)
                } else {
                    warn!(key = %key, "coalesce_stale_entry_replaced");
                    let flight = self.launch(key.clone(), operation);
                    let outcome = flight.outcome.clone();
                    occupied.insert(flight);
                    (outcome, false)
                }
            }
            Entry::Vacant(vacant) => {
                let flight = self.launch(key.clone(), operation);
                let outcome = flight.outcome.clone();
                vacant.insert(flight);
                (outcome, false)
            }
        };

        if joined {
            self.joined.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "coalesce_joined");
        }
        (outcome.await, joined)
    }

    fn launch<F>(&self, key: String, operation: F) -> InFlight<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let in_flight = Arc::clone(&self.in_flight);
        let outcome = async move {
            let value = operation.await;
            in_flight.remove_if(&key, |_, flight| flight.id == id);
            value
        }
        .boxed()
        .shared();

        // Detached driver: the call completes and unregisters without callers.
        tokio::spawn(outcome.clone());

        InFlight {
            id,
            started_at: Instant::now(),
            outcome,
        }
    }

    /// Drop entries older than the horizon. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let horizon = self.config.horizon;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, flight| flight.started_at.elapsed() < horizon);
        let removed = before.saturating_sub(self.in_flight.len());
        if removed > 0 {
            warn!(removed, "coalesce_swept_stale_entries");
        }
        removed
    }

    /// Number of distinct keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Lifetime count of callers that joined an existing call.
    pub fn total_joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Sweep every `horizon` on the current runtime until the coalescer is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let coalescer = Arc::downgrade(self);
        let period = self.config.horizon;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(coalescer) = coalescer.upgrade() else {
                    break;
                };
                coalescer.sweep();
            }
        })
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CoalesceConfig::default())
    }
}
