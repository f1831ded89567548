//! Concurrency limiter with a FIFO wait queue.
//!
//! At most `max_concurrent` slots are handed out. Callers beyond that wait in
//! arrival order; a released slot goes straight to the longest waiter instead
//! of back to the pool, so a late arrival can never overtake the queue.
//!
//! Slots are [`SlotGuard`]s and are released on drop, which covers early
//! returns, `?` and panics. A waiter that gets cancelled after its slot was
//! handed over gives the slot back on drop as well.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::trace;

/// Configuration for the concurrency limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum number of calls in flight at once.
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

impl ConcurrencyConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Bounds the number of simultaneous outbound calls.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max: usize,
    state: Mutex<LimiterState>,
    total_acquired: AtomicU64,
    total_queued: AtomicU64,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            max: config.max_concurrent.max(1),
            state: Mutex::new(LimiterState::default()),
            total_acquired: AtomicU64::new(0),
            total_queued: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> SlotGuard<'_> {
        loop {
            let rx = {
                let mut state = self.lock();
                if state.active < self.max {
                    state.active += 1;
                    self.total_acquired.fetch_add(1, Ordering::Relaxed);
                    return SlotGuard { limiter: self };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                self.total_queued.fetch_add(1, Ordering::Relaxed);
                trace!(queued = state.waiters.len(), "slot_queued");
                rx
            };

            let mut waiter = Waiter {
                rx,
                limiter: self,
                armed: true,
            };
            if (&mut waiter.rx).await.is_ok() {
                waiter.armed = false;
                self.total_acquired.fetch_add(1, Ordering::Relaxed);
                return SlotGuard { limiter: self };
            }
            // Sender vanished without handing over a slot; queue up again.
            waiter.armed = false;
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(next) = state.waiters.pop_front() {
            // Hand the slot over directly; `active` stays the same.
            if next.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Callers waiting for a slot.
    pub fn queued(&self) -> usize {
        self.lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Lifetime count of granted slots.
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    /// Lifetime count of callers that had to wait.
    pub fn total_queued(&self) -> u64 {
        self.total_queued.load(Ordering::Relaxed)
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

/// A held concurrency slot. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

struct Waiter<'a> {
    rx: oneshot::Receiver<()>,
    limiter: &'a ConcurrencyLimiter,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cancelled while queued. If a slot was handed over in the meantime,
        // pass it on instead of leaking it.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.limiter.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_queue(limiter: &ConcurrencyLimiter, expected: usize) {
        for _ in 0..100 {
            if limiter.queued() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {expected}, got {}", limiter.queued());
    }

    #[tokio::test]
    async fn acquires_immediately_under_limit() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(2));
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;
        assert_eq!(limiter.active(), 2);
        assert!(limiter.acquire().now_or_never().is_none());

        drop(a);
        assert_eq!(limiter.active(), 1);
        drop(b);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn excess_callers_queue_and_resume_in_arrival_order() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            ConcurrencyConfig::default().with_max_concurrent(2),
        ));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = limiter.acquire().await;
        let second = limiter.acquire().await;

        let mut handles = Vec::new();
        for id in 0..3 {
            let task_limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = task_limiter.acquire().await;
                order.lock().unwrap().push(id);
                tokio::task::yield_now().await;
            }));
            wait_for_queue(&limiter, id + 1).await;
        }

        assert_eq!(limiter.active(), 2);
        assert_eq!(limiter.queued(), 3);

        drop(first);
        drop(second);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.queued(), 0);
        assert_eq!(limiter.total_queued(), 3);
    }

    #[tokio::test]
    async fn never_exceeds_max_under_load() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            ConcurrencyConfig::default().with_max_concurrent(3),
        ));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _slot = limiter.acquire().await;
                    peak.fetch_max(limiter.active(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.total_acquired(), 12);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_a_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            ConcurrencyConfig::default().with_max_concurrent(1),
        ));
        let held = limiter.acquire().await;

        let waiting = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _slot = limiter.acquire().await;
            })
        };
        wait_for_queue(&limiter, 1).await;
        waiting.abort();
        let _ = waiting.await;

        drop(held);
        assert_eq!(limiter.active(), 0);
        assert!(limiter.acquire().now_or_never().is_some());
    }

    #[tokio::test]
    async fn waiter_dropped_after_handoff_passes_the_slot_on() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(1));
        let held = limiter.acquire().await;

        let mut waiting = Box::pin(limiter.acquire());
        assert!(futures::poll!(waiting.as_mut()).is_pending());
        assert_eq!(limiter.queued(), 1);

        // The slot is handed to the waiter, which never gets polled again.
        drop(held);
        assert_eq!(limiter.active(), 1);
        assert_eq!(limiter.queued(), 0);

        drop(waiting);
        assert_eq!(limiter.active(), 0);
        assert!(limiter.acquire().now_or_never().is_some());
    }

    #[tokio::test]
    async fn handoff_skips_a_cancelled_waiter_for_the_next_in_line() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(1));
        let held = limiter.acquire().await;

        let mut first = Box::pin(limiter.acquire());
        let mut second = Box::pin(limiter.acquire());
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());

        drop(held);
        drop(first);
        let _slot = second.await;
        assert_eq!(limiter.active(), 1);
    }

    #[tokio::test]
    async fn slot_released_on_error_path() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(1));

        async fn failing(limiter: &ConcurrencyLimiter) -> Result<(), &'static str> {
            let _slot = limiter.acquire().await;
            if limiter.active() == 1 {
                return Err("boom");
            }
            Ok(())
        }

        assert!(failing(&limiter).await.is_err());
        assert_eq!(limiter.active(), 0);
    }
}
