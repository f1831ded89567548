//! Keyed debouncing for search-as-you-type.
//!
//! `schedule` parks the caller for the quiet period. A newer `schedule` for
//! the same key cancels the pending one before it runs; only the last call in
//! a burst executes its operation. Superseded callers get [`Superseded`] back
//! and their closures are dropped unexecuted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

/// Returned to a caller whose pending invocation was replaced or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("debounced call superseded by a newer one")]
pub struct Superseded;

struct Pending {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Delays keyed operations until their key has been quiet for a while.
#[derive(Default)]
pub struct Debouncer {
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `operation` once `delay` passes without another `schedule` for `key`.
    pub async fn schedule<F, Fut, T>(
        &self,
        key: impl Into<String>,
        delay: Duration,
        operation: F,
    ) -> Result<T, Superseded>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, mut cancelled) = oneshot::channel();

        if let Some(previous) = self.lock().insert(key.clone(), Pending { id, cancel }) {
            trace!(key = %key, "debounce_superseded");
            let _ = previous.cancel.send(());
        }

        let slot = PendingSlot {
            debouncer: self,
            key: &key,
            id,
        };

        tokio::select! {
            biased;
            _ = &mut cancelled => return Err(Superseded),
            _ = tokio::time::sleep(delay) => {}
        }

        drop(slot);
        trace!(key = %key, "debounce_fired");
        Ok(operation().await)
    }

    /// Cancel the pending invocation for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Cancel every pending invocation.
    pub fn cancel_all(&self) {
        self.lock().clear();
    }

    /// Keys with an invocation waiting for its quiet period.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

/// Clears this caller's entry on fire or drop, unless a newer call replaced it.
struct PendingSlot<'a> {
    debouncer: &'a Debouncer,
    key: &'a str,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut pending = self.debouncer.lock();
        if pending.get(self.key).is_some_and(|entry| entry.id == self.id) {
            pending.remove(self.key);
        }
    }
}
