//! Circuit breaker for the client's outbound calls.
//!
//! One breaker guards the whole client, not one per endpoint. After
//! `failure_threshold` consecutive failures it opens and rejects calls without
//! touching the network. Once `reset_timeout` has passed, exactly one trial
//! call is let through (half-open); its outcome decides whether the breaker
//! closes again or re-opens for another cooldown.
//!
//! A background sweep ([`CircuitBreaker::spawn_sweeper`]) flips an expired
//! open breaker to half-open on its own, so the state reported to diagnostics
//! is accurate even when nobody is calling.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
    /// Period of the background open -> half-open sweep.
    #[serde(with = "crate::serde_millis")]
    pub sweep_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests are allowed.
    Closed,
    /// Requests are rejected until the cooldown elapses.
    Open,
    /// One trial request decides the next state.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Permission handed out by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker is closed.
    Normal,
    /// This caller owns the single half-open trial.
    Trial,
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the breaker last opened, if it is not closed.
    pub open_for: Option<Duration>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn cooldown_elapsed(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.opened_at
            .map(|opened| now.duration_since(opened) >= reset_timeout)
            .unwrap_or(true)
    }
}

/// Circuit breaker shared by every call a client makes.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejection_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::closed()),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejection_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask for permission to make a call. `None` means the circuit is open.
    pub fn try_acquire(&self) -> Option<Permit> {
        let now = Instant::now();
        let mut inner = self.lock();

        let permit = match inner.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open => {
                if inner.cooldown_elapsed(now, self.config.reset_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("circuit_half_open");
                    Some(Permit::Trial)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Permit::Trial)
                }
            }
        };

        if permit.is_none() {
            self.rejection_count.fetch_add(1, Ordering::Relaxed);
            debug!(state = %inner.state, "circuit_rejected");
        }
        permit
    }

    /// Hand back a trial permit whose holder never reached the network.
    pub fn release_trial(&self, permit: Permit) {
        if permit != Permit::Trial {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Record a successful call admitted under `permit`.
    ///
    /// Only the trial decides a half-open breaker. Calls admitted with a
    /// normal permit before the circuit opened only move the counters.
    pub fn record_success(&self, permit: Permit) {
        self.success_count.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        match (inner.state, permit) {
            (CircuitState::HalfOpen, Permit::Trial) => {
                *inner = BreakerState::closed();
                info!("circuit_closed");
            }
            (CircuitState::Closed, _) => inner.consecutive_failures = 0,
            _ => debug!(state = %inner.state, "circuit_straggler_success"),
        }
    }

    /// Record a failed call admitted under `permit`.
    pub fn record_failure(&self, permit: Permit) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match (inner.state, permit) {
            (CircuitState::Closed, _) => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open(now);
                    warn!(
                        failures = inner.consecutive_failures,
                        cooldown_ms = self.config.reset_timeout.as_millis() as u64,
                        "circuit_opened"
                    );
                }
            }
            (CircuitState::HalfOpen, Permit::Trial) => {
                inner.open(now);
                warn!("circuit_reopened");
            }
            _ => debug!(state = %inner.state, "circuit_straggler_failure"),
        }
    }

    /// Flip an open breaker whose cooldown elapsed to half-open.
    /// Returns whether a transition happened.
    pub fn sweep(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.state == CircuitState::Open
            && inner.cooldown_elapsed(now, self.config.reset_timeout)
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!("circuit_half_open");
            true
        } else {
            false
        }
    }

    /// Force the breaker closed with zero failures.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
        info!("circuit_reset");
    }

    pub fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner.opened_at.map(|opened| now.duration_since(opened)),
            total_successes: self.success_count.load(Ordering::Relaxed),
            total_failures: self.failure_count.load(Ordering::Relaxed),
            total_rejections: self.rejection_count.load(Ordering::Relaxed),
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` on the current tokio
    /// runtime. The task ends once the breaker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let breaker = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(breaker) = breaker.upgrade() else {
                    break;
                };
                breaker.sweep();
            }
        })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
