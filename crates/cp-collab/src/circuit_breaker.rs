use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::backpressure::BackpressureCalculator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationReason {
    Backpressure,
    Manual,
    ErrorRate,
    Latency,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub activation_threshold: f64,
    pub deactivation_threshold: f64,
    pub open_duration: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.95,
            deactivation_threshold: 0.85,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub open_count: u64,
    pub last_open_reason: Option<ActivationReason>,
}

impl CircuitBreakerStats {
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rejected_requests as f64 / self.total_requests as f64
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_failures: u32,
    last_open_reason: Option<ActivationReason>,
    forced_open: bool,
}

/// Backpressure-driven circuit breaker with a half-open trial period:
/// closed admits everything, open rejects everything, half-open admits a
/// limited number of trial requests before deciding whether to close or
/// reopen.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    backpressure: RwLock<Option<std::sync::Arc<BackpressureCalculator>>>,
    total_requests: AtomicU64,
    accepted_requests: AtomicU64,
    rejected_requests: AtomicU64,
    open_count: AtomicU64,
    half_open_admitted: AtomicUsize,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                half_open_successes: 0,
                half_open_failures: 0,
                last_open_reason: None,
                forced_open: false,
            }),
            backpressure: RwLock::new(None),
            total_requests: AtomicU64::new(0),
            accepted_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            half_open_admitted: AtomicUsize::new(0),
        }
    }

    pub fn set_backpressure_calculator(&self, calculator: std::sync::Arc<BackpressureCalculator>) {
        *self.backpressure.write() = Some(calculator);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().state == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.inner.lock().state == CircuitState::HalfOpen
    }

    fn backpressure_ratio(&self) -> f64 {
        self.backpressure.read().as_ref().map(|c| c.calculate()).unwrap_or(0.0)
    }

    /// Re-evaluates the state machine against the current backpressure
    /// reading: opens on high backpressure (or a forced-open request),
    /// transitions `Open -> HalfOpen` once `open_duration` has elapsed.
    pub fn check_and_transition(&self) {
        let backpressure = self.backpressure_ratio();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if inner.forced_open || backpressure >= self.config.activation_threshold {
                    self.open_count.fetch_add(1, Ordering::SeqCst);
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.last_open_reason = Some(if inner.forced_open {
                        ActivationReason::Manual
                    } else {
                        ActivationReason::Backpressure
                    });
                }
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if !inner.forced_open && elapsed >= self.config.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_failures = 0;
                    self.half_open_admitted.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Synchronous admission check: closed always admits, open always
    /// rejects, half-open admits up to `half_open_max_requests` trial
    /// requests then rejects further ones.
    pub fn allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.lock().state;
        let allowed = match state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let admitted = self.half_open_admitted.fetch_add(1, Ordering::SeqCst);
                admitted < self.config.half_open_max_requests as usize
            }
        };
        if allowed {
            self.accepted_requests.fetch_add(1, Ordering::SeqCst);
        } else {
            self.rejected_requests.fetch_add(1, Ordering::SeqCst);
        }
        allowed
    }

    /// Counts a success. In `HalfOpen`, closes the circuit once enough
    /// trial successes have landed and backpressure has settled below
    /// `deactivation_threshold`.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.half_open_successes += 1;
        if inner.half_open_successes >= self.config.half_open_max_requests
            && self.backpressure_ratio() <= self.config.deactivation_threshold
        {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.forced_open = false;
        }
    }

    /// Any failure during `HalfOpen` reopens the circuit immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_failures += 1;
            inner.last_open_reason = Some(ActivationReason::ErrorRate);
            self.open_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        if inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.last_open_reason = Some(ActivationReason::Manual);
            self.open_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            total_requests: self.total_requests.load(Ordering::SeqCst),
            accepted_requests: self.accepted_requests.load(Ordering::SeqCst),
            rejected_requests: self.rejected_requests.load(Ordering::SeqCst),
            open_count: self.open_count.load(Ordering::SeqCst),
            last_open_reason: inner.last_open_reason,
        }
    }

    /// Clears every counter and returns to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_successes = 0;
        inner.half_open_failures = 0;
        inner.last_open_reason = None;
        inner.forced_open = false;
        self.total_requests.store(0, Ordering::SeqCst);
        self.accepted_requests.store(0, Ordering::SeqCst);
        self.rejected_requests.store(0, Ordering::SeqCst);
        self.open_count.store(0, Ordering::SeqCst);
        self.half_open_admitted.store(0, Ordering::SeqCst);
    }
}
