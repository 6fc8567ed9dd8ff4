//! Per-service circuit breaker.
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[recovery_timeout since last failure]-----> HalfOpen
//! HalfOpen --[half_open_max_calls successes]-----------> Closed
//! HalfOpen --[any failure]------------------------------> Open
//! ```
//!
//! Trial slots held by calls that never settle are handed back when the call
//! is dropped, and a half-open window that sees no verdict for a full
//! `recovery_timeout` re-arms its unsettled slots.
//!
//! State lives in atomics. Each field is read and written independently, so
//! interleaved callers may briefly observe a mix of old and new values; the
//! breaker only sheds load and never guards correctness.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::error::ClientError;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through.
    Closed,
    /// Requests fail fast without touching the network.
    Open,
    /// A bounded number of trial requests are let through.
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    ///
    /// Default: 5
    pub failure_threshold: u32,

    /// Time since the last failure before probing again.
    ///
    /// Default: 30 seconds
    pub recovery_timeout: Duration,

    /// Trial requests admitted while half-open; this many successes close
    /// the circuit.
    ///
    /// Default: 3
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Point-in-time view of a breaker, for logs and health reporting.
/// How a request got past [`CircuitBreaker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is closed.
    Pass,
    /// One of the half-open trial slots; settle it or give it back.
    Trial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    /// Milliseconds since `epoch` at the most recent failure.
    last_failure_ms: AtomicU64,
    /// Milliseconds since `epoch` when the current trial window opened.
    half_open_since_ms: AtomicU64,
    half_open_admitted: AtomicU32,
    half_open_successes: AtomicU32,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            half_open_since_ms: AtomicU64::new(0),
            half_open_admitted: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            half_open_successes: self.half_open_successes.load(Ordering::Acquire),
        }
    }

    /// Ask permission to issue a request.
    ///
    /// Returns [`ClientError::CircuitOpen`] while open, or while half-open
    /// once every trial slot is taken.
    pub fn try_acquire(&self) -> Result<(), ClientError> {
        self.acquire().map(|_| ())
    }

    /// Like [`try_acquire`](Self::try_acquire), reporting whether a trial
    /// slot was taken.
    pub fn acquire(&self) -> Result<Admission, ClientError> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Pass),
            CircuitState::Open => {
                if self.since_last_failure() < self.config.recovery_timeout {
                    return Err(self.rejection());
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.half_open_since_ms.store(self.elapsed_ms(), Ordering::Release);
                    self.half_open_admitted.store(0, Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Release);
                    tracing::info!(service = %self.service, "circuit half-open, probing");
                }
                self.admit_trial()
            }
            CircuitState::HalfOpen => self.admit_trial(),
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_max_calls {
                    self.close();
                    tracing::info!(service = %self.service, successes, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.last_failure_ms.store(self.elapsed_ms(), Ordering::Release);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.state.store(OPEN, Ordering::Release);
                    tracing::warn!(
                        service = %self.service,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count.fetch_add(1, Ordering::AcqRel);
                self.state.store(OPEN, Ordering::Release);
                tracing::warn!(service = %self.service, "trial failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Return a trial slot whose call ended without a verdict.
    pub fn release_trial(&self) {
        if self.state() != CircuitState::HalfOpen {
            return;
        }
        let released = self
            .half_open_admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            tracing::debug!(service = %self.service, "unsettled trial released");
        }
    }

    /// Force the breaker back to a pristine closed state.
    pub fn reset(&self) {
        self.close();
    }

    fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.half_open_admitted.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
    }

    fn admit_trial(&self) -> Result<Admission, ClientError> {
        if self.take_trial_slot() {
            return Ok(Admission::Trial);
        }
        if self.rearm_stale_window() && self.take_trial_slot() {
            return Ok(Admission::Trial);
        }
        Err(self.rejection())
    }

    fn take_trial_slot(&self) -> bool {
        let admitted = self.half_open_admitted.fetch_add(1, Ordering::AcqRel);
        if admitted < self.config.half_open_max_calls {
            true
        } else {
            self.half_open_admitted.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Reclaim slots of trials that never reported back. Slots spent on
    /// recorded successes stay spent.
    fn rearm_stale_window(&self) -> bool {
        let since = self.half_open_since_ms.load(Ordering::Acquire);
        let now = self.elapsed_ms();
        if Duration::from_millis(now.saturating_sub(since)) < self.config.recovery_timeout {
            return false;
        }
        if self
            .half_open_since_ms
            .compare_exchange(since, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let settled = self.half_open_successes.load(Ordering::Acquire);
        self.half_open_admitted.store(settled, Ordering::Release);
        tracing::warn!(service = %self.service, settled, "half-open trials never settled, re-arming");
        true
    }

    fn rejection(&self) -> ClientError {
        ClientError::CircuitOpen {
            service: self.service.clone(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn since_last_failure(&self) -> Duration {
        let last = self.last_failure_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}
