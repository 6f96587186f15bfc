//! Per-provider circuit breaker.
//!
//! Shared by every call worker, so state lives behind a small mutex. After
//! `threshold` consecutive failures the breaker opens and the provider is
//! skipped until the cooldown elapses; the first attempt after that is a
//! trial, and one more failure reopens it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Returns false while the breaker is open.
    pub fn allow(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = self.threshold.saturating_sub(1);
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Counts a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.lock().open_until.is_some_and(|until| now < until)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // Every update leaves the counters consistent, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
