//! Start-intent circuit breaker
//!
//! Closed -> Open on consecutive failures, Open -> HalfOpen after the reset
//! timeout, HalfOpen -> Closed after consecutive successes. State lives in
//! atomics; there is no lock to hold across anything.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Millis since `epoch` when the breaker last opened
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: AtomicU32::new(BreakerState::Closed.as_u8() as u32),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire) as u8)
    }

    fn set_state(&self, state: BreakerState) {
        self.state.store(state.as_u8() as u32, Ordering::Release);
    }

    /// Whether a start intent may proceed. Handles the Open -> HalfOpen
    /// transition once the reset timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed_ms = self.epoch.elapsed().as_millis() as u64 - opened;
                if elapsed_ms >= self.config.reset_timeout.as_millis() as u64 {
                    // only one caller wins the transition
                    if self
                        .state
                        .compare_exchange(
                            BreakerState::Open.as_u8() as u32,
                            BreakerState::HalfOpen.as_u8() as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.consecutive_successes.store(0, Ordering::Release);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == BreakerState::HalfOpen {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.set_state(BreakerState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.state();
        if state == BreakerState::HalfOpen || failures >= self.config.failure_threshold {
            self.opened_at_ms
                .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
            self.set_state(BreakerState::Open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker(60_000);
        assert!(cb.allow_request());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_closes_after_successes_and_reopens_on_failure() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);

        // reset timeout of zero lets the next request probe immediately
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);

        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
