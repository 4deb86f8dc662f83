//! A circuit breaker guarding one class of outbound operations.
//!
//! `Closed --threshold consecutive failures--> Open --cooldown--> HalfOpen
//! --one success--> Closed` (one failure in `HalfOpen` reopens).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Seconds since the breaker opened, when open.
    pub open_for: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Gate one execution. `Open` refuses until the cooldown has elapsed, at
    /// which point the breaker moves to `HalfOpen` and lets a probe through.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    tracing::info!(breaker = self.name, "circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => Self::open(&mut inner, self.name, "probe failed"),
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    Self::open(&mut inner, self.name, "failure threshold reached");
                }
            },
            BreakerState::Open => {},
        }
    }

    /// Operator override: open immediately.
    pub fn trip(&self, reason: &str) {
        let mut inner = self.inner.lock();
        Self::open(&mut inner, self.name, reason);
    }

    /// Operator override: close and forget failure history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        tracing::info!(breaker = self.name, "circuit breaker reset");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn open(inner: &mut BreakerInner, name: &str, reason: &str) {
        if inner.state != BreakerState::Open {
            tracing::warn!(breaker = name, reason, "circuit breaker open");
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.to_string(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: match inner.state {
                BreakerState::Open => inner.opened_at.map(|at| at.elapsed().as_secs()),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_closes_on_success_and_reopens_on_failure() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown of zero: the next acquire becomes the probe.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.try_acquire());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn trip_and_reset_are_immediate() {
        let breaker = CircuitBreaker::new("test", 100, Duration::from_secs(600));
        breaker.trip("operator request");
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }
}
