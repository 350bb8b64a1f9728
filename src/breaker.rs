//! Circuit breaker gating primary store writes
//!
//! Three states:
//! - Closed: writes pass through; consecutive failures are counted
//! - Open: writes fail fast until the cooldown elapses
//! - HalfOpen: exactly one probe write is admitted; its outcome decides
//!   between Closed and another Open period
//!
//! `allow()` may transition Open to HalfOpen on read once the cooldown has
//! elapsed. All operations are synchronous and callable from any task.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time to wait in Open before admitting a half-open probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    /// Set while the single HalfOpen probe is outstanding
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Check whether a primary write may be issued right now.
    ///
    /// In Open, a read after the cooldown transitions to HalfOpen and admits
    /// the caller as the single probe. In HalfOpen, only one caller is
    /// admitted until a record call settles the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful primary write: close the circuit and zero the
    /// failure counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    /// Record a failed primary write.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            State::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen => {
                // The probe failed: reopen for another cooldown
                inner.state = State::Open {
                    opened_at: Instant::now(),
                };
                inner.probe_in_flight = false;
            }
            State::Open { .. } => {
                // Late failure from a call admitted before the open; the
                // circuit is already protecting the store
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock().unwrap().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen => CircuitState::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn test_closed_to_open_on_threshold() {
        let breaker = breaker(3, Duration::from_secs(30));

        for _ in 0..2 {
            assert!(breaker.allow());
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[test]
    fn test_open_fast_fails() {
        let breaker = breaker(1, Duration::from_secs(30));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        // Two fresh failures do not reach the threshold again
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));

        // First read after cooldown becomes the probe
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Concurrent callers are rejected while the probe is outstanding
        assert!(!breaker.allow());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        // A fresh cooldown applies
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow());
    }

    #[test]
    fn test_scenario_three_failures_cooldown_probe() {
        // Threshold 3, short cooldown standing in for 30 s
        let breaker = breaker(3, Duration::from_millis(50));

        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Within the cooldown: rejected without any store call
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(60));

        // One probe is admitted; success restores normal service
        assert!(breaker.allow());
        assert!(!breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
        assert!(breaker.allow());
    }

    #[test]
    fn test_concurrent_record_calls() {
        use std::sync::Arc;

        let breaker = Arc::new(breaker(100_000, Duration::from_secs(30)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        b.allow();
                        b.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(breaker.failure_count(), 8_000);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
