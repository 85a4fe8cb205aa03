//! Resilient HTTP plumbing shared by every downstream client: a per-service
//! circuit breaker plus a retry wrapper over `reqwest`.
//!
//! The retry policy sits outside the breaker: 4xx responses are returned as-is,
//! 5xx and network failures are retried with exponential backoff, and an open
//! breaker short-circuits the whole attempt loop with a distinct error.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

mod client;

pub use client::{ResilientClient, RetryPolicy};

#[derive(Debug, Error)]
pub enum HttpError {
    /// The breaker is open; the request was never sent. Not retried within
    /// the same call.
    #[error("circuit open for {service}, retry in {retry_in_ms}ms")]
    CircuitOpen { service: String, retry_in_ms: u64 },

    /// Non-success status. 4xx surfaces immediately; 5xx only after the
    /// retry budget is exhausted.
    #[error("{service} returned HTTP {status}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("request to {service} timed out")]
    Timeout { service: String },

    #[error("network error calling {service}: {message}")]
    Network { service: String, message: String },
}

impl HttpError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker with the classic three states.
///
/// - CLOSED → OPEN after `failure_threshold` consecutive failures
/// - OPEN → HALF-OPEN once `reset_timeout` has elapsed
/// - HALF-OPEN → CLOSED after `success_threshold` consecutive successes
/// - HALF-OPEN → OPEN on any failure
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        service: &str,
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Gate a request. `Err` carries the remaining cooldown; an elapsed
    /// cooldown flips the breaker to half-open and lets one probe through.
    pub fn check(&self) -> Result<(), HttpError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    debug!(service = %self.service, "circuit half-open, probing");
                    Ok(())
                } else {
                    let retry_in = self.reset_timeout - elapsed;
                    Err(HttpError::CircuitOpen {
                        service: self.service.clone(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    debug!(service = %self.service, "circuit closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                warn!(service = %self.service, "probe failed, circuit re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("case-service", 5, 2, Duration::from_millis(reset_ms))
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker(60_000);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(matches!(cb.check(), Err(HttpError::CircuitOpen { .. })));
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(60_000);
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_then_closes_on_successes() {
        let cb = breaker(10);
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let cb = breaker(10);
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.check().is_err());
    }
}
