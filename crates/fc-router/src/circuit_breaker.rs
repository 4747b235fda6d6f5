//! Per-target circuit breakers.
//!
//! One breaker per mediation target URL, shared by every pool worker that
//! delivers to it. Consecutive failures trip the breaker; after the cooldown a
//! single trial request is let through and its result closes or re-opens it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Successful trial requests needed in half-open to close again
    pub success_threshold: u32,
    /// Time spent open before a trial request is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Admission decision for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the single half-open trial request
    Trial,
    Rejected,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.trial_in_flight = true;
                    info!(target_url = %self.name, "Circuit breaker half-open, probing");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::HalfOpen => Admission::Rejected,
        };

        if admission == Admission::Rejected {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                info!(target_url = %self.name, "Circuit breaker closed");
            }
        }
    }

    /// Record a failure. Returns `true` if this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        target_url = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(target_url = %self.name, "Trial request failed, circuit breaker re-opened");
                false
            }
            CircuitState::Open => false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

/// Lazily created breakers keyed by mediation target
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    pub fn state(&self, target: &str) -> Option<CircuitState> {
        self.breakers.get(target).map(|b| b.state())
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state() != CircuitState::Closed)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "http://target",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                success_threshold: 1,
                reset_timeout: reset,
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit(), Admission::Rejected);
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[test]
    fn test_success_resets_failure_run() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Rejected);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.admit(), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one trial request at a time
        assert_eq!(cb.admit(), Admission::Rejected);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(), Admission::Allowed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.admit(), Admission::Trial);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit(), Admission::Rejected);
    }

    #[test]
    fn test_registry_isolates_targets() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get_or_create("http://a").record_failure();

        assert_eq!(registry.state("http://a"), Some(CircuitState::Open));
        assert_eq!(registry.get_or_create("http://b").admit(), Admission::Allowed);
        assert_eq!(registry.open_count(), 1);
        assert!(Arc::ptr_eq(
            &registry.get_or_create("http://a"),
            &registry.get_or_create("http://a")
        ));
    }
}
