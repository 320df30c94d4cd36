//! Consecutive-failure circuit breaker.
//!
//! ```text
//! Closed ──[threshold consecutive server failures]──> Open
//!   ▲                                                  │
//!   └────────[any success, or cooldown elapsed]────────┘
//! ```
//!
//! There is no half-open probe: once the cooldown has elapsed the failure count is
//! reset and the next call is treated like any other.

use crate::{Error, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Configuration for the circuit breaker.
///
/// # Examples
///
/// ```
/// use upcall::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig {
///     cooldown: Duration::from_secs(60),
///     ..Default::default()
/// };
/// assert_eq!(config.failure_threshold, 5);
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive server failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure.
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

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

/// Tracks consecutive upstream failures and short-circuits calls while the
/// dependency looks down.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a 5xx response or server-side transport failure.
    pub fn record_failure(&self) {
        let mut state = self.state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        if state.consecutive_failures == self.config.failure_threshold {
            tracing::warn!(
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis(),
                "Circuit breaker opened"
            );
        }
    }

    /// Records a response that proves the dependency is reachable.
    pub fn record_success(&self) {
        let mut state = self.state();
        if state.consecutive_failures > 0 {
            tracing::debug!(
                consecutive_failures = state.consecutive_failures,
                "Circuit breaker reset after success"
            );
        }
        state.consecutive_failures = 0;
    }

    /// Returns `true` while the breaker is rejecting calls.
    ///
    /// Resets the failure count as a side effect once the cooldown has elapsed.
    pub fn is_open(&self) -> bool {
        self.remaining_cooldown().is_some()
    }

    /// Returns [`Error::CircuitOpen`] while the breaker is open.
    pub fn check(&self) -> Result<()> {
        match self.remaining_cooldown() {
            Some(retry_in) => Err(Error::CircuitOpen {
                consecutive_failures: self.consecutive_failures(),
                retry_in,
            }),
            None => Ok(()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state().consecutive_failures
    }

    fn remaining_cooldown(&self) -> Option<Duration> {
        let mut state = self.state();
        if state.consecutive_failures < self.config.failure_threshold {
            return None;
        }

        let elapsed = state
            .last_failure_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed < self.config.cooldown {
            return Some(self.config.cooldown - elapsed);
        }

        tracing::info!(
            consecutive_failures = state.consecutive_failures,
            "Circuit breaker cooldown elapsed, allowing calls"
        );
        state.consecutive_failures = 0;
        None
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
