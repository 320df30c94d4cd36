//! Retry policy for rate-limited and failing calls.
//!
//! The policy is decided per response from the HTTP method and the status code:
//!
//! | Response | Idempotent method (GET, HEAD, OPTIONS) | Other methods |
//! |---|---|---|
//! | 429 | up to 3 retries | up to 3 retries |
//! | 5xx | 1 retry | no retry |
//! | anything else | no retry | no retry |
//!
//! Rate-limit retries honor `Retry-After` and otherwise back off exponentially.
//! Server-error retries wait a fixed delay.

use crate::retry_after::RetryAfter;
use http::{HeaderMap, Method, StatusCode};
use rand::Rng;
use std::time::{Duration, SystemTime};

/// Returns `true` for methods that are safe to repeat: GET, HEAD, OPTIONS.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Exponential backoff with optional jitter.
///
/// # Examples
///
/// ```
/// use upcall::retry::Backoff;
/// use std::time::Duration;
///
/// // 100ms, 200ms, 400ms, 800ms...
/// let backoff = Backoff {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(30),
///     jitter: false,
/// };
/// assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The delay before the first retry.
    pub initial_delay: Duration,
    /// The maximum delay between retries.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Returns the delay before the given retry (1-indexed, so 1 = first retry).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        // initial_delay * 2^(attempt - 1)
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1) as u32);
        let base_delay = self
            .initial_delay
            .saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));
        let delay = base_delay.min(self.max_delay);

        if self.jitter {
            // random value between 50% and 100% of the delay
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }
}

/// Limits and delays applied by the retry loop.
///
/// # Examples
///
/// ```
/// use upcall::retry::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     rate_limit_backoff: Backoff {
///         initial_delay: Duration::from_millis(250),
///         ..Default::default()
///     },
///     server_error_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// assert_eq!(policy.max_rate_limit_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed for 429 responses, for any method.
    pub max_rate_limit_retries: usize,
    /// Retries allowed for 5xx responses to idempotent methods.
    pub max_server_error_retries: usize,
    /// Backoff for 429 responses without a usable `Retry-After`.
    pub rate_limit_backoff: Backoff,
    /// Fixed delay before retrying a 5xx response.
    pub server_error_delay: Duration,
    /// Upper bound on any wait requested through `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 3,
            max_server_error_retries: 1,
            rate_limit_backoff: Backoff::default(),
            server_error_delay: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

/// Per-call retry bookkeeping. Never shared between calls.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far (1 after the first send).
    pub attempt: usize,
    pub method: Method,
    pub idempotent: bool,
    rate_limit_retries: usize,
    server_error_retries: usize,
}

impl RetryContext {
    pub fn new(method: Method) -> Self {
        Self {
            attempt: 0,
            idempotent: is_idempotent(&method),
            method,
            rate_limit_retries: 0,
            server_error_retries: 0,
        }
    }
}

/// Why a response is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 429 with a `Retry-After` header.
    RetryAfter,
    /// 429 without a usable `Retry-After` header.
    RateLimited,
    /// 5xx on an idempotent method.
    ServerError,
}

/// Outcome of consulting the policy about one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again after `delay`.
    Retry { delay: Duration, reason: RetryReason },
    /// Hand this response back to the caller.
    Stop,
}

impl RetryPolicy {
    /// Decides what to do with a response, consuming retry budget on `Retry`.
    pub fn decide(
        &self,
        retry: &mut RetryContext,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> RetryDecision {
        self.decide_at(retry, status, headers, SystemTime::now())
    }

    /// Like [`decide`](Self::decide), measuring `Retry-After` dates from `now`.
    pub fn decide_at(
        &self,
        retry: &mut RetryContext,
        status: StatusCode,
        headers: &HeaderMap,
        now: SystemTime,
    ) -> RetryDecision {
        if status == StatusCode::TOO_MANY_REQUESTS {
            if retry.rate_limit_retries >= self.max_rate_limit_retries {
                return RetryDecision::Stop;
            }
            retry.rate_limit_retries += 1;

            return match RetryAfter::from_headers(headers) {
                Some(retry_after) => RetryDecision::Retry {
                    delay: retry_after.delay_from(now).min(self.max_retry_after),
                    reason: RetryReason::RetryAfter,
                },
                None => RetryDecision::Retry {
                    delay: self
                        .rate_limit_backoff
                        .delay_for_attempt(retry.rate_limit_retries),
                    reason: RetryReason::RateLimited,
                },
            };
        }

        if status.is_server_error()
            && retry.idempotent
            && retry.server_error_retries < self.max_server_error_retries
        {
            retry.server_error_retries += 1;
            return RetryDecision::Retry {
                delay: self.server_error_delay,
                reason: RetryReason::ServerError,
            };
        }

        RetryDecision::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            rate_limit_backoff: Backoff {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                jitter: false,
            },
            server_error_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let backoff = policy().rate_limit_backoff;

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::PATCH));
        assert!(!is_idempotent(&Method::DELETE));
    }

    #[test]
    fn test_server_error_retried_once_for_idempotent_methods() {
        let policy = policy();
        let headers = HeaderMap::new();

        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let mut retry = RetryContext::new(method);
            assert_eq!(
                policy.decide(&mut retry, StatusCode::BAD_GATEWAY, &headers),
                RetryDecision::Retry {
                    delay: Duration::from_millis(50),
                    reason: RetryReason::ServerError,
                }
            );
            assert_eq!(
                policy.decide(&mut retry, StatusCode::BAD_GATEWAY, &headers),
                RetryDecision::Stop
            );
        }
    }

    #[test]
    fn test_server_error_never_retried_for_mutating_methods() {
        let policy = policy();
        let headers = HeaderMap::new();

        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let mut retry = RetryContext::new(method);
            assert_eq!(
                policy.decide(&mut retry, StatusCode::INTERNAL_SERVER_ERROR, &headers),
                RetryDecision::Stop
            );
        }
    }

    #[test]
    fn test_rate_limit_retried_three_times_for_any_method() {
        let policy = policy();
        let headers = HeaderMap::new();
        let mut retry = RetryContext::new(Method::POST);

        let delays: Vec<_> = (0..3)
            .map(|_| policy.decide(&mut retry, StatusCode::TOO_MANY_REQUESTS, &headers))
            .collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::Retry {
                    delay: Duration::from_millis(100),
                    reason: RetryReason::RateLimited
                },
                RetryDecision::Retry {
                    delay: Duration::from_millis(200),
                    reason: RetryReason::RateLimited
                },
                RetryDecision::Retry {
                    delay: Duration::from_millis(400),
                    reason: RetryReason::RateLimited
                },
            ]
        );
        assert_eq!(
            policy.decide(&mut retry, StatusCode::TOO_MANY_REQUESTS, &headers),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_retry_after_seconds_and_date() {
        let policy = policy();
        let now = SystemTime::now();

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        let mut retry = RetryContext::new(Method::GET);
        assert_eq!(
            policy.decide_at(&mut retry, StatusCode::TOO_MANY_REQUESTS, &headers, now),
            RetryDecision::Retry {
                delay: Duration::from_secs(7),
                reason: RetryReason::RetryAfter,
            }
        );

        let at = now + Duration::from_secs(20);
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_str(&httpdate::fmt_http_date(at)).unwrap(),
        );
        match policy.decide_at(&mut retry, StatusCode::TOO_MANY_REQUESTS, &headers, now) {
            RetryDecision::Retry { delay, reason } => {
                assert_eq!(reason, RetryReason::RetryAfter);
                // HTTP dates have whole-second precision
                assert!(delay >= Duration::from_secs(19) && delay <= Duration::from_secs(20));
            }
            RetryDecision::Stop => panic!("Expected a retry"),
        }
    }

    #[test]
    fn test_retry_after_capped() {
        let policy = RetryPolicy {
            max_retry_after: Duration::from_secs(2),
            ..policy()
        };
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("600"));
        let mut retry = RetryContext::new(Method::GET);

        assert_eq!(
            policy.decide(&mut retry, StatusCode::TOO_MANY_REQUESTS, &headers),
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                reason: RetryReason::RetryAfter,
            }
        );
    }

    #[test]
    fn test_budgets_are_independent() {
        // 500, 429, 429 on a GET are all retried
        let policy = policy();
        let headers = HeaderMap::new();
        let mut retry = RetryContext::new(Method::GET);

        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(
                policy.decide(&mut retry, status, &headers),
                RetryDecision::Retry { .. }
            ));
        }
        assert_eq!(
            policy.decide(&mut retry, StatusCode::OK, &headers),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_success_and_client_errors_not_retried() {
        let policy = policy();
        let headers = HeaderMap::new();
        let mut retry = RetryContext::new(Method::GET);

        for status in [
            StatusCode::OK,
            StatusCode::CREATED,
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
        ] {
            assert_eq!(policy.decide(&mut retry, status, &headers), RetryDecision::Stop);
        }
    }
}
