//! Parsing of the `Retry-After` response header.
//!
//! The header carries either delay-seconds or an HTTP-date. It is parsed once into
//! a [`RetryAfter`] value; callers then ask that value how long to wait.

use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// A parsed `Retry-After` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Wait this long (delay-seconds form).
    Seconds(Duration),
    /// Wait until this point in time (HTTP-date form).
    Date(SystemTime),
}

impl RetryAfter {
    /// Extracts and parses the `Retry-After` header, if present and well formed.
    ///
    /// # Examples
    ///
    /// ```
    /// use upcall::retry_after::RetryAfter;
    /// use http::HeaderMap;
    /// use std::time::Duration;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("retry-after", "120".parse().unwrap());
    ///
    /// assert_eq!(
    ///     RetryAfter::from_headers(&headers),
    ///     Some(RetryAfter::Seconds(Duration::from_secs(120)))
    /// );
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
        Self::parse(value)
    }

    /// Parses a raw header value.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        if let Ok(seconds) = value.parse::<u64>() {
            return Some(RetryAfter::Seconds(Duration::from_secs(seconds)));
        }

        httpdate::parse_http_date(value).ok().map(RetryAfter::Date)
    }

    /// Returns how long to wait when measured from `now`.
    ///
    /// A date already in the past yields a zero delay.
    pub fn delay_from(&self, now: SystemTime) -> Duration {
        match self {
            RetryAfter::Seconds(delay) => *delay,
            RetryAfter::Date(at) => at.duration_since(now).unwrap_or(Duration::ZERO),
        }
    }

    /// Returns how long to wait from the current time.
    pub fn delay(&self) -> Duration {
        self.delay_from(SystemTime::now())
    }
}
