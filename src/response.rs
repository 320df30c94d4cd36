//! Responses handed back to callers.
//!
//! [`RawResponse`] is what the executor returns: the final HTTP response of a call,
//! whatever its status, after the retry policy has run. [`Response`] wraps a
//! decoded 2xx body together with the same metadata.

use crate::{ApiError, Error, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// The final response of a logical call.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code of the last attempt.
    pub status: StatusCode,

    /// The response headers of the last attempt.
    pub headers: HeaderMap,

    /// The response body of the last attempt.
    pub body: Bytes,

    /// Total latency across all attempts and retry waits.
    pub latency: Duration,

    /// Number of attempts made, 1 when no retry happened.
    pub attempts: usize,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `true` if the call required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            tracing::error!(
                error = %e,
                status = self.status.as_u16(),
                "Failed to deserialize response"
            );
            Error::DeserializationFailed {
                raw_response: self.text(),
                serde_error: e.to_string(),
                status: self.status,
            }
        })
    }

    /// Decodes the body as an API error body.
    pub fn api_error(&self) -> ApiError {
        ApiError::from_body(self.status, &self.body)
    }

    /// Turns a non-2xx response into [`Error::Api`].
    ///
    /// # Examples
    ///
    /// ```
    /// use upcall::{Error, RawResponse};
    /// use http::{HeaderMap, StatusCode};
    /// use std::time::Duration;
    ///
    /// let response = RawResponse {
    ///     status: StatusCode::NOT_FOUND,
    ///     headers: HeaderMap::new(),
    ///     body: r#"{"code":"not_found","message":"no such transfer"}"#.into(),
    ///     latency: Duration::from_millis(40),
    ///     attempts: 1,
    /// };
    ///
    /// match response.error_for_status() {
    ///     Err(Error::Api { status, error }) => {
    ///         assert_eq!(status, StatusCode::NOT_FOUND);
    ///         assert_eq!(error.code, "not_found");
    ///     }
    ///     other => panic!("unexpected: {:?}", other),
    /// }
    /// ```
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(Error::Api {
            status: self.status,
            error: Box::new(self.api_error()),
        })
    }

    /// Decodes a 2xx body into a [`Response`], or returns [`Error::Api`].
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Response<T>> {
        let raw = self.error_for_status()?;
        let data = raw.json()?;
        Ok(Response {
            data,
            raw_body: raw.text(),
            status: raw.status,
            headers: raw.headers,
            latency: raw.latency,
            attempts: raw.attempts,
        })
    }
}

/// A decoded successful response.
///
/// # Examples
///
/// ```no_run
/// use upcall::{Client, Context};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Balance {
///     currency: String,
///     available_amount: f64,
/// }
///
/// # async fn example(client: Client) -> Result<(), upcall::Error> {
/// let ctx = Context::new();
/// let response = client.get::<Vec<Balance>>(&ctx, "/api/v1/balances/current").await?;
///
/// println!("{} balances in {:?}", response.data.len(), response.latency);
/// if response.was_retried() {
///     println!("needed {} attempts", response.attempts);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The raw response body as a string.
    pub raw_body: String,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The total latency of the call, including all retry attempts.
    pub latency: Duration,

    /// The number of attempts made to complete this call.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Maps the response data to a different type, keeping the metadata.
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the call required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: StatusCode, body: &'static str, attempts: usize) -> RawResponse {
        RawResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            latency: Duration::from_millis(5),
            attempts,
        }
    }

    #[test]
    fn test_into_typed_success() {
        let response = raw(StatusCode::OK, r#"{"id":"t_1"}"#, 2)
            .into_typed::<serde_json::Value>()
            .unwrap();
        assert_eq!(response.data["id"], "t_1");
        assert!(response.was_retried());
        assert_eq!(response.map(|v| v["id"].clone()).data, "t_1");
    }

    #[test]
    fn test_into_typed_bad_json() {
        let result = raw(StatusCode::OK, "not json", 1).into_typed::<serde_json::Value>();
        match result {
            Err(Error::DeserializationFailed {
                raw_response,
                status,
                ..
            }) => {
                assert_eq!(raw_response, "not json");
                assert_eq!(status, StatusCode::OK);
            }
            other => panic!("Expected DeserializationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_into_typed_error_status() {
        let result = raw(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"code":"too_many_requests","message":"slow down"}"#,
            4,
        )
        .into_typed::<serde_json::Value>();
        match result {
            Err(Error::Api { status, error }) => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(error.message, "slow down");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }
}
