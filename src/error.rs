//! Error types for calls made through the client core.
//!
//! Every failure a caller can observe is a variant of [`Error`]. The variants keep
//! upstream failures (HTTP status plus decoded [`ApiError`]) apart from failures the
//! core produces itself (an open circuit breaker, a cancelled context, a failed
//! token refresh), so callers can react to each differently.

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The main error type for calls made through [`Client`](crate::Client).
///
/// # Examples
///
/// ```no_run
/// use upcall::{Client, Context, Error};
///
/// # async fn example(client: Client) -> Result<(), Error> {
/// let ctx = Context::new();
/// match client.get::<serde_json::Value>(&ctx, "/api/v1/balances/current").await {
///     Ok(response) => println!("Balances: {:?}", response.data),
///     Err(Error::CircuitOpen { retry_in, .. }) => {
///         eprintln!("API looks down, try again in {:?}", retry_in);
///     }
///     Err(Error::Api { status, error }) => {
///         eprintln!("API error {}: {} ({})", status, error.message, error.code);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A transport-level error occurred (connection refused, DNS, TLS, timeout).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Obtaining a bearer token failed. Always fatal to the current call.
    #[error("authentication failed: {method} {url}{}: {message}", fmt_status(.status))]
    Authentication {
        /// Method used against the login endpoint.
        method: Method,
        /// Login endpoint URL.
        url: String,
        /// Status returned by the login endpoint, when one was received.
        status: Option<StatusCode>,
        /// What went wrong.
        message: String,
    },

    /// The circuit breaker is open; no request was sent.
    #[error("circuit breaker open after {consecutive_failures} consecutive failures, retry in {retry_in:?}")]
    CircuitOpen {
        /// Consecutive server failures that tripped the breaker.
        consecutive_failures: u32,
        /// Time left until the cooldown elapses.
        retry_in: Duration,
    },

    /// The API answered with a non-2xx status after the retry policy finished.
    #[error("API error {status}: {error}")]
    Api {
        /// The final HTTP status code.
        status: StatusCode,
        /// The decoded error body.
        error: Box<ApiError>,
    },

    /// Failed to deserialize a successful response body into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// The call's context was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The call's context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn fmt_status(status: &Option<StatusCode>) -> String {
    match status {
        Some(status) => format!(" (status {})", status.as_u16()),
        None => String::new(),
    }
}

impl Error {
    /// Returns the HTTP status code if this error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::Authentication { status, .. } => *status,
            Error::Network(e) => e.status(),
            _ => None,
        }
    }

    /// Returns the decoded API error body, if this is an [`Error::Api`].
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    /// Returns `true` if the call was rejected by an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// Returns `true` if the call ended because its context was cancelled or timed out.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// A specialized `Result` type for calls made through the client core.
pub type Result<T> = std::result::Result<T, Error>;

/// Error body returned by the API.
///
/// Only `code` and `message` are guaranteed. Field-level validation problems may
/// arrive either in `errors` or nested under `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// A single field-level validation error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The `details` member of an error body: free text or a list of field errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetails {
    Text(String),
    Errors {
        #[serde(default)]
        errors: Vec<FieldError>,
    },
}

impl ApiError {
    /// Decodes an error body, falling back to the status reason and raw text when
    /// the body is not a JSON error object.
    ///
    /// # Examples
    ///
    /// ```
    /// use upcall::ApiError;
    /// use http::StatusCode;
    ///
    /// let body = br#"{"code":"validation_error","message":"bad amount","source":"amount"}"#;
    /// let error = ApiError::from_body(StatusCode::BAD_REQUEST, body);
    /// assert_eq!(error.code, "validation_error");
    /// assert_eq!(error.source.as_deref(), Some("amount"));
    ///
    /// let error = ApiError::from_body(StatusCode::BAD_GATEWAY, b"upstream timeout");
    /// assert_eq!(error.code, "Bad Gateway");
    /// assert_eq!(error.message, "upstream timeout");
    /// ```
    pub fn from_body(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ApiError>(body) {
            Ok(error) if !error.code.is_empty() || !error.message.is_empty() => error,
            _ => ApiError {
                code: status
                    .canonical_reason()
                    .unwrap_or("unknown_error")
                    .to_string(),
                message: String::from_utf8_lossy(body).trim().to_string(),
                ..Default::default()
            },
        }
    }

    /// Returns every field-level error, whether it came in `errors` or `details`.
    pub fn field_errors(&self) -> impl Iterator<Item = &FieldError> {
        let nested: &[FieldError] = match &self.details {
            Some(ErrorDetails::Errors { errors }) => errors.as_slice(),
            _ => &[],
        };
        self.errors.iter().chain(nested.iter())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code.is_empty(), self.message.is_empty()) {
            (false, false) => write!(f, "{}: {}", self.code, self.message)?,
            (false, true) => write!(f, "{}", self.code)?,
            _ => write!(f, "{}", self.message)?,
        }
        if let Some(source) = &self.source {
            write!(f, " (source: {})", source)?;
        }
        if let Some(ErrorDetails::Text(text)) = &self.details {
            write!(f, " - {}", text)?;
        }
        for field in self.field_errors() {
            write!(
                f,
                "; {}: {}",
                field.source.as_deref().unwrap_or("-"),
                field
                    .message
                    .as_deref()
                    .or(field.code.as_deref())
                    .unwrap_or("invalid")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_with_field_errors() {
        let body = br#"{
            "code": "validation_error",
            "message": "request is invalid",
            "errors": [{"source": "amount", "code": "invalid_argument", "message": "must be positive"}]
        }"#;
        let error = ApiError::from_body(StatusCode::BAD_REQUEST, body);

        assert_eq!(error.errors.len(), 1);
        assert_eq!(
            error.to_string(),
            "validation_error: request is invalid; amount: must be positive"
        );
    }

    #[test]
    fn test_api_error_details_variants() {
        let text = br#"{"code":"conflict","message":"duplicate","details":"already exists"}"#;
        let error = ApiError::from_body(StatusCode::CONFLICT, text);
        assert_eq!(
            error.details,
            Some(ErrorDetails::Text("already exists".to_string()))
        );
        assert_eq!(error.field_errors().count(), 0);

        let nested = br#"{"code":"validation_error","message":"bad","details":{"errors":[{"source":"currency","message":"unsupported"}]}}"#;
        let error = ApiError::from_body(StatusCode::BAD_REQUEST, nested);
        let fields: Vec<_> = error.field_errors().collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].source.as_deref(), Some("currency"));
    }

    #[test]
    fn test_api_error_falls_back_on_non_json() {
        let error = ApiError::from_body(StatusCode::SERVICE_UNAVAILABLE, b"<html>down</html>");
        assert_eq!(error.code, "Service Unavailable");
        assert_eq!(error.message, "<html>down</html>");

        let error = ApiError::from_body(StatusCode::NOT_FOUND, b"{}");
        assert_eq!(error.code, "Not Found");
    }

    #[test]
    fn test_authentication_error_display() {
        let err = Error::Authentication {
            method: Method::POST,
            url: "https://api.example.com/api/v1/authentication/login".to_string(),
            status: Some(StatusCode::UNAUTHORIZED),
            message: "credentials_invalid".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("authentication failed: POST https://api.example.com"));
        assert!(text.contains("(status 401)"));
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_error_classification() {
        let open = Error::CircuitOpen {
            consecutive_failures: 5,
            retry_in: Duration::from_secs(10),
        };
        assert!(open.is_circuit_open());
        assert!(!open.is_cancellation());
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::DeadlineExceeded.is_cancellation());

        let api = Error::Api {
            status: StatusCode::NOT_FOUND,
            error: Box::new(ApiError::default()),
        };
        assert_eq!(api.status(), Some(StatusCode::NOT_FOUND));
        assert!(api.api_error().is_some());
    }
}
