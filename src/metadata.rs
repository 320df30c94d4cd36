//! Per-call request description supplied by the caller.

use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// Method, path, and extras for a single logical call.
///
/// The path is relative to the client's base URL and may already carry a query
/// string; parameters added with [`with_query_param`](Self::with_query_param) are
/// appended to it.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// The HTTP method (GET, POST, etc.).
    pub method: Method,

    /// The request path, optionally with a query string.
    pub path: String,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Query parameters appended in insertion order.
    pub query_params: Vec<(String, String)>,
}

impl RequestMetadata {
    /// Creates a new `RequestMetadata` with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: Vec::new(),
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Adds multiple query parameters to the request.
    pub fn with_query_params(
        mut self,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.query_params.extend(params);
        self
    }

    /// The path without its query string or fragment.
    pub fn path_only(&self) -> &str {
        self.split_path().0
    }

    pub(crate) fn split_path(&self) -> (&str, Option<&str>) {
        let path = match self.path.find('#') {
            Some(end) => &self.path[..end],
            None => &self.path,
        };
        match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        let metadata = RequestMetadata::new(Method::GET, "/api/v1/transfers?page_num=2#x");
        assert_eq!(metadata.split_path(), ("/api/v1/transfers", Some("page_num=2")));
        assert_eq!(metadata.path_only(), "/api/v1/transfers");

        let metadata = RequestMetadata::new(Method::GET, "/api/v1/transfers");
        assert_eq!(metadata.split_path(), ("/api/v1/transfers", None));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = RequestMetadata::new(Method::GET, "/").with_header("bad header", "v");
        assert!(matches!(result, Err(crate::Error::ConfigurationError(_))));
    }
}
