//! The request executor.
//!
//! [`Client::execute`] runs one logical call: it makes sure a bearer token is
//! available, consults the circuit breaker, attaches the standard headers, sends
//! the request through the retry loop, and feeds the outcome back into the breaker.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    idempotency::{self, IdempotencyKey, IDEMPOTENCY_KEY_HEADER},
    metadata::RequestMetadata,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    token::{Credentials, TokenManager, DEFAULT_LOGIN_PATH, DEFAULT_REFRESH_MARGIN},
    Context, Error, RawResponse, Response, Result,
};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use url::Url;

/// API version sent with every call unless overridden.
pub const DEFAULT_API_VERSION: &str = "2024-09-27";

/// Header carrying the API version.
pub const API_VERSION_HEADER: &str = "x-api-version";

/// Connection pool and timeout settings for the underlying transport.
///
/// TLS 1.2 is the minimum protocol version and certificates are always verified;
/// neither is configurable.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Idle connections kept per host.
    pub max_idle_per_host: usize,
    /// Requests allowed in flight to the API host at once.
    pub max_connections_per_host: usize,
    /// How long an idle pooled connection is kept.
    pub idle_timeout: Duration,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a single attempt, from send to end of body.
    pub request_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            max_connections_per_host: 20,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// A resilient client for a token-authenticated REST API.
///
/// The client is cheap to clone and meant to be shared: clones share the token
/// cache, the circuit breaker, and the connection pool.
///
/// # Examples
///
/// ```no_run
/// use upcall::{Client, Context, Credentials, RequestMetadata};
/// use http::Method;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), upcall::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .credentials(Credentials::new("my-client-id", "my-api-key"))
///     .build()?;
///
/// let ctx = Context::new();
/// let body = json!({ "source_currency": "USD", "amount": 100 });
/// let response = client
///     .execute(&ctx, RequestMetadata::new(Method::POST, "/api/v1/transfers/create"), Some(&body))
///     .await?
///     .error_for_status()?;
/// println!("{}", response.text());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    api_version: HeaderValue,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    circuit_breaker: CircuitBreaker,
    tokens: TokenManager,
    connection_slots: Semaphore,
}

/// A request ready to be sent, identical on every attempt.
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// The breaker guarding this client's API host.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.circuit_breaker
    }

    /// The token manager holding this client's credentials.
    pub fn token_manager(&self) -> &TokenManager {
        &self.inner.tokens
    }

    /// Logs in again regardless of the cached token's expiry.
    pub async fn refresh_token(&self, ctx: &Context) -> Result<()> {
        self.inner.tokens.fetch_token(ctx).await.map(|_| ())
    }

    /// Runs one logical call and returns its final response, whatever its status.
    ///
    /// The body is serialized once and sent byte-identically on every attempt.
    /// Retries follow the client's [`RetryPolicy`]; a non-2xx response is returned as
    /// `Ok` so the caller can inspect it (see [`RawResponse::error_for_status`]).
    ///
    /// # Errors
    ///
    /// - [`Error::Authentication`] when no token could be obtained
    /// - [`Error::CircuitOpen`] when the breaker is open; nothing is sent
    /// - [`Error::Network`] on transport failure
    /// - [`Error::Cancelled`] / [`Error::DeadlineExceeded`] when `ctx` ends first
    pub async fn execute<B>(
        &self,
        ctx: &Context,
        metadata: RequestMetadata,
        body: Option<&B>,
    ) -> Result<RawResponse>
    where
        B: Serialize + ?Sized,
    {
        if let Some(err) = ctx.error() {
            return Err(err);
        }

        let body = body
            .map(|body| {
                serde_json::to_vec(body)
                    .map(Bytes::from)
                    .map_err(|e| Error::SerializationFailed(e.to_string()))
            })
            .transpose()?;

        let token = self.inner.tokens.ensure_valid_token(ctx).await?;

        if let Err(err) = self.inner.circuit_breaker.check() {
            tracing::warn!(
                method = %metadata.method,
                path = %metadata.path,
                error = %err,
                "Rejecting request, circuit breaker open"
            );
            return Err(err);
        }

        let request = self.prepare(&metadata, &token, body)?;
        let result = self.do_with_retry(ctx, &request).await;

        match &result {
            Ok(response) if response.status.is_server_error() => {
                self.inner.circuit_breaker.record_failure()
            }
            Ok(response) => {
                self.inner.circuit_breaker.record_success();
                if response.status == StatusCode::UNAUTHORIZED {
                    tracing::warn!("Access token rejected, dropping cached token");
                    self.inner.tokens.invalidate().await;
                }
            }
            Err(Error::Network(e)) if !e.is_builder() => self.inner.circuit_breaker.record_failure(),
            Err(_) => {}
        }

        result
    }

    /// Builds the URL and headers shared by every attempt of a call.
    fn prepare(
        &self,
        metadata: &RequestMetadata,
        token: &str,
        body: Option<Bytes>,
    ) -> Result<PreparedRequest> {
        let (path, query) = metadata.split_path();

        let mut url = self.inner.base_url.clone();
        url.set_path(path);
        url.set_query(query);
        if !metadata.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &metadata.query_params {
                pairs.append_pair(key, value);
            }
        }

        let mut headers = self.inner.default_headers.clone();
        headers.insert(
            HeaderName::from_static(API_VERSION_HEADER),
            self.inner.api_version.clone(),
        );
        for (name, value) in &metadata.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::ConfigurationError(format!("Invalid access token: {}", e)))?;
        authorization.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, authorization);

        if body.is_some() {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        if let Some(key) = idempotency::key_for(&metadata.method, path) {
            tracing::debug!(idempotency_key = %key, path = %path, "Attaching idempotency key");
            headers.insert(
                HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
                idempotency_header(&key)?,
            );
        }

        Ok(PreparedRequest {
            method: metadata.method.clone(),
            url,
            headers,
            body,
        })
    }

    /// Sends the request until the retry policy says stop.
    async fn do_with_retry(&self, ctx: &Context, request: &PreparedRequest) -> Result<RawResponse> {
        let start_time = Instant::now();
        let mut retry = RetryContext::new(request.method.clone());

        loop {
            retry.attempt += 1;
            let (status, headers, body) = self.send_once(ctx, request, retry.attempt).await?;

            match self.inner.retry_policy.decide(&mut retry, status, &headers) {
                RetryDecision::Stop => {
                    let latency = start_time.elapsed();
                    tracing::info!(
                        method = %request.method,
                        url = %request.url,
                        status = status.as_u16(),
                        latency_ms = latency.as_millis(),
                        attempts = retry.attempt,
                        "Request completed"
                    );
                    return Ok(RawResponse {
                        status,
                        headers,
                        body,
                        latency,
                        attempts: retry.attempt,
                    });
                }
                RetryDecision::Retry { delay, reason } => {
                    tracing::warn!(
                        method = %request.method,
                        url = %request.url,
                        status = status.as_u16(),
                        attempt = retry.attempt,
                        delay_ms = delay.as_millis(),
                        reason = ?reason,
                        "Retrying request after delay"
                    );
                    ctx.sleep(delay).await?;
                }
            }
        }
    }

    /// Executes a single attempt and reads its body.
    async fn send_once(
        &self,
        ctx: &Context,
        request: &PreparedRequest,
        attempt: usize,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let _permit = ctx
            .run(self.inner.connection_slots.acquire())
            .await?
            .map_err(|_| Error::ConfigurationError("connection limiter closed".to_string()))?;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            attempt = attempt,
            "Executing HTTP request"
        );

        let mut builder = self
            .inner
            .http_client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = ctx.run(builder.send()).await?.map_err(|e| {
            tracing::warn!(error = %e, attempt = attempt, "Transport error");
            Error::Network(e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = ctx.run(response.bytes()).await??;

        if status.is_server_error() {
            tracing::warn!(
                status = status.as_u16(),
                attempt = attempt,
                response = %String::from_utf8_lossy(&body),
                "Server error (5xx)"
            );
        } else if status.is_client_error() {
            tracing::debug!(status = status.as_u16(), attempt = attempt, "Client error (4xx)");
        }

        Ok((status, headers, body))
    }

    /// Makes a call and decodes a 2xx JSON body.
    ///
    /// Non-2xx final responses become [`Error::Api`].
    pub async fn request<Req, Res>(
        &self,
        ctx: &Context,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.execute(ctx, metadata, body).await?.into_typed()
    }

    /// Makes a GET request to the specified path.
    pub async fn get<Res>(&self, ctx: &Context, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::GET, path);
        self.request::<(), Res>(ctx, metadata, None).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    pub async fn post<Req, Res>(
        &self,
        ctx: &Context,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::POST, path);
        self.request(ctx, metadata, Some(body)).await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<Req, Res>(
        &self,
        ctx: &Context,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PUT, path);
        self.request(ctx, metadata, Some(body)).await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        ctx: &Context,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PATCH, path);
        self.request(ctx, metadata, Some(body)).await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<Res>(&self, ctx: &Context, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::DELETE, path);
        self.request::<(), Res>(ctx, metadata, None).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("tokens", &self.inner.tokens)
            .field("circuit_breaker", &self.inner.circuit_breaker)
            .finish_non_exhaustive()
    }
}

fn idempotency_header(key: &IdempotencyKey) -> Result<HeaderValue> {
    HeaderValue::from_str(key.as_str())
        .map_err(|e| Error::ConfigurationError(format!("Invalid idempotency key: {}", e)))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use upcall::{ClientBuilder, CircuitBreakerConfig, Credentials, RetryPolicy, TransportConfig};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), upcall::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .credentials(Credentials::new("my-client-id", "my-api-key"))
///     .api_version("2024-09-27")
///     .timeout(Duration::from_secs(30))
///     .retry_policy(RetryPolicy::default())
///     .circuit_breaker(CircuitBreakerConfig {
///         cooldown: Duration::from_secs(60),
///         ..Default::default()
///     })
///     .transport(TransportConfig {
///         max_connections_per_host: 8,
///         ..Default::default()
///     })
///     .default_header("User-Agent", "my-cli/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    credentials: Option<Credentials>,
    api_version: String,
    login_path: String,
    token_refresh_margin: Duration,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    circuit_breaker: CircuitBreakerConfig,
    transport: TransportConfig,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            credentials: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            token_refresh_margin: DEFAULT_REFRESH_MARGIN,
            default_headers: HeaderMap::new(),
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Sets the credentials used to obtain bearer tokens.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the value of the `x-api-version` header.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Sets the login endpoint path, relative to the base URL.
    pub fn login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Sets how long before expiry a cached token is refreshed.
    pub fn token_refresh_margin(mut self, margin: Duration) -> Self {
        self.token_refresh_margin = margin;
        self
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Sets the transport configuration.
    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    /// Sets the per-attempt request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.transport.request_timeout = Some(timeout);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or credentials are missing, or if the
    /// configuration is invalid.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| Error::ConfigurationError("Credentials are required".to_string()))?;

        if self.transport.max_connections_per_host == 0 {
            return Err(Error::ConfigurationError(
                "max_connections_per_host must be at least 1".to_string(),
            ));
        }

        let api_version = HeaderValue::from_str(&self.api_version)
            .map_err(|e| Error::ConfigurationError(format!("Invalid API version: {}", e)))?;

        let mut http_builder = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_max_idle_per_host(self.transport.max_idle_per_host)
            .pool_idle_timeout(self.transport.idle_timeout)
            .connect_timeout(self.transport.connect_timeout);
        if let Some(timeout) = self.transport.request_timeout {
            http_builder = http_builder.timeout(timeout);
        }
        let http_client = http_builder.build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        let login_url = base_url.join(&self.login_path)?;
        let tokens = TokenManager::new(
            http_client.clone(),
            login_url,
            credentials,
            self.token_refresh_margin,
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                api_version,
                default_headers: self.default_headers,
                retry_policy: self.retry_policy,
                circuit_breaker: CircuitBreaker::new(self.circuit_breaker),
                tokens,
                connection_slots: Semaphore::new(self.transport.max_connections_per_host),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::builder()
            .base_url("https://api.example.com")
            .unwrap()
            .credentials(Credentials::new("id", "key"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_credentials() {
        let result = Client::builder()
            .base_url("https://api.example.com")
            .unwrap()
            .build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_build_requires_base_url() {
        let result = Client::builder()
            .credentials(Credentials::new("id", "key"))
            .build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_login_url_resolved_against_base() {
        let client = client();
        assert_eq!(
            client.token_manager().login_url().as_str(),
            "https://api.example.com/api/v1/authentication/login"
        );
    }

    #[test]
    fn test_prepare_attaches_standard_headers() {
        let client = client();
        let metadata = RequestMetadata::new(Method::POST, "/api/v1/transfers/create?x=1")
            .with_query_param("y", "2");
        let request = client
            .prepare(&metadata, "tok", Some(Bytes::from_static(b"{}")))
            .unwrap();

        assert_eq!(
            request.url.as_str(),
            "https://api.example.com/api/v1/transfers/create?x=1&y=2"
        );
        assert_eq!(request.headers[header::AUTHORIZATION], "Bearer tok");
        assert!(request.headers[header::AUTHORIZATION].is_sensitive());
        assert_eq!(request.headers[API_VERSION_HEADER], DEFAULT_API_VERSION);
        assert_eq!(request.headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(request.headers[IDEMPOTENCY_KEY_HEADER].len(), 32);
    }

    #[test]
    fn test_prepare_skips_idempotency_for_other_paths() {
        let client = client();
        for metadata in [
            RequestMetadata::new(Method::POST, "/api/v1/transfers/create-preview"),
            RequestMetadata::new(Method::GET, "/api/v1/transfers/create"),
            RequestMetadata::new(Method::POST, "/api/v1/reports/create"),
        ] {
            let request = client.prepare(&metadata, "tok", None).unwrap();
            assert!(!request.headers.contains_key(IDEMPOTENCY_KEY_HEADER));
            assert!(!request.headers.contains_key(header::CONTENT_TYPE));
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_before_any_io() {
        let client = client();
        let ctx = Context::new();
        ctx.cancel();

        let result = client
            .execute::<()>(&ctx, RequestMetadata::new(Method::GET, "/api/v1/balances"), None)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_serialization_failure_before_any_io() {
        use std::collections::HashMap;

        let client = client();
        // non-string map keys cannot be serialized to JSON
        let mut body = HashMap::new();
        body.insert(vec![1u8], "value");

        let result = client
            .execute(
                &Context::new(),
                RequestMetadata::new(Method::POST, "/api/v1/things"),
                Some(&body),
            )
            .await;
        assert!(matches!(result, Err(Error::SerializationFailed(_))));
    }
}
